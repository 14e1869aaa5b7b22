//! Model sessions: a uniform streaming generate/save/configure contract.
//!
//! Every session yields `(cmd, think)` accumulator pairs: `cmd` is the
//! best-so-far shell command, `think` any reasoning text the model wrapped
//! in `<think>…</think>`.  The first pair is always empty so consumers can
//! draw a waiting state before the first token arrives.

pub mod chat;
pub mod client;
pub mod mixed;
pub mod text;

use std::fmt;

use crate::errors::{LlsError, LlsResult};

use self::client::SseStream;

/// Lazy, finite stream of `(cmd, think)` pairs.  Not restartable; a new
/// `generate` call produces a fresh stream.
pub type TokenStream = Box<dyn Iterator<Item = (String, String)> + Send>;

/// One configurable session attribute.  `set` coerces input to the
/// attribute's existing scalar type.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Int(_) => "int",
            ConfigValue::Float(_) => "float",
            ConfigValue::Str(_) => "str",
        }
    }

    /// Parse `input` into this value's type.
    pub fn coerced_from(&self, input: &str) -> LlsResult<ConfigValue> {
        match self {
            ConfigValue::Int(_) => input
                .trim()
                .parse::<i64>()
                .map(ConfigValue::Int)
                .map_err(|_| LlsError::Config(format!("expected an integer, got '{input}'"))),
            ConfigValue::Float(_) => input
                .trim()
                .parse::<f64>()
                .map(ConfigValue::Float)
                .map_err(|_| LlsError::Config(format!("expected a number, got '{input}'"))),
            ConfigValue::Str(_) => Ok(ConfigValue::Str(input.to_string())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Int(v) => write!(f, "{}", v),
            ConfigValue::Float(v) => write!(f, "{}", v),
            ConfigValue::Str(v) => write!(f, "{}", v),
        }
    }
}

/// The uniform session contract.
pub trait AiSession: Send {
    /// Registry tag (`chat`, `text`, …).
    fn type_tag(&self) -> &'static str;

    /// Start a generation for `instruct` against the given console context.
    fn generate(&self, instruct: &str, console: &str) -> TokenStream;

    /// Commit a completed exchange into the transcript.  `None` falls back
    /// to the session's default instruction.
    fn save(&mut self, instruct: Option<&str>, console: &str, output: &str);

    fn get(&self, key: &str) -> Option<ConfigValue>;

    fn set(&mut self, key: &str, value: &str) -> LlsResult<()>;

    /// All configuration attributes, sorted by key.
    fn config_pairs(&self) -> Vec<(&'static str, ConfigValue)>;

    /// Human-readable transcript (or template) for the `chat` command.
    fn transcript(&self, simple: bool, width: usize) -> String;

    fn save_config(&self) -> serde_json::Value;
}

/// Split a raw model output into `(cmd, think)`.
///
/// A `<think>` marker is removed and the text up to the first `</think>` is
/// the reasoning; whatever follows is the command.  Both halves are
/// whitespace-trimmed.
pub fn convert_output(output: &str) -> (String, String) {
    if output.contains("<think>") {
        let cleaned = output.replace("<think>", "");
        let mut parts = cleaned.splitn(2, "</think>");
        let think = parts.next().unwrap_or("").trim().to_string();
        let cmd = parts.next().unwrap_or("").trim().to_string();
        (cmd, think)
    } else {
        (output.trim().to_string(), String::new())
    }
}

/// Substitute the `{instruct}` / `{console}` markers of a prompt template.
pub fn fill_template(template: &str, instruct: &str, console: &str) -> String {
    template
        .replace("{instruct}", instruct)
        .replace("{console}", console)
}

/// Stream that carries a fixed think-message (used when no session is
/// selected); still leads with the empty pair.
pub fn message_stream(message: &str) -> TokenStream {
    Box::new(
        vec![
            (String::new(), String::new()),
            (String::new(), message.to_string()),
        ]
        .into_iter(),
    )
}

/// Driver shared by the chat and text sessions: opens the HTTP stream on
/// first demand, accumulates deltas, converts each step, and turns backend
/// failures into a single terminal `("error: …", "")` pair.
pub struct CommandStream {
    start: Option<Box<dyn FnOnce() -> LlsResult<SseStream> + Send>>,
    inner: Option<SseStream>,
    output: String,
    last: (String, String),
    started: bool,
    finished: bool,
    post: Option<text::PostProcessor>,
}

impl CommandStream {
    pub fn new(start: Box<dyn FnOnce() -> LlsResult<SseStream> + Send>) -> Self {
        CommandStream {
            start: Some(start),
            inner: None,
            output: String::new(),
            last: (String::new(), String::new()),
            started: false,
            finished: false,
            post: None,
        }
    }

    /// Apply `post` once, after the inner stream ends, yielding one final
    /// transformed pair.
    pub fn with_post(
        start: Box<dyn FnOnce() -> LlsResult<SseStream> + Send>,
        post: Option<text::PostProcessor>,
    ) -> Self {
        let mut s = Self::new(start);
        s.post = post;
        s
    }
}

impl Iterator for CommandStream {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            return Some((String::new(), String::new()));
        }
        if self.finished {
            return None;
        }
        if self.inner.is_none() {
            let start = self.start.take()?;
            match start() {
                Ok(stream) => self.inner = Some(stream),
                Err(e) => {
                    self.finished = true;
                    return Some((format!("error: {e}"), String::new()));
                }
            }
        }
        match self.inner.as_mut().and_then(|s| s.next()) {
            Some(Ok(delta)) => {
                self.output.push_str(&delta);
                self.last = convert_output(&self.output);
                Some(self.last.clone())
            }
            Some(Err(e)) => {
                self.finished = true;
                Some((format!("error: {e}"), String::new()))
            }
            None => {
                self.finished = true;
                self.post.take().map(|p| {
                    let (cmd, think) = self.last.clone();
                    p.apply(cmd, think)
                })
            }
        }
    }
}

/// Construct a fresh session of the given type.
pub fn create_session(
    ctx: &std::sync::Arc<client::AiContext>,
    tag: &str,
) -> LlsResult<Box<dyn AiSession>> {
    match tag {
        "chat" => Ok(Box::new(chat::ChatSession::new(ctx.clone()))),
        "text" => Ok(Box::new(text::TextSession::new(ctx.clone()))),
        other => Err(LlsError::Session(format!("unknown session type '{other}'"))),
    }
}

/// Re-instantiate a session from its persisted `{type, config}` entry.
pub fn session_from_config(
    ctx: &std::sync::Arc<client::AiContext>,
    tag: &str,
    config: &serde_json::Value,
) -> LlsResult<Box<dyn AiSession>> {
    match tag {
        "chat" => Ok(Box::new(chat::ChatSession::from_config(ctx.clone(), config))),
        "text" => Ok(Box::new(text::TextSession::from_config(ctx.clone(), config))),
        other => Err(LlsError::Session(format!("unknown session type '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_output_plain_command() {
        assert_eq!(convert_output("cmd"), ("cmd".into(), "".into()));
        assert_eq!(convert_output("  ls -la \n"), ("ls -la".into(), "".into()));
    }

    #[test]
    fn test_convert_output_think_block() {
        assert_eq!(
            convert_output("<think>t</think>c"),
            ("c".into(), "t".into())
        );
    }

    #[test]
    fn test_convert_output_unclosed_think() {
        // Still streaming the reasoning: everything is think so far.
        assert_eq!(
            convert_output("<think>partial reas"),
            ("".into(), "partial reas".into())
        );
    }

    #[test]
    fn test_convert_output_ends_at_close_tag() {
        let (cmd, think) = convert_output("<think> reason </think>");
        assert_eq!(cmd, "");
        assert_eq!(think, "reason");
    }

    #[test]
    fn test_fill_template() {
        assert_eq!(
            fill_template("do {instruct} on {console}", "X", "Y"),
            "do X on Y"
        );
        // Templates without markers pass through untouched.
        assert_eq!(fill_template("static", "X", "Y"), "static");
    }

    #[test]
    fn test_message_stream_leads_with_empty_pair() {
        let items: Vec<_> = message_stream("no selected session").collect();
        assert_eq!(items[0], ("".into(), "".into()));
        assert_eq!(items[1], ("".into(), "no selected session".into()));
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_command_stream_reports_start_failure_once() {
        let mut s = CommandStream::new(Box::new(|| {
            Err(LlsError::Generate("connection refused".into()))
        }));
        assert_eq!(s.next(), Some(("".into(), "".into())));
        let (cmd, think) = s.next().unwrap();
        assert!(cmd.starts_with("error: "));
        assert!(cmd.contains("connection refused"));
        assert_eq!(think, "");
        assert_eq!(s.next(), None);
    }

    #[test]
    fn test_config_value_coercion() {
        let v = ConfigValue::Int(30);
        assert_eq!(v.coerced_from("50").unwrap(), ConfigValue::Int(50));
        assert!(v.coerced_from("abc").is_err());
        let v = ConfigValue::Str("x".into());
        assert_eq!(v.coerced_from("99").unwrap(), ConfigValue::Str("99".into()));
        let v = ConfigValue::Float(0.5);
        assert_eq!(v.coerced_from("1.5").unwrap(), ConfigValue::Float(1.5));
    }
}
