//! Text-completion session: stateless apart from its prompt template, with
//! an optional declarative post-processing step applied after the stream
//! ends.

use std::sync::Arc;

use regex::Regex;

use crate::errors::{LlsError, LlsResult};

use super::client::AiContext;
use super::{fill_template, AiSession, CommandStream, ConfigValue, TokenStream};

pub const DEFAULT_PROMPT_TEMPLATE: &str = "\
You are a capable assistant. Based on the user's instruction and the current \
shell console output, produce one shell command that satisfies the \
instruction. Your output is sent directly to the console and executed, so do \
not output anything besides the shell command itself. Do not wrap the command \
in quotes and do not format it.

The current instruction:
{instruct}

The current console output:
{console}

The shell command:
";

/// Declarative output transformations, selected by the `post_processor`
/// config key.  Applied to the final command once the stream completes.
#[derive(Clone, Debug)]
pub enum PostProcessor {
    /// Drop code fences and surrounding backticks.
    StripBackticks,
    /// Drop one layer of matching single or double quotes.
    StripQuotes,
    /// Keep only the first non-empty line.
    FirstLine,
    /// `regex:<pattern>=><replacement>`, applied with `replace_all`.
    RegexReplace(Regex, String),
}

impl PostProcessor {
    /// Parse the config string; empty disables post-processing.
    pub fn parse(spec: &str) -> LlsResult<Option<PostProcessor>> {
        let spec = spec.trim();
        match spec {
            "" => Ok(None),
            "strip-backticks" => Ok(Some(PostProcessor::StripBackticks)),
            "strip-quotes" => Ok(Some(PostProcessor::StripQuotes)),
            "first-line" => Ok(Some(PostProcessor::FirstLine)),
            _ => {
                if let Some(rest) = spec.strip_prefix("regex:") {
                    let (pattern, replacement) = rest.split_once("=>").ok_or_else(|| {
                        LlsError::Config(
                            "regex post-processor needs the form regex:<pattern>=><replacement>"
                                .to_string(),
                        )
                    })?;
                    let re = Regex::new(pattern)
                        .map_err(|e| LlsError::Config(format!("bad regex: {e}")))?;
                    Ok(Some(PostProcessor::RegexReplace(
                        re,
                        replacement.to_string(),
                    )))
                } else {
                    Err(LlsError::Config(format!(
                        "unknown post-processor '{spec}' (strip-backticks, strip-quotes, \
                         first-line, regex:<pattern>=><replacement>)"
                    )))
                }
            }
        }
    }

    pub fn apply(&self, cmd: String, think: String) -> (String, String) {
        let cmd = match self {
            PostProcessor::StripBackticks => {
                let no_fences: Vec<&str> = cmd
                    .lines()
                    .filter(|l| !l.trim_start().starts_with("```"))
                    .collect();
                no_fences
                    .join("\n")
                    .trim()
                    .trim_matches('`')
                    .trim()
                    .to_string()
            }
            PostProcessor::StripQuotes => {
                let t = cmd.trim();
                let stripped = t
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| t.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
                stripped.unwrap_or(t).to_string()
            }
            PostProcessor::FirstLine => cmd
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("")
                .trim()
                .to_string(),
            PostProcessor::RegexReplace(re, replacement) => {
                re.replace_all(&cmd, replacement.as_str()).into_owned()
            }
        };
        (cmd, think)
    }
}

pub struct TextSession {
    ctx: Arc<AiContext>,
    pub model: String,
    pub prompt_template: String,
    /// Raw post-processor spec; kept as entered for config round trips.
    pub post_processor: Option<String>,
}

impl TextSession {
    pub fn new(ctx: Arc<AiContext>) -> Self {
        TextSession {
            model: ctx.default_model.clone(),
            ctx,
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            post_processor: None,
        }
    }

    pub fn from_config(ctx: Arc<AiContext>, config: &serde_json::Value) -> Self {
        let mut s = TextSession::new(ctx);
        if let Some(m) = config.get("model").and_then(|v| v.as_str()) {
            s.model = m.to_string();
        }
        if let Some(t) = config.get("prompt_template").and_then(|v| v.as_str()) {
            s.prompt_template = t.to_string();
        }
        if let Some(p) = config.get("post_processor").and_then(|v| v.as_str()) {
            if let Err(e) = PostProcessor::parse(p) {
                log::warn!("ignoring invalid post_processor in config: {e}");
            } else if !p.is_empty() {
                s.post_processor = Some(p.to_string());
            }
        }
        s
    }
}

impl AiSession for TextSession {
    fn type_tag(&self) -> &'static str {
        "text"
    }

    fn generate(&self, instruct: &str, console: &str) -> TokenStream {
        let prompt = fill_template(&self.prompt_template, instruct, console);
        let post = self
            .post_processor
            .as_deref()
            .and_then(|p| PostProcessor::parse(p).unwrap_or(None));
        let ctx = self.ctx.clone();
        let model = self.model.clone();
        Box::new(CommandStream::with_post(
            Box::new(move || ctx.completion_stream(&model, &prompt)),
            post,
        ))
    }

    fn save(&mut self, _instruct: Option<&str>, _console: &str, _output: &str) {
        // Stateless: nothing to persist between exchanges.
    }

    fn get(&self, key: &str) -> Option<ConfigValue> {
        Some(match key {
            "model" => ConfigValue::Str(self.model.clone()),
            "prompt_template" => ConfigValue::Str(self.prompt_template.clone()),
            "post_processor" => {
                ConfigValue::Str(self.post_processor.clone().unwrap_or_default())
            }
            _ => return None,
        })
    }

    fn set(&mut self, key: &str, value: &str) -> LlsResult<()> {
        match key {
            "model" => self.model = value.to_string(),
            "prompt_template" => self.prompt_template = value.to_string(),
            "post_processor" => {
                // Validate before storing.
                PostProcessor::parse(value)?;
                self.post_processor = if value.trim().is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => return Err(LlsError::Config(format!("no such config key '{key}'"))),
        }
        Ok(())
    }

    fn config_pairs(&self) -> Vec<(&'static str, ConfigValue)> {
        ["model", "post_processor", "prompt_template"]
            .iter()
            .filter_map(|k| self.get(k).map(|v| (*k, v)))
            .collect()
    }

    fn transcript(&self, _simple: bool, _width: usize) -> String {
        format!("{}\r\n", self.prompt_template.replace('\n', "\r\n"))
    }

    fn save_config(&self) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "prompt_template": self.prompt_template,
            "post_processor": self.post_processor,
        })
    }
}
