//! Conversational session: an ordered transcript plus a synthetic user
//! message built from the instruction and the visible console.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{LlsError, LlsResult};

use super::client::{AiContext, WireMessage};
use super::{fill_template, AiSession, CommandStream, ConfigValue, TokenStream};

pub const DEFAULT_SYSTEM_INSTRUCT: &str = "\
You are a capable assistant. Based on the user's instruction and the current \
shell console output, produce one shell command that satisfies the \
instruction. Your output is sent directly to the console and executed, so do \
not output anything besides the shell command itself. Do not wrap the command \
in quotes and do not format it.

For example, if the instruction is \"list files\", output the following line:
ls

For example, if the instruction is \"list all files with details\", output the following line:
ls -la

For example, if the instruction is \"list files with details\", output the following line:
ls -l

For example, if the instruction is \"list all files\", output the following line:
ls -a
";

pub const DEFAULT_USER_TEMPLATE: &str = "\
Produce one shell command that satisfies the user's instruction.

The current instruction:
{instruct}

The current console output:
{console}
";

pub const DEFAULT_INSTRUCT: &str = "continue";

/// One transcript entry.  Synthetic user messages keep the raw instruction
/// and console snapshot alongside the rendered content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruct: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<String>,
}

impl Message {
    pub fn plain(role: &str, content: &str) -> Self {
        Message {
            role: role.to_string(),
            content: content.to_string(),
            instruct: None,
            console: None,
        }
    }
}

pub struct ChatSession {
    ctx: Arc<AiContext>,
    pub model: String,
    pub user: String,
    pub assistant: String,
    pub system: String,
    pub system_instruct: Option<String>,
    pub user_template: String,
    pub default_instruct: String,
    /// Lines kept from the bottom of the console context.
    pub console_max_height: i64,
    pub messages: Vec<Message>,
}

impl ChatSession {
    pub fn new(ctx: Arc<AiContext>) -> Self {
        let mut s = ChatSession {
            model: ctx.default_model.clone(),
            ctx,
            user: "user".to_string(),
            assistant: "assistant".to_string(),
            system: "system".to_string(),
            system_instruct: Some(DEFAULT_SYSTEM_INSTRUCT.to_string()),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
            default_instruct: DEFAULT_INSTRUCT.to_string(),
            console_max_height: 30,
            messages: Vec::new(),
        };
        s.seed_system_message();
        s
    }

    fn seed_system_message(&mut self) {
        if let Some(instruct) = self.system_instruct.clone() {
            let system = self.system.clone();
            self.messages.push(Message::plain(&system, &instruct));
        }
    }

    /// Build the synthetic user message: console truncated to the last
    /// `console_max_height` lines, then the template filled in.
    pub fn create_user_message(&self, instruct: &str, console: &str) -> Message {
        let lines: Vec<&str> = console.split('\n').collect();
        let keep = self.console_max_height.max(0) as usize;
        let console = if lines.len() > keep {
            lines[lines.len() - keep..].join("\n")
        } else {
            console.to_string()
        };
        Message {
            role: self.user.clone(),
            content: fill_template(&self.user_template, instruct, &console),
            instruct: Some(instruct.to_string()),
            console: Some(console),
        }
    }

    pub fn from_config(ctx: Arc<AiContext>, config: &serde_json::Value) -> Self {
        let mut s = ChatSession::new(ctx);
        s.messages.clear();
        let get_str = |key: &str, default: &str| -> String {
            config
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or(default)
                .to_string()
        };
        s.model = get_str("model", &s.model.clone());
        s.user = get_str("user", "user");
        s.assistant = get_str("assistant", "assistant");
        s.system = get_str("system", "system");
        s.user_template = get_str("user_template", DEFAULT_USER_TEMPLATE);
        s.default_instruct = get_str("default_instruct", DEFAULT_INSTRUCT);
        s.system_instruct = match config.get("system_instruct") {
            None => Some(DEFAULT_SYSTEM_INSTRUCT.to_string()),
            Some(serde_json::Value::Null) => None,
            Some(v) => v.as_str().map(str::to_string),
        };
        if let Some(h) = config.get("console_max_height").and_then(|v| v.as_i64()) {
            s.console_max_height = h;
        }
        s.seed_system_message();
        s
    }
}

impl AiSession for ChatSession {
    fn type_tag(&self) -> &'static str {
        "chat"
    }

    fn generate(&self, instruct: &str, console: &str) -> TokenStream {
        let mut wire: Vec<WireMessage> = self
            .messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect();
        let synthetic = self.create_user_message(instruct, console);
        wire.push(WireMessage {
            role: synthetic.role,
            content: synthetic.content,
        });
        let ctx = self.ctx.clone();
        let model = self.model.clone();
        Box::new(CommandStream::new(Box::new(move || {
            ctx.chat_stream(&model, &wire)
        })))
    }

    fn save(&mut self, instruct: Option<&str>, console: &str, output: &str) {
        let instruct = instruct.unwrap_or(&self.default_instruct).to_string();
        let user = self.create_user_message(&instruct, console);
        let assistant = Message::plain(&self.assistant.clone(), output);
        self.messages.push(user);
        self.messages.push(assistant);
    }

    fn get(&self, key: &str) -> Option<ConfigValue> {
        Some(match key {
            "model" => ConfigValue::Str(self.model.clone()),
            "user" => ConfigValue::Str(self.user.clone()),
            "assistant" => ConfigValue::Str(self.assistant.clone()),
            "system" => ConfigValue::Str(self.system.clone()),
            "system_instruct" => {
                ConfigValue::Str(self.system_instruct.clone().unwrap_or_default())
            }
            "user_template" => ConfigValue::Str(self.user_template.clone()),
            "default_instruct" => ConfigValue::Str(self.default_instruct.clone()),
            "console_max_height" => ConfigValue::Int(self.console_max_height),
            _ => return None,
        })
    }

    fn set(&mut self, key: &str, value: &str) -> LlsResult<()> {
        let old = self
            .get(key)
            .ok_or_else(|| LlsError::Config(format!("no such config key '{key}'")))?;
        let new = old.coerced_from(value)?;
        match (key, new) {
            ("model", ConfigValue::Str(v)) => self.model = v,
            ("user", ConfigValue::Str(v)) => self.user = v,
            ("assistant", ConfigValue::Str(v)) => self.assistant = v,
            ("system", ConfigValue::Str(v)) => self.system = v,
            ("system_instruct", ConfigValue::Str(v)) => self.system_instruct = Some(v),
            ("user_template", ConfigValue::Str(v)) => self.user_template = v,
            ("default_instruct", ConfigValue::Str(v)) => self.default_instruct = v,
            ("console_max_height", ConfigValue::Int(v)) => self.console_max_height = v,
            _ => return Err(LlsError::Config(format!("no such config key '{key}'"))),
        }
        Ok(())
    }

    fn config_pairs(&self) -> Vec<(&'static str, ConfigValue)> {
        let keys = [
            "assistant",
            "console_max_height",
            "default_instruct",
            "model",
            "system",
            "system_instruct",
            "user",
            "user_template",
        ];
        keys.iter()
            .filter_map(|k| self.get(k).map(|v| (*k, v)))
            .collect()
    }

    fn transcript(&self, simple: bool, width: usize) -> String {
        let mut out = String::new();
        let rule = format!("+{}+\r\n", "-".repeat(width.saturating_sub(2)));
        for m in &self.messages {
            let content = if simple && m.role == self.user {
                m.instruct.as_deref().unwrap_or(&m.content)
            } else {
                &m.content
            };
            out.push_str(&format!(
                "{}: {}\r\n",
                m.role.to_uppercase(),
                content.replace('\n', "\r\n")
            ));
            out.push_str(&rule);
        }
        out
    }

    fn save_config(&self) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "user": self.user,
            "user_template": self.user_template,
            "assistant": self.assistant,
            "system": self.system,
            "system_instruct": self.system_instruct,
            "default_instruct": self.default_instruct,
            "console_max_height": self.console_max_height,
        })
    }
}
