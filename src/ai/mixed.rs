//! Session supervisor: a registry of named sessions plus the active one.
//!
//! Every contract method routes to the active session; management verbs
//! (create/remove/switch/rename) mutate the registry.  Config loading is
//! tolerant: one malformed entry must never take its siblings down.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::{LlsError, LlsResult};

use super::client::AiContext;
use super::{
    message_stream, session_from_config, AiSession, ConfigValue, TokenStream,
};

#[derive(Default)]
pub struct MixedSession {
    // BTreeMap keeps iteration deterministic, which makes config
    // round-trips stable and removal reassignment predictable.
    sessions: BTreeMap<String, Box<dyn AiSession>>,
    current: Option<String>,
}

impl MixedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: &str, session: Box<dyn AiSession>) {
        self.sessions.insert(id.to_string(), session);
    }

    /// Remove a session.  If it was active, the first surviving id (in key
    /// order) takes over; with none left the active pointer clears.
    pub fn remove(&mut self, id: &str) -> LlsResult<()> {
        if self.sessions.remove(id).is_none() {
            return Err(LlsError::Session(format!("no such session '{id}'")));
        }
        if self.current.as_deref() == Some(id) {
            self.current = self.sessions.keys().next().cloned();
        }
        Ok(())
    }

    pub fn switch(&mut self, id: &str) -> LlsResult<()> {
        if !self.sessions.contains_key(id) {
            return Err(LlsError::Session(format!("no such session '{id}'")));
        }
        self.current = Some(id.to_string());
        Ok(())
    }

    pub fn rename(&mut self, id: &str, new_id: &str) -> LlsResult<()> {
        let session = self
            .sessions
            .remove(id)
            .ok_or_else(|| LlsError::Session(format!("no such session '{id}'")))?;
        self.sessions.insert(new_id.to_string(), session);
        if self.current.as_deref() == Some(id) {
            self.current = Some(new_id.to_string());
        }
        Ok(())
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.sessions.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active(&self) -> Option<&dyn AiSession> {
        self.current
            .as_deref()
            .and_then(|id| self.sessions.get(id))
            .map(|b| b.as_ref())
    }

    fn active_mut(&mut self) -> Option<&mut Box<dyn AiSession>> {
        let id = self.current.clone()?;
        self.sessions.get_mut(&id)
    }

    pub fn type_of(&self, id: &str) -> Option<&'static str> {
        self.sessions.get(id).map(|s| s.type_tag())
    }

    /// Load the `{current_ai_id, ai: {id: {id, type, config}}}` layout.
    /// Per-entry failures are logged and skipped.
    pub fn from_config(ctx: &Arc<AiContext>, config: &serde_json::Value) -> Self {
        let mut s = MixedSession::new();
        if let Some(entries) = config.get("ai").and_then(|v| v.as_object()) {
            for (key, entry) in entries {
                let id = entry
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(key.as_str());
                let tag = entry.get("type").and_then(|v| v.as_str()).unwrap_or("");
                let empty = serde_json::Value::Null;
                let conf = entry.get("config").unwrap_or(&empty);
                match session_from_config(ctx, tag, conf) {
                    Ok(session) => s.add(id, session),
                    Err(e) => log::warn!("parse session config '{id}' failed: {e}"),
                }
            }
        }
        if let Some(id) = config.get("current_ai_id").and_then(|v| v.as_str()) {
            if let Err(e) = s.switch(id) {
                log::warn!("restore active session failed: {e}");
            }
        }
        s
    }

    pub fn save_config(&self) -> serde_json::Value {
        let mut entries = serde_json::Map::new();
        for (id, session) in &self.sessions {
            entries.insert(
                id.clone(),
                serde_json::json!({
                    "id": id,
                    "type": session.type_tag(),
                    "config": session.save_config(),
                }),
            );
        }
        serde_json::json!({
            "current_ai_id": self.current,
            "ai": entries,
        })
    }
}

impl AiSession for MixedSession {
    fn type_tag(&self) -> &'static str {
        "mixed"
    }

    fn generate(&self, instruct: &str, console: &str) -> TokenStream {
        match self.active() {
            Some(session) => session.generate(instruct, console),
            None => message_stream("no selected session"),
        }
    }

    fn save(&mut self, instruct: Option<&str>, console: &str, output: &str) {
        if let Some(session) = self.active_mut() {
            session.save(instruct, console, output);
        }
    }

    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.active().and_then(|s| s.get(key))
    }

    fn set(&mut self, key: &str, value: &str) -> LlsResult<()> {
        match self.active_mut() {
            Some(session) => session.set(key, value),
            None => Err(LlsError::Session("no selected session".to_string())),
        }
    }

    fn config_pairs(&self) -> Vec<(&'static str, ConfigValue)> {
        self.active().map(|s| s.config_pairs()).unwrap_or_default()
    }

    fn transcript(&self, simple: bool, width: usize) -> String {
        match self.active() {
            Some(session) => session.transcript(simple, width),
            None => "no selected session\r\n".to_string(),
        }
    }

    fn save_config(&self) -> serde_json::Value {
        MixedSession::save_config(self)
    }
}
