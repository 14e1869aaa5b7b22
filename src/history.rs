//! Persistent state: the scroll-off log, per-editor recall history, the
//! session registry, and the accepted-command log.
//!
//! Everything here is best-effort: a missing or unreadable file yields
//! empty state, a failed save is reported but never aborts the session.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::editor::EditBuffers;
use crate::screen::HistorySink;

pub const LOG_BEGIN: &str = "[lls is beginning]";
pub const LOG_END: &str = "[lls is terminating]";

/// Append-only scroll-off log, bracketed by session markers.
pub struct ScrollOffLog {
    file: File,
}

impl ScrollOffLog {
    pub fn open(path: &Path) -> io::Result<ScrollOffLog> {
        let mut file = OpenOptions::new().append(true).create(true).open(path)?;
        writeln!(file, "{}", LOG_BEGIN)?;
        Ok(ScrollOffLog { file })
    }
}

impl HistorySink for ScrollOffLog {
    fn write_line(&mut self, line: &str) {
        let _ = writeln!(self.file, "{}", line);
    }

    fn close(&mut self) {
        let _ = writeln!(self.file, "{}", LOG_END);
        let _ = self.file.flush();
    }
}

/// Restore the per-id recall buffers from their JSON line lists.
pub fn load_edit_buffers(path: &Path) -> EditBuffers {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return EditBuffers::new(),
    };
    match serde_json::from_str::<HashMap<String, Vec<String>>>(&content) {
        Ok(lists) => EditBuffers::from_lists(lists),
        Err(e) => {
            log::warn!("could not parse {}: {}", path.display(), e);
            EditBuffers::new()
        }
    }
}

pub fn save_edit_buffers(path: &Path, bufs: &EditBuffers) -> io::Result<()> {
    let json = serde_json::to_string(&bufs.to_lists())
        .map_err(|e| io::Error::other(e.to_string()))?;
    fs::write(path, json)
}

/// Load the persisted session registry, if any.
pub fn load_ai_config(path: &Path) -> Option<serde_json::Value> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("could not parse {}: {}", path.display(), e);
            None
        }
    }
}

pub fn save_ai_config(path: &Path, config: &serde_json::Value) -> io::Result<()> {
    fs::write(path, config.to_string())
}

/// Record an accepted generation in the external command log.
pub fn append_cmd_history(path: &Path, instruct: &str, cmd: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    write!(file, "prompt: {}\t{}\n", instruct, cmd)
}
