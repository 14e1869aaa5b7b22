//! Configuration: environment variables, the optional declarative
//! `~/.lls.toml`, and the locations of persisted state files.

use std::env;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

/// Effective settings after merging environment defaults with `~/.lls.toml`.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Shell used when `$SHELL` is unset or points back at us.
    pub fallback_shell: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_lines: usize,
    pub max_chars: usize,
    pub max_height: usize,
    pub keep_logs_when_clean_screen: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            fallback_shell: "bash".to_string(),
            base_url: "https://api.openai.com".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            max_lines: 500,
            max_chars: 8000,
            max_height: 30,
            keep_logs_when_clean_screen: true,
        }
    }
}

/// On-disk layout of `~/.lls.toml`.  Everything is optional; the file is a
/// set of overrides, not a full config.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    shell: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    screen: ScreenLimits,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScreenLimits {
    max_lines: Option<usize>,
    max_chars: Option<usize>,
    max_height: Option<usize>,
    keep_logs_when_clean_screen: Option<bool>,
}

impl Settings {
    /// Environment defaults, then `~/.lls.toml` overrides.  A missing file
    /// is silently ignored; a malformed one is reported and skipped.
    pub fn load() -> Settings {
        let mut s = Settings {
            fallback_shell: env::var("LLS_FALLBACK_SHELL")
                .unwrap_or_else(|_| "bash".to_string()),
            base_url: env::var("LLS_OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            api_key: env::var("LLS_OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("LLS_OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            ..Settings::default()
        };
        let path = user_config_path();
        if let Ok(content) = fs::read_to_string(&path) {
            s.apply_file(&content);
        }
        s
    }

    fn apply_file(&mut self, content: &str) {
        let file: FileConfig = match toml_edit::de::from_str(content) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("could not parse {}: {}", user_config_path().display(), e);
                return;
            }
        };
        if let Some(shell) = file.shell {
            self.fallback_shell = shell;
        }
        if let Some(model) = file.model {
            self.model = model;
        }
        if let Some(base_url) = file.base_url {
            self.base_url = base_url;
        }
        if let Some(api_key) = file.api_key {
            self.api_key = api_key;
        }
        if let Some(v) = file.screen.max_lines {
            self.max_lines = v.max(1);
        }
        if let Some(v) = file.screen.max_chars {
            self.max_chars = v.max(1);
        }
        if let Some(v) = file.screen.max_height {
            self.max_height = v.max(1);
        }
        if let Some(v) = file.screen.keep_logs_when_clean_screen {
            self.keep_logs_when_clean_screen = v;
        }
    }
}

/// Root for persisted state; falls back to the working directory when
/// `$HOME` is unset.
pub fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Locations of the persisted state files.
#[derive(Clone, Debug)]
pub struct StatePaths {
    pub ai_config: PathBuf,
    pub edit_history: PathBuf,
    pub screen_history: PathBuf,
    pub cmd_history: PathBuf,
}

impl StatePaths {
    pub fn in_home() -> StatePaths {
        StatePaths {
            ai_config: ai_config_path(),
            edit_history: edit_history_path(),
            screen_history: screen_history_path(),
            cmd_history: cmd_history_path(),
        }
    }

    /// All files rooted under `dir` (tests).
    pub fn in_dir(dir: &std::path::Path) -> StatePaths {
        StatePaths {
            ai_config: dir.join(".lls_ai_config"),
            edit_history: dir.join(".lls_history"),
            screen_history: dir.join(".lls_screen_history"),
            cmd_history: dir.join(".cmd_history"),
        }
    }
}

pub fn user_config_path() -> PathBuf {
    home_dir().join(".lls.toml")
}

pub fn ai_config_path() -> PathBuf {
    home_dir().join(".lls_ai_config")
}

pub fn edit_history_path() -> PathBuf {
    home_dir().join(".lls_history")
}

pub fn screen_history_path() -> PathBuf {
    home_dir().join(".lls_screen_history")
}

pub fn cmd_history_path() -> PathBuf {
    home_dir().join(".cmd_history")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_overrides_apply() {
        let mut s = Settings::default();
        s.apply_file(
            r#"
shell = "zsh"
model = "local-model"

[screen]
max_lines = 1000
keep_logs_when_clean_screen = false
"#,
        );
        assert_eq!(s.fallback_shell, "zsh");
        assert_eq!(s.model, "local-model");
        assert_eq!(s.max_lines, 1000);
        assert!(!s.keep_logs_when_clean_screen);
        // Untouched keys keep their defaults.
        assert_eq!(s.max_chars, 8000);
        assert_eq!(s.base_url, "https://api.openai.com");
    }

    #[test]
    fn test_malformed_file_keeps_defaults() {
        let mut s = Settings::default();
        s.apply_file("this is not [valid toml");
        assert_eq!(s.fallback_shell, "bash");
        assert_eq!(s.max_lines, 500);
    }

    #[test]
    fn test_zero_limits_clamped() {
        let mut s = Settings::default();
        s.apply_file("[screen]\nmax_lines = 0\nmax_height = 0\n");
        assert_eq!(s.max_lines, 1);
        assert_eq!(s.max_height, 1);
    }
}
