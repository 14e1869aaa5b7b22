//! Shared application context for an interactive session.
//!
//! Everything the overlay modes touch lives here: the screen model fed by
//! the reader thread, the session supervisor, the per-id edit buffers, and
//! the last dispatch error.  Constructed once at startup; no global state.

use std::sync::{Arc, Mutex};

use crate::ai::client::AiContext;
use crate::ai::mixed::MixedSession;
use crate::ai::create_session;
use crate::config::{Settings, StatePaths};
use crate::editor::EditBuffers;
use crate::history::{self, ScrollOffLog};
use crate::screen::Screen;

pub struct App {
    pub settings: Settings,
    pub paths: StatePaths,
    /// Written by the reader thread, snapshotted by the main thread.
    pub screen: Arc<Mutex<Screen>>,
    pub ai: MixedSession,
    pub ai_ctx: Arc<AiContext>,
    pub bufs: EditBuffers,
    /// Last dispatch error, readable via the `err` command.
    pub err: Option<String>,
    /// Whether the confirmation view shows the model's reasoning.
    pub show_think: bool,
    /// Command taught via the confirmation prompt; auto-accepted on the
    /// next cycle.
    pub teach: Option<String>,
}

impl App {
    /// Build the full runtime context: screen with scroll-off sink, session
    /// registry from disk (with a default chat session when empty), and the
    /// restored edit buffers.
    pub fn new(settings: Settings, paths: StatePaths) -> App {
        let ai_ctx = Arc::new(AiContext::new(
            &settings.base_url,
            &settings.api_key,
            &settings.model,
        ));

        let mut ai = match history::load_ai_config(&paths.ai_config) {
            Some(cfg) => MixedSession::from_config(&ai_ctx, &cfg),
            None => MixedSession::new(),
        };
        if ai.is_empty() {
            if let Ok(session) = create_session(&ai_ctx, "chat") {
                ai.add("default", session);
                let _ = ai.switch("default");
            }
        } else if ai.current_id().is_none() {
            if let Some(id) = ai.ids().first().map(|s| s.to_string()) {
                let _ = ai.switch(&id);
            }
        }

        let mut screen = match ScrollOffLog::open(&paths.screen_history) {
            Ok(log) => Screen::with_sink(Box::new(log)),
            Err(e) => {
                log::warn!("scroll-off log unavailable: {e}");
                Screen::new()
            }
        };
        screen.max_lines = settings.max_lines;
        screen.max_chars = settings.max_chars;
        screen.max_height = settings.max_height;
        screen.keep_logs_when_clean_screen = settings.keep_logs_when_clean_screen;

        let bufs = history::load_edit_buffers(&paths.edit_history);

        App {
            settings,
            paths,
            screen: Arc::new(Mutex::new(screen)),
            ai,
            ai_ctx,
            bufs,
            err: None,
            show_think: false,
            teach: None,
        }
    }

    /// Self-consistent snapshot of the grid text, used as model context.
    pub fn screen_text(&self) -> String {
        self.screen.lock().map(|s| s.text()).unwrap_or_default()
    }

    /// Flush sessions and edit buffers to disk; failures are reported, not
    /// fatal.
    pub fn persist(&self) {
        if let Err(e) = history::save_ai_config(&self.paths.ai_config, &self.ai.save_config()) {
            log::warn!("could not save session config: {e}");
        }
        if let Err(e) = history::save_edit_buffers(&self.paths.edit_history, &self.bufs) {
            log::warn!("could not save edit history: {e}");
        }
    }

    /// Close the screen: dump surviving lines into the scroll-off log and
    /// write the end marker.
    pub fn close_screen(&self) {
        if let Ok(mut screen) = self.screen.lock() {
            screen.close();
        }
    }
}

#[cfg(test)]
pub(crate) fn test_app(dir: &std::path::Path) -> App {
    let ai_ctx = Arc::new(AiContext::new("http://127.0.0.1:1", "", "test-model"));
    App {
        settings: Settings::default(),
        paths: StatePaths::in_dir(dir),
        screen: Arc::new(Mutex::new(Screen::new())),
        ai: MixedSession::new(),
        ai_ctx,
        bufs: EditBuffers::new(),
        err: None,
        show_think: false,
        teach: None,
    }
}
