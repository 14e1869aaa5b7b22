//! PTY relay and interaction-mode dispatcher.
//!
//! Owns the master/slave pair and the child shell.  A reader thread feeds
//! every byte the shell emits into the screen model and mirrors it to the
//! user's terminal unless an overlay mode has taken the display.  The main
//! thread demultiplexes stdin: pass-through by default, Ctrl-E enters line
//! mode, Ctrl-G runs a one-shot prompt generation.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use crate::cancel::poll_stdin_ready;
use crate::commands;
use crate::editor::Editor;
use crate::screen::Screen;
use crate::state::App;

/// Hotkey bytes recognized in pass-through mode.
pub const KEY_LINE_MODE: u8 = 0x05; // Ctrl-E
pub const KEY_PROMPT_MODE: u8 = 0x07; // Ctrl-G

/// What the command layer needs from the shell side; the PTY implements it,
/// tests fake it.
pub trait ShellLink {
    fn write_shell(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn is_alive(&mut self) -> bool;
    fn resize(&mut self, cols: u16, rows: u16);
    /// Install (or clear) the slave-update notifier fired after every read.
    fn set_notifier(&mut self, tx: Option<Sender<()>>);
}

/// The shell behind the PTY, plus its reader thread.
pub struct ShellPty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send>,
    reader_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    /// Mirror shell output to the user terminal; cleared while an overlay
    /// mode owns the display.
    echo: Arc<AtomicBool>,
    notify: Arc<Mutex<Option<Sender<()>>>>,
}

impl ShellPty {
    /// Open the PTY at the given size and spawn `cmd` on the slave side.
    /// Every byte read from the master goes through `screen`.
    pub fn spawn(
        cmd: CommandBuilder,
        screen: Arc<Mutex<Screen>>,
        cols: u16,
        rows: u16,
    ) -> io::Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io::Error::other(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| io::Error::other(e.to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| io::Error::other(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| io::Error::other(e.to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let echo = Arc::new(AtomicBool::new(true));
        let notify: Arc<Mutex<Option<Sender<()>>>> = Arc::new(Mutex::new(None));

        let reader_handle = Self::start_reader_thread(
            reader,
            screen,
            Arc::clone(&running),
            Arc::clone(&echo),
            Arc::clone(&notify),
        );

        Ok(ShellPty {
            master: pair.master,
            writer,
            child,
            reader_handle: Some(reader_handle),
            running,
            echo,
            notify,
        })
    }

    fn start_reader_thread(
        mut reader: Box<dyn Read + Send>,
        screen: Arc<Mutex<Screen>>,
        running: Arc<AtomicBool>,
        echo: Arc<AtomicBool>,
        notify: Arc<Mutex<Option<Sender<()>>>>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while running.load(Ordering::Relaxed) {
                match reader.read(&mut buf) {
                    Ok(0) => break, // EOF: the child is gone
                    Ok(n) => {
                        let chunk = &buf[..n];
                        if let Ok(mut s) = screen.lock() {
                            s.write(chunk);
                        }
                        if echo.load(Ordering::Relaxed) {
                            let mut out = io::stdout();
                            let _ = out.write_all(chunk);
                            let _ = out.flush();
                        }
                        if let Ok(guard) = notify.lock() {
                            if let Some(tx) = guard.as_ref() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        })
    }

    pub fn set_echo(&self, on: bool) {
        self.echo.store(on, Ordering::Relaxed);
    }

    /// Exit code once the child has finished.
    pub fn exit_code(&mut self) -> Option<u32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Stop the relay: kill the child and let the reader thread drain out.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        let _ = self.child.kill();
        drop(self.writer);
        // The reader may be parked in a blocking read; give it a moment,
        // then detach rather than risk hanging the exit path.
        std::thread::sleep(Duration::from_millis(100));
        if let Some(handle) = self.reader_handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl ShellLink for ShellPty {
    fn write_shell(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        let _ = self.master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });
    }

    fn set_notifier(&mut self, tx: Option<Sender<()>>) {
        if let Ok(mut guard) = self.notify.lock() {
            *guard = tx;
        }
    }
}

/// Original terminal attributes, stashed so the panic hook can restore
/// them even when the raw-mode guard never unwinds.
static ORIG_TERMIOS: OnceLock<libc::termios> = OnceLock::new();

/// Put stdin in raw mode, restoring the saved attributes on drop.
pub struct RawModeGuard {
    orig: libc::termios,
}

impl RawModeGuard {
    pub fn new() -> io::Result<RawModeGuard> {
        // SAFETY: plain termios calls on a file descriptor we own for the
        // lifetime of the process.
        unsafe {
            let mut orig: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut orig) != 0 {
                return Err(io::Error::last_os_error());
            }
            let _ = ORIG_TERMIOS.set(orig);
            let mut raw = orig;
            libc::cfmakeraw(&mut raw);
            // Blocking single-byte reads; the main loop polls before it
            // reads, the line editor wants to block.
            raw.c_cc[libc::VMIN] = 1;
            raw.c_cc[libc::VTIME] = 0;
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, &raw) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(RawModeGuard { orig })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, &self.orig);
        }
    }
}

/// Restore the terminal from anywhere (the panic hook).
pub fn restore_tty() {
    if let Some(orig) = ORIG_TERMIOS.get() {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, orig);
        }
    }
}

/// Repaint the user's terminal after an overlay mode released it.  On the
/// main buffer with the cursor at the bottom a single line is enough;
/// otherwise replay the raw ring so fullscreen programs look right again.
pub fn print_context(app: &App) {
    let mut out = io::stdout();
    if let Ok(screen) = app.screen.lock() {
        use crate::screen::BufferTag;
        let _ = out.write_all(b"\x1b[2K\r");
        if screen.buffer == BufferTag::Main && screen.y + 1 == screen.lines.len() {
            let raw = screen.raw();
            let last = raw.rsplit('\n').next().unwrap_or("");
            let _ = out.write_all(last.as_bytes());
        } else {
            let _ = out.write_all(screen.raw().as_bytes());
        }
    }
    let _ = out.flush();
}

/// Run the interactive relay until the child exits.  Assumes raw mode is
/// already active.
pub fn run(app: &mut App, shell: &mut ShellPty) -> io::Result<()> {
    let mut editor = Editor::stdio();
    let mut stdin = io::stdin();
    let mut last_size = crossterm::terminal::size().unwrap_or((80, 24));

    loop {
        if !shell.is_alive() {
            break;
        }

        // Keep the slave and the screen model in sync with the real
        // terminal size.
        if let Ok(size) = crossterm::terminal::size() {
            if size != last_size {
                shell.resize(size.0, size.1);
                if let Ok(mut screen) = app.screen.lock() {
                    screen.max_height = size.1 as usize;
                }
                last_size = size;
            }
        }

        if !poll_stdin_ready(50) {
            continue;
        }
        let mut buf = [0u8; 4096];
        let n = stdin.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];

        match chunk
            .iter()
            .position(|&b| b == KEY_LINE_MODE || b == KEY_PROMPT_MODE)
        {
            None => shell.write_shell(chunk)?,
            Some(i) => {
                // Bytes typed before the hotkey still belong to the shell;
                // the rest of the chunk is dropped with the mode switch.
                if i > 0 {
                    shell.write_shell(&chunk[..i])?;
                }
                shell.set_echo(false);
                let outcome = if chunk[i] == KEY_LINE_MODE {
                    commands::line_mode(app, shell, &mut editor)
                } else {
                    commands::prompt_mode(app, shell, &mut editor)
                };
                shell.set_echo(true);
                match outcome {
                    Ok(()) => {}
                    Err(e) => {
                        app.err = Some(e.to_string());
                        let _ = editor.write_out(&format!("error: {e}\r\n"));
                    }
                }
                print_context(app);
            }
        }
    }
    Ok(())
}
