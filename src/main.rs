//! lls: run your shell behind an LLM-assisted PTY wrapper.
//!
//! The shell runs on a pseudo-terminal and its byte stream is mirrored to
//! the user while a screen model keeps track of what is visible.  Ctrl-E
//! opens the line-mode command overlay, Ctrl-G asks the active model
//! session for a command built from the current screen.

use std::env;
use std::io;
use std::panic;
use std::path::Path;
use std::process;

use clap::Parser;
use crossterm::tty::IsTty;
use portable_pty::CommandBuilder;

mod ai;
mod cancel;
mod commands;
mod config;
mod display;
mod editor;
mod errors;
mod history;
mod relay;
mod screen;
mod state;

use config::{Settings, StatePaths};
use relay::{RawModeGuard, ShellPty};
use state::App;

#[derive(Parser)]
#[command(
    name = "lls",
    version,
    about = "Run your shell behind an LLM-assisted PTY wrapper"
)]
struct Cli {
    /// Arguments passed to the shell, or `-- PROG [ARGS...]` to run an
    /// explicit program instead of $SHELL
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// Restore the terminal before the default panic output so the message is
/// actually readable.
fn setup_panic_hook() {
    let original = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        relay::restore_tty();
        original(info);
    }));
}

/// Pick the program to run: the explicit `--` form, or `$SHELL` with a
/// recursion guard falling back to the configured shell.
fn resolve_program(args: &[String], explicit: bool, settings: &Settings) -> (String, Vec<String>) {
    // Depending on where clap stopped parsing, the separator itself may
    // still be the first captured value.
    let args = if args.first().map(String::as_str) == Some("--") {
        &args[1..]
    } else {
        args
    };
    if explicit && !args.is_empty() {
        return (args[0].clone(), args[1..].to_vec());
    }
    let own = env::args().next().unwrap_or_default();
    let own_name = Path::new(&own).file_name().map(|n| n.to_os_string());
    let shell = env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .filter(|s| Path::new(s).file_name().map(|n| n.to_os_string()) != own_name)
        .unwrap_or_else(|| settings.fallback_shell.clone());
    (shell, args.to_vec())
}

#[cfg(unix)]
fn exit_code_of(status: process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn run_interactive(settings: Settings, prog: &str, args: &[String]) -> io::Result<i32> {
    let mut app = App::new(settings, StatePaths::in_home());

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    if let Ok(mut screen) = app.screen.lock() {
        screen.max_height = rows as usize;
    }

    let mut cmd = CommandBuilder::new(prog);
    cmd.args(args);
    if let Ok(cwd) = env::current_dir() {
        cmd.cwd(cwd);
    }
    let mut shell = ShellPty::spawn(cmd, app.screen.clone(), cols, rows)?;

    setup_panic_hook();
    let raw = RawModeGuard::new()?;
    let result = relay::run(&mut app, &mut shell);
    drop(raw);

    app.close_screen();
    app.persist();
    let code = shell.exit_code().unwrap_or(0);
    shell.shutdown();
    result?;

    // Interactive exits are clean unless the child died to a signal.
    Ok(if code >= 128 { code as i32 } else { 0 })
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    // trailing_var_arg swallows the separator, so the explicit-program form
    // is detected on the raw argv.
    let explicit = env::args().nth(1).as_deref() == Some("--");

    let settings = Settings::load();
    let (prog, prog_args) = resolve_program(&cli.args, explicit, &settings);

    if !io::stdin().is_tty() {
        // Not a terminal: degrade to a plain subprocess and propagate the
        // child's exit status.
        match process::Command::new(&prog).args(&prog_args).status() {
            Ok(status) => process::exit(exit_code_of(status)),
            Err(e) => {
                eprintln!("lls: {prog}: {e}");
                process::exit(1);
            }
        }
    }

    match run_interactive(settings, &prog, &prog_args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            relay::restore_tty();
            eprintln!("lls: {e}");
            process::exit(1);
        }
    }
}
