//! Hand-written escape-sequence matcher.
//!
//! The grid feeds the pending sequence here after every appended character.
//! `resolve` answers with the action for a complete sequence, or `None`
//! while the sequence could still grow into something recognizable.  The
//! grid decides what to do with sequences that never resolve (a second ESC
//! pushes the stale prefix into the error ring).
//!
//! Dispatch follows ECMA-48 conventions (parameter collection, then a final
//! byte) instead of an ordered pattern table, so overlapping prefixes such
//! as `ESC[H` vs `ESC H` cannot shadow each other.
//!
//! References:
//! - https://vt100.net/docs/vt100-ug/chapter3.html
//! - https://learn.microsoft.com/windows/console/console-virtual-terminal-sequences

/// Effect of a completed escape sequence on the grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscAction {
    /// Recognized but has no effect on the text grid (SGR, OSC, DEC modes…).
    /// The label names the category for the debug record.
    Ignore(&'static str),
    /// Delete at the cursor (`CSI 3~`), insert/overwrite flavor decided by
    /// the grid.
    Delete,
    /// Move to the end of the text (`CSI F` with no parameters).
    MoveToEnd,
    /// Cursor key or application-keypad key (`ESC O c`, `ESC ? c`, VT52
    /// `ESC c`): ABCD move the cursor one cell, keypad keys produce a
    /// literal character.
    Key(char),
    /// Cursor motion by `n` cells in direction A/B/C/D.
    Move { n: usize, dir: char },
    /// Absolute column (1-based).
    SetCol(usize),
    /// Absolute row (1-based).
    SetRow(usize),
    /// Absolute position (1-based; missing parameters default to 1).
    SetPos { x: usize, y: usize },
    SaveCursor,
    RestoreCursor,
    /// `CSI n K`: 0 = right of cursor, 1 = left inclusive, 2 = whole line.
    ClearLine(u8),
    /// `CSI n J`: 0 = below, 1 = above, 2 = entire screen.
    ClearScreen(u8),
    /// `CSI ?1049h` / `CSI ?47h`.
    UseAltBuffer,
    /// `CSI ?1049l` / `CSI ?47l`.
    UseMainBuffer,
    /// Sequence stands for literal text (`ESC H` → TAB, `CSI 20h/l` → NL).
    Literal(&'static str),
}

impl EscAction {
    /// Short name for the debug record ring.
    pub fn name(&self) -> &'static str {
        match self {
            EscAction::Ignore(label) => label,
            EscAction::Delete => "delete",
            EscAction::MoveToEnd => "move-to-end",
            EscAction::Key(_) => "key",
            EscAction::Move { .. } => "move-cursor",
            EscAction::SetCol(_) => "set-col",
            EscAction::SetRow(_) => "set-row",
            EscAction::SetPos { .. } => "set-pos",
            EscAction::SaveCursor => "save-cursor",
            EscAction::RestoreCursor => "restore-cursor",
            EscAction::ClearLine(_) => "clear-line",
            EscAction::ClearScreen(_) => "clear-screen",
            EscAction::UseAltBuffer => "alt-buffer",
            EscAction::UseMainBuffer => "main-buffer",
            EscAction::Literal(_) => "literal",
        }
    }
}

/// Application-keypad keys that translate to literal characters.
fn keypad_literal(c: char) -> Option<&'static str> {
    Some(match c {
        'p' => "0",
        'q' => "1",
        'r' => "2",
        's' => "3",
        't' => "4",
        'u' => "5",
        'v' => "6",
        'w' => "7",
        'x' => "8",
        'y' => "9",
        'm' => "-",
        'l' => ",",
        'n' => ".",
        'M' => "\r",
        _ => return None,
    })
}

/// Literal text produced by a keypad key, if any.
pub fn key_literal(c: char) -> Option<&'static str> {
    keypad_literal(c)
}

/// Try to resolve `seq` (which starts with ESC) into an action.
///
/// `None` means the sequence is incomplete or unrecognized so far; the
/// caller keeps accumulating.  A sequence that can never match simply stays
/// `None` until the grid gives up on it.
pub fn resolve(seq: &str) -> Option<EscAction> {
    let mut chars = seq.chars();
    if chars.next() != Some('\u{1b}') {
        return None;
    }

    // A CAN or SUB anywhere aborts the control sequence.
    if seq.contains('\u{18}') || seq.contains('\u{1a}') {
        return Some(EscAction::Ignore("cancelled"));
    }
    // OSC and friends: anything terminated by BEL or ST is swallowed whole.
    if seq.contains('\u{07}') || (seq.len() > 2 && seq.ends_with("\u{1b}\\")) {
        return Some(EscAction::Ignore("string-sequence"));
    }

    let second = chars.next()?;
    let rest: String = chars.collect();
    match second {
        '[' => resolve_csi(&rest),
        // OSC body: wait for the BEL/ST terminator handled above.
        ']' => None,
        // Cursor keys and application keypad; `ESC ? c` is the VT52 keypad
        // prefix.
        'O' | '?' => {
            let mut r = rest.chars();
            let key = r.next()?;
            if r.next().is_some() {
                return None;
            }
            Some(EscAction::Key(key))
        }
        // VT52-compatible bare cursor keys.
        'A' | 'B' | 'C' | 'D' if rest.is_empty() => Some(EscAction::Key(second)),
        'F' | 'G' | 'Z' | '=' | '>' | '<' if rest.is_empty() => {
            Some(EscAction::Ignore("vt52-mode"))
        }
        'I' if rest.is_empty() => Some(EscAction::Ignore("reverse-linefeed")),
        // VT52 direct cursor address: ESC Y <row><col> as two 2-digit groups.
        'Y' => {
            if !rest.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            if rest.chars().count() == 4 {
                Some(EscAction::Ignore("vt52-address"))
            } else {
                None
            }
        }
        '7' if rest.is_empty() => Some(EscAction::SaveCursor),
        '8' if rest.is_empty() => Some(EscAction::RestoreCursor),
        'H' if rest.is_empty() => Some(EscAction::Literal("\t")),
        'E' if rest.is_empty() => Some(EscAction::Ignore("next-line")),
        'M' if rest.is_empty() => Some(EscAction::Ignore("reverse-index")),
        'c' if rest.is_empty() => Some(EscAction::Ignore("full-reset")),
        // Character set selection: ESC ( c / ESC ) c.
        '(' | ')' => {
            let mut r = rest.chars();
            let _designator = r.next()?;
            if r.next().is_some() {
                return None;
            }
            Some(EscAction::Ignore("charset"))
        }
        // Line height / width: ESC # d.
        '#' => {
            let mut r = rest.chars();
            let d = r.next()?;
            if !d.is_ascii_digit() || r.next().is_some() {
                return None;
            }
            Some(EscAction::Ignore("line-attr"))
        }
        _ => None,
    }
}

/// Resolve the body of a CSI sequence (everything after `ESC [`).
fn resolve_csi(body: &str) -> Option<EscAction> {
    let mut chars = body.chars().peekable();

    let mut private = false;
    if chars.peek() == Some(&'?') {
        private = true;
        chars.next();
    }

    let mut params = String::new();
    let mut has_symbol = false;
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == ';' {
            params.push(c);
            chars.next();
        } else if c == '%' || c == '>' {
            // Only the SGR / window-config family carries these.
            has_symbol = true;
            params.push(c);
            chars.next();
        } else {
            break;
        }
    }

    let mut intermediate = None;
    if let Some(&c) = chars.peek() {
        if c == ' ' || c == '!' {
            intermediate = Some(c);
            chars.next();
        }
    }

    let fin = chars.next()?;
    if chars.next().is_some() {
        // Junk after a final byte: this will never match.
        return None;
    }

    if has_symbol && !matches!(fin, 'm' | 't') {
        return None;
    }
    if let Some(im) = intermediate {
        return match (im, fin) {
            (' ', 'q') => Some(EscAction::Ignore("cursor-shape")),
            ('!', 'p') => Some(EscAction::Ignore("soft-reset")),
            _ => None,
        };
    }

    let first = |def: usize| -> usize {
        params
            .split(';')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(def)
    };

    match fin {
        // Editing keys arrive as CSI n ~.  Only the insert/delete/page pad
        // keys are recognized; anything else stays unresolved so the grid
        // can report it.
        '~' => match params.as_str() {
            "2" | "5" | "6" => Some(EscAction::Ignore("edit-key")),
            "3" => Some(EscAction::Delete),
            _ => None,
        },
        'A' | 'B' | 'C' | 'D' | 'E' | 'F' => {
            if fin == 'F' && params.is_empty() {
                return Some(EscAction::MoveToEnd);
            }
            // `CSI n;m X` is the modifier form; the count rides in the
            // second parameter there.
            let parts: Vec<&str> = params.split(';').collect();
            let n = if parts.len() >= 2 {
                parts[1].parse().unwrap_or(1)
            } else {
                parts[0].parse().unwrap_or(1)
            };
            let dir = match fin {
                'E' => 'B',
                'F' => 'A',
                other => other,
            };
            Some(EscAction::Move { n: n.max(1), dir })
        }
        'G' => Some(EscAction::SetCol(first(1).max(1))),
        'd' => Some(EscAction::SetRow(first(1).max(1))),
        'H' | 'f' => {
            let mut it = params.split(';');
            let y = it.next().and_then(|p| p.parse().ok()).unwrap_or(1);
            let x = it.next().and_then(|p| p.parse().ok()).unwrap_or(1);
            Some(EscAction::SetPos {
                x: x.max(1),
                y: y.max(1),
            })
        }
        's' if params.is_empty() && !private => Some(EscAction::SaveCursor),
        'u' if params.is_empty() && !private => Some(EscAction::RestoreCursor),
        'K' if params.len() <= 1 => Some(EscAction::ClearLine(first(0) as u8)),
        'J' if params.len() <= 1 => Some(EscAction::ClearScreen(first(0) as u8)),
        'm' | 't' => Some(EscAction::Ignore("sgr-or-window")),
        'h' | 'l' if private => match params.as_str() {
            "1049" | "47" => Some(if fin == 'h' {
                EscAction::UseAltBuffer
            } else {
                EscAction::UseMainBuffer
            }),
            _ => Some(EscAction::Ignore("dec-private-mode")),
        },
        'h' | 'l' if params == "20" => Some(EscAction::Literal("\n")),
        'l' if !params.is_empty() => Some(EscAction::Ignore("reset-mode")),
        'S' | 'T' => Some(EscAction::Ignore("scroll")),
        '@' | 'P' | 'X' | 'L' | 'M' => Some(EscAction::Ignore("edit-text")),
        'q' => Some(EscAction::Ignore("led")),
        'n' | 'c' => Some(EscAction::Ignore("status-query")),
        'R' => Some(EscAction::Ignore("cursor-report")),
        'I' | 'Z' | 'g' => Some(EscAction::Ignore("tab")),
        'r' => Some(EscAction::Ignore("scroll-margin")),
        'x' => Some(EscAction::Ignore("terminal-params")),
        _ => None,
    }
}
