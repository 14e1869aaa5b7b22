//! Cooked-mode line editing for the overlay modes, independent of the
//! shell's own readline.
//!
//! Each editable line is backed by a single-line [`Screen`] in insert mode,
//! so arrow keys, delete and friends flow through the same escape parser as
//! shell output.  History recall falls out of that design for free: every
//! committed value is a line in the buffer and the Up/Down keys simply move
//! the cursor across lines.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};

use crate::display::{clear_lines, print_lines, terminal_columns};
use crate::screen::{Line, Screen};

/// Per-id recall buffers, persisted across runs.
#[derive(Default)]
pub struct EditBuffers {
    bufs: HashMap<String, Screen>,
}

impl EditBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, id: &str) -> &mut Screen {
        self.bufs
            .entry(id.to_string())
            .or_insert_with(Screen::edit_buffer)
    }

    /// Committed entries per id, ready for serialization.  The trailing
    /// empty active line is not part of the history.
    pub fn to_lists(&self) -> HashMap<String, Vec<String>> {
        let mut out = HashMap::new();
        for (id, buf) in &self.bufs {
            let mut entries: Vec<String> = buf.lines.iter().map(|l| l.to_string()).collect();
            if entries.last().map(|s| s.is_empty()).unwrap_or(false) {
                entries.pop();
            }
            out.insert(id.clone(), entries);
        }
        out
    }

    /// Rebuild buffers from serialized entry lists; each gets a fresh
    /// active line at the bottom.
    pub fn from_lists(lists: HashMap<String, Vec<String>>) -> Self {
        let mut bufs = HashMap::new();
        for (id, entries) in lists {
            let mut buf = Screen::edit_buffer();
            buf.lines = entries.iter().map(|e| Line::from(e.as_str())).collect();
            buf.lines.push(Line::new());
            buf.y = buf.lines.len() - 1;
            buf.x = 0;
            bufs.insert(id, buf);
        }
        EditBuffers { bufs }
    }
}

/// Options for a [`Editor::read_line`] call.
pub struct ReadOptions<'a> {
    pub prompt: &'a str,
    /// Initial value placed in the buffer.
    pub value: &'a str,
    /// Preamble written before the first draw.
    pub begin: Option<&'a str>,
    /// Append the terminating character to the returned value.
    pub include_last: bool,
    /// Commit as soon as the line reaches this many characters.
    pub max_chars: Option<usize>,
    /// Value returned on Ctrl-C; `None` commits the line instead.
    pub cancel: Option<&'a str>,
    /// Value returned on Ctrl-D; falls back to `cancel` when unset.
    pub exit: Option<&'a str>,
    /// Alternate translation for the 0x7f byte.
    pub backspace: Option<&'a str>,
    /// Values never committed to history.
    pub no_save: &'a [&'a str],
    /// Record `value` into history without reading anything.
    pub skip_input: bool,
}

impl Default for ReadOptions<'_> {
    fn default() -> Self {
        ReadOptions {
            prompt: ": ",
            value: "",
            begin: None,
            include_last: false,
            max_chars: None,
            cancel: None,
            exit: None,
            backspace: None,
            no_save: &[],
            skip_input: false,
        }
    }
}

/// Interactive reader bound to a terminal (or test doubles).
pub struct Editor<R: Read, W: Write> {
    input: R,
    output: W,
    /// Type-ahead: characters read past a committed line, delivered before
    /// the next read.
    pending: VecDeque<char>,
    /// Fixed width for tests; live terminal width otherwise.
    pub width_override: Option<usize>,
}

impl Editor<io::Stdin, io::Stdout> {
    pub fn stdio() -> Self {
        Editor::new(io::stdin(), io::stdout())
    }
}

impl<R: Read, W: Write> Editor<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Editor {
            input,
            output,
            pending: VecDeque::new(),
            width_override: None,
        }
    }

    /// Next batch of input characters: buffered type-ahead first, then a
    /// fresh read.  An empty batch means end of input.
    fn next_chars(&mut self) -> io::Result<Vec<char>> {
        if !self.pending.is_empty() {
            return Ok(self.pending.drain(..).collect());
        }
        let mut chunk = [0u8; 10240];
        let n = self.input.read(&mut chunk)?;
        Ok(String::from_utf8_lossy(&chunk[..n]).chars().collect())
    }

    pub fn columns(&self) -> usize {
        self.width_override.unwrap_or_else(terminal_columns)
    }

    /// Replace a previously drawn status region with `text`.  Returns the
    /// new region to pass back on the next repaint.
    pub fn repaint_region(
        &mut self,
        text: &str,
        prev: Option<(usize, usize)>,
    ) -> io::Result<(usize, usize)> {
        if let Some((all, cur)) = prev {
            clear_lines(&mut self.output, all, cur, true)?;
        }
        let width = self.columns();
        print_lines(&mut self.output, text, None, width)
    }

    /// Erase a status region drawn by [`Self::repaint_region`].
    pub fn clear_region(&mut self, region: Option<(usize, usize)>) -> io::Result<()> {
        if let Some((all, cur)) = region {
            clear_lines(&mut self.output, all, cur, true)?;
        }
        Ok(())
    }

    /// Blocking read of a single key.  EOF reads as Ctrl-D.
    pub fn read_key(&mut self) -> io::Result<char> {
        if let Some(c) = self.pending.pop_front() {
            return Ok(c);
        }
        let chars = self.next_chars()?;
        let mut it = chars.into_iter();
        let first = it.next().unwrap_or('\u{4}');
        self.pending.extend(it);
        Ok(first)
    }

    /// Write raw bytes to the editor's output (prompt headers and notices).
    pub fn write_out(&mut self, text: &str) -> io::Result<()> {
        self.output.write_all(text.as_bytes())?;
        self.output.flush()
    }

    /// Borrow the output sink (tests inspect what was drawn).
    pub fn output_ref(&self) -> &W {
        &self.output
    }

    /// Read one line through the edit buffer `buf`, committing the result
    /// into its recall history.
    ///
    /// Returns the committed text, the configured cancel/exit sentinel, or
    /// the truncated value once `max_chars` is reached.
    pub fn read_line(&mut self, buf: &mut Screen, opts: &ReadOptions) -> io::Result<String> {
        buf.insert_mode = true;
        buf.limit_move = true;
        buf.max_height = 1;
        buf.auto_move_to_end = true;

        // Reuse the previous entry rather than committing a duplicate.
        let n = buf.lines.len();
        if n > 1 && buf.lines[n - 2].to_string() == opts.value {
            buf.lines.pop();
            buf.y = buf.lines.len() - 1;
            buf.x = buf.lines[buf.y].len();
        } else {
            buf.write_chars(opts.value);
        }

        let mut committed: Option<String> = None;
        let mut cancelled = false;

        if opts.skip_input {
            committed = Some(buf.current_line());
        } else {
            if let Some(b) = opts.begin {
                self.output.write_all(b.as_bytes())?;
            }
            let width = self.columns();
            let prompt_chars = opts.prompt.chars().count();
            let (mut lines_all, mut lines_cur) = print_lines(
                &mut self.output,
                &format!("{}{}", opts.prompt, buf.current_line()),
                Some(prompt_chars + buf.x),
                width,
            )?;
            'read: loop {
                let chars = self.next_chars()?;
                if chars.is_empty() {
                    cancelled = true;
                    let sentinel = opts.exit.or(opts.cancel).unwrap_or("");
                    committed = Some(sentinel.to_string());
                    break;
                }
                for (i, &c) in chars.iter().enumerate() {
                    if c == '\u{3}' {
                        if let Some(sentinel) = opts.cancel {
                            cancelled = true;
                            committed = Some(sentinel.to_string());
                        }
                    }
                    if committed.is_none() && c == '\u{4}' {
                        if opts.exit.is_some() || opts.cancel.is_some() {
                            cancelled = true;
                            let sentinel = opts.exit.or(opts.cancel).unwrap_or("");
                            committed = Some(sentinel.to_string());
                        }
                    }
                    if committed.is_none() && matches!(c, '\u{3}' | '\u{4}' | '\r' | '\n') {
                        let mut line = buf.current_line();
                        if opts.include_last {
                            line.push(c);
                        }
                        committed = Some(line);
                    }
                    if committed.is_some() {
                        // Preserve type-ahead for the next read.
                        self.pending.extend(chars[i + 1..].iter().copied());
                        break;
                    }
                    if c == '\u{7f}' {
                        match opts.backspace {
                            Some(t) => buf.write_chars(t),
                            None => buf.write_chars("\u{8}"),
                        }
                    } else if c == '\u{1b}' {
                        buf.write_char(c);
                    } else if c.is_control() {
                        // Stray control characters never reach the buffer.
                    } else {
                        buf.write_char(c);
                    }
                    if let Some(cap) = opts.max_chars {
                        if buf.current_line().chars().count() >= cap {
                            committed = Some(buf.current_line());
                            self.pending.extend(chars[i + 1..].iter().copied());
                            break;
                        }
                    }
                }
                if committed.is_some() {
                    break 'read;
                }
                clear_lines(&mut self.output, lines_all, lines_cur, true)?;
                let drawn = print_lines(
                    &mut self.output,
                    &format!("{}{}", opts.prompt, buf.current_line()),
                    Some(prompt_chars + buf.x),
                    width,
                )?;
                lines_all = drawn.0;
                lines_cur = drawn.1;
            }
            clear_lines(&mut self.output, lines_all, lines_cur, true)?;
        }

        let result = committed.unwrap_or_default();

        // History commit: the terminator never enters the buffer, and
        // cancelled, empty, duplicate or no-save values leave it untouched.
        buf.y = buf.lines.len() - 1;
        let stored: String = result
            .trim_end_matches(['\r', '\n', '\u{3}', '\u{4}'])
            .to_string();
        let duplicate = buf.lines.len() > 1 && buf.lines[buf.y - 1].to_string() == stored;
        let skip =
            cancelled || stored.is_empty() || duplicate || opts.no_save.contains(&stored.as_str());
        if skip {
            buf.lines[buf.y] = Line::new();
            buf.x = 0;
        } else {
            buf.lines[buf.y] = Line::from(stored.as_str());
            buf.x = buf.lines[buf.y].len();
            buf.write_char('\n');
        }
        Ok(result)
    }

    /// Multi-line variant used by the config value editor.  Enter inserts a
    /// newline; Ctrl-D commits the whole text, Ctrl-C cancels.
    pub fn read_lines(&mut self, opts: &ReadOptions) -> io::Result<String> {
        let mut buf = Screen::edit_buffer();
        buf.auto_move_to_end = false;
        buf.auto_remove_line = true;
        buf.auto_move_between_line = true;
        buf.write_chars(opts.value);

        if let Some(b) = opts.begin {
            self.output.write_all(b.as_bytes())?;
        }
        let width = self.columns();
        let prompt_chars = opts.prompt.chars().count();

        let cursor_of = |buf: &Screen| -> usize {
            let mut cursor = 0;
            for line in &buf.lines[..buf.y] {
                cursor += prompt_chars + line.len() + 1;
            }
            cursor + prompt_chars + buf.x
        };

        let mut committed: Option<String> = None;
        let (mut lines_all, mut lines_cur) = print_lines(
            &mut self.output,
            &buf.text_with("\n", opts.prompt),
            Some(cursor_of(&buf)),
            width,
        )?;
        'read: loop {
            let chars = self.next_chars()?;
            if chars.is_empty() {
                committed = Some(opts.cancel.unwrap_or("").to_string());
                break;
            }
            for (i, &c) in chars.iter().enumerate() {
                if c == '\u{3}' {
                    if let Some(sentinel) = opts.cancel {
                        committed = Some(sentinel.to_string());
                    }
                }
                if committed.is_none() && c == '\u{4}' {
                    if let Some(sentinel) = opts.exit {
                        committed = Some(sentinel.to_string());
                    }
                }
                if committed.is_none() && matches!(c, '\u{3}' | '\u{4}') {
                    let mut lines = buf.text();
                    if opts.include_last {
                        lines.push(c);
                    }
                    committed = Some(lines);
                }
                if committed.is_some() {
                    self.pending.extend(chars[i + 1..].iter().copied());
                    break;
                }
                if matches!(c, '\r' | '\n') {
                    buf.write_chars("\n");
                } else if c == '\u{7f}' {
                    match opts.backspace {
                        Some(t) => buf.write_chars(t),
                        None => buf.write_chars("\u{8}"),
                    }
                } else if c == '\u{1b}' {
                    buf.write_char(c);
                } else if !c.is_control() {
                    buf.write_char(c);
                }
            }
            if committed.is_some() {
                break 'read;
            }
            clear_lines(&mut self.output, lines_all, lines_cur, true)?;
            let drawn = print_lines(
                &mut self.output,
                &buf.text_with("\n", opts.prompt),
                Some(cursor_of(&buf)),
                width,
            )?;
            lines_all = drawn.0;
            lines_cur = drawn.1;
        }
        clear_lines(&mut self.output, lines_all, lines_cur, true)?;
        Ok(committed.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn editor(input: &str) -> Editor<Cursor<Vec<u8>>, Vec<u8>> {
        let mut e = Editor::new(Cursor::new(input.as_bytes().to_vec()), Vec::new());
        e.width_override = Some(40);
        e
    }

    #[test]
    fn test_read_line_commits_typed_text() {
        let mut e = editor("ls -la\r");
        let mut buf = Screen::edit_buffer();
        let got = e
            .read_line(&mut buf, &ReadOptions::default())
            .unwrap();
        assert_eq!(got, "ls -la");
        // Committed into history, fresh active line below it.
        assert_eq!(buf.lines.len(), 2);
        assert_eq!(buf.lines[0].to_string(), "ls -la");
        assert_eq!(buf.current_line(), "");
    }

    #[test]
    fn test_read_line_longer_than_terminal_width() {
        // The redraw wraps at the width boundary; no characters are lost.
        let mut e = editor("abcdefghijklmnopqrstuvwxyz0123456789\r");
        e.width_override = Some(10);
        let mut buf = Screen::edit_buffer();
        let got = e.read_line(&mut buf, &ReadOptions::default()).unwrap();
        assert_eq!(got, "abcdefghijklmnopqrstuvwxyz0123456789");
        let drawn = String::from_utf8_lossy(e.output_ref());
        // The wrapped tail shows up as its own visual line.
        assert!(drawn.contains("\r\n"));
    }

    #[test]
    fn test_read_line_backspace_edits() {
        let mut e = editor("lsx\u{7f}\r");
        let mut buf = Screen::edit_buffer();
        let got = e.read_line(&mut buf, &ReadOptions::default()).unwrap();
        assert_eq!(got, "ls");
    }

    #[test]
    fn test_read_line_cancel_sentinel() {
        let mut e = editor("partial\u{3}");
        let mut buf = Screen::edit_buffer();
        let got = e
            .read_line(
                &mut buf,
                &ReadOptions {
                    cancel: Some(""),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(got, "");
        // Cancelled input never reaches history.
        assert_eq!(buf.lines.len(), 1);
        assert_eq!(buf.current_line(), "");
    }

    #[test]
    fn test_read_line_exit_sentinel() {
        let mut e = editor("\u{4}");
        let mut buf = Screen::edit_buffer();
        let got = e
            .read_line(
                &mut buf,
                &ReadOptions {
                    cancel: Some(""),
                    exit: Some("q"),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(got, "q");
    }

    #[test]
    fn test_read_line_include_last_appends_terminator() {
        let mut e = editor("ok\r");
        let mut buf = Screen::edit_buffer();
        let got = e
            .read_line(
                &mut buf,
                &ReadOptions {
                    include_last: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(got, "ok\r");
        // Stored without the terminator.
        assert_eq!(buf.lines[0].to_string(), "ok");
    }

    #[test]
    fn test_read_line_max_chars_truncates() {
        let mut e = editor("abcdef");
        let mut buf = Screen::edit_buffer();
        let got = e
            .read_line(
                &mut buf,
                &ReadOptions {
                    max_chars: Some(3),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(got, "abc");
    }

    #[test]
    fn test_history_recall_with_arrow_keys() {
        let mut buf = Screen::edit_buffer();
        let mut e = editor("first\r");
        e.read_line(&mut buf, &ReadOptions::default()).unwrap();
        let mut e = editor("second\r");
        e.read_line(&mut buf, &ReadOptions::default()).unwrap();
        // Arrow-up recalls the previous entry, arrow-up again the one
        // before it.
        let mut e = editor("\x1b[A\r");
        let got = e.read_line(&mut buf, &ReadOptions::default()).unwrap();
        assert_eq!(got, "second");
        let mut e = editor("\x1b[A\x1b[A\r");
        let got = e.read_line(&mut buf, &ReadOptions::default()).unwrap();
        assert_eq!(got, "first");
    }

    #[test]
    fn test_history_skips_consecutive_duplicates() {
        let mut buf = Screen::edit_buffer();
        for _ in 0..2 {
            let mut e = editor("same\r");
            e.read_line(&mut buf, &ReadOptions::default()).unwrap();
        }
        // One committed entry plus the active line.
        assert_eq!(buf.lines.len(), 2);
        assert_eq!(buf.lines[0].to_string(), "same");
    }

    #[test]
    fn test_no_save_values_not_committed() {
        let mut buf = Screen::edit_buffer();
        let mut e = editor("q\r");
        let got = e
            .read_line(
                &mut buf,
                &ReadOptions {
                    no_save: &["q"],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(got, "q");
        assert_eq!(buf.lines.len(), 1);
    }

    #[test]
    fn test_initial_value_matching_previous_entry_elided() {
        let mut buf = Screen::edit_buffer();
        let mut e = editor("echo hi\r");
        e.read_line(&mut buf, &ReadOptions::default()).unwrap();
        // Seeding with the same value must not duplicate it on commit.
        let mut e = editor("\r");
        let got = e
            .read_line(
                &mut buf,
                &ReadOptions {
                    value: "echo hi",
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(got, "echo hi");
        assert_eq!(buf.lines.len(), 2);
    }

    #[test]
    fn test_skip_input_records_value() {
        let mut buf = Screen::edit_buffer();
        let mut e = editor("");
        let got = e
            .read_line(
                &mut buf,
                &ReadOptions {
                    value: "taught command",
                    skip_input: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(got, "taught command");
        assert_eq!(buf.lines[0].to_string(), "taught command");
        assert_eq!(buf.lines.len(), 2);
    }

    #[test]
    fn test_read_lines_enter_splits_ctrl_d_commits() {
        let mut e = editor("one\rtwo\u{4}");
        let got = e
            .read_lines(&ReadOptions {
                prompt: "> ",
                cancel: Some("\u{0}cancel"),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(got, "one\ntwo");
    }

    #[test]
    fn test_read_lines_cancel() {
        let mut e = editor("one\u{3}");
        let got = e
            .read_lines(&ReadOptions {
                cancel: Some("\u{0}cancel"),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(got, "\u{0}cancel");
    }

    #[test]
    fn test_buffers_round_trip() {
        let mut bufs = EditBuffers::new();
        {
            let buf = bufs.get_or_create("cmd");
            let mut e = editor("alpha\r");
            e.read_line(buf, &ReadOptions::default()).unwrap();
            let mut e = editor("beta\r");
            e.read_line(buf, &ReadOptions::default()).unwrap();
        }
        let lists = bufs.to_lists();
        assert_eq!(lists["cmd"], vec!["alpha", "beta"]);

        let mut restored = EditBuffers::from_lists(lists);
        let buf = restored.get_or_create("cmd");
        assert_eq!(buf.lines.len(), 3);
        // Recall still works after a round trip.
        let mut e = editor("\x1b[A\r");
        let got = e.read_line(buf, &ReadOptions::default()).unwrap();
        assert_eq!(got, "beta");
    }
}
