//! Terminal screen model.
//!
//! Consumes the byte stream a shell emits and maintains a line grid faithful
//! enough that `text()` is "what is on the screen right now".  The same type
//! doubles as the single-line edit buffer for the line editor (insert mode,
//! bounded height, movement limits), so cursor arithmetic and escape
//! handling live in exactly one place.
//!
//! Lines store chars, not bytes: the cursor column is a cell index and
//! multi-byte input can never split a cell.

pub mod escape;

use std::fmt;

use self::escape::{key_literal, EscAction};

/// Ring capacity for the escape diagnostic buffers.
const ESC_RING: usize = 100;

/// One grid line.  Holes left behind by cursor jumps are filled with spaces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Line {
    cells: Vec<char>,
}

impl Line {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Insert at cell `i`; out-of-range inserts append.
    pub fn insert(&mut self, i: usize, c: char) {
        let i = i.min(self.cells.len());
        self.cells.insert(i, c);
    }

    /// Remove the cell at `i`; out of range is a no-op.
    pub fn remove(&mut self, i: usize) {
        if i < self.cells.len() {
            self.cells.remove(i);
        }
    }

    /// Overwrite cell `i`, padding with spaces when the line is shorter.
    pub fn set(&mut self, i: usize, c: char) {
        while self.cells.len() <= i {
            self.cells.push(' ');
        }
        self.cells[i] = c;
    }

    pub fn truncate(&mut self, n: usize) {
        self.cells.truncate(n);
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Split at cell `i`, keeping the head and returning the tail.
    pub fn split_off(&mut self, i: usize) -> Line {
        let i = i.min(self.cells.len());
        Line {
            cells: self.cells.split_off(i),
        }
    }

    pub fn append(&mut self, other: Line) {
        self.cells.extend(other.cells);
    }

    /// Blank the first `x` cells, growing the line to `x` if needed.
    pub fn blank_left(&mut self, x: usize) {
        while self.cells.len() < x {
            self.cells.push(' ');
        }
        for cell in self.cells.iter_mut().take(x) {
            *cell = ' ';
        }
    }

    pub fn trim_trailing_spaces(&mut self) {
        while self.cells.last() == Some(&' ') {
            self.cells.pop();
        }
    }

    pub fn pad_to(&mut self, n: usize) {
        while self.cells.len() < n {
            self.cells.push(' ');
        }
    }

    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.cells.iter().copied()
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.cells {
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl From<&str> for Line {
    fn from(s: &str) -> Self {
        Line {
            cells: s.chars().collect(),
        }
    }
}

/// Parser state: ordinary characters, or accumulating an escape sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseMode {
    Normal,
    Esc,
}

/// Which screen buffer the stream believes it is drawing to.  Fullscreen
/// programs toggle to `Alter` and back; the grid itself is shared, so
/// neither tag loses state across a switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferTag {
    Main,
    Alter,
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferTag::Main => write!(f, "main"),
            BufferTag::Alter => write!(f, "alter"),
        }
    }
}

/// Destination for lines scrolled off the top of the grid.
pub trait HistorySink: Send {
    fn write_line(&mut self, line: &str);
    /// Final flush; called once when the screen closes.
    fn close(&mut self);
}

/// Terminal screen buffer simulation.
pub struct Screen {
    pub lines: Vec<Line>,
    /// Cursor column (cell index into the current line).
    pub x: usize,
    /// Cursor row (absolute line index).
    pub y: usize,
    /// First visible row; only grows, so cleared screens keep their
    /// scrollback above it.
    start_y: isize,
    pub saved_cursor: (usize, usize),
    pub mode: ParseMode,
    /// Pending escape sequence while `mode == Esc`.
    pub esc: String,
    pub esc_debug: bool,
    /// Successful matches, recorded only while `esc_debug` is on.
    pub esc_record: Vec<(String, &'static str)>,
    /// Sequences that never resolved before the next ESC arrived.
    pub esc_err: Vec<String>,
    pub buffer: BufferTag,
    raw: String,
    raw_len: usize,
    utf8_pending: Vec<u8>,
    pub dropped_chars: usize,
    pub dropped_lines: usize,
    pub total_chars: usize,
    pub max_chars: usize,
    pub max_lines: usize,
    pub max_height: usize,
    pub keep_logs_when_clean_screen: bool,
    /// Edit-buffer behavior: printable characters insert instead of
    /// overwrite, BS/DEL remove, LF splits the line.
    pub insert_mode: bool,
    /// Clamp cursor motion to existing text.
    pub limit_move: bool,
    /// Vertical moves land at end-of-line.
    pub auto_move_to_end: bool,
    /// Horizontal moves slide across line boundaries.
    pub auto_move_between_line: bool,
    /// Backspace at column 0 merges into the previous line.
    pub auto_remove_line: bool,
    sink: Option<Box<dyn HistorySink>>,
}

impl fmt::Debug for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screen")
            .field("lines", &self.lines.len())
            .field("x", &self.x)
            .field("y", &self.y)
            .field("mode", &self.mode)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}

impl Screen {
    pub fn new() -> Self {
        Screen {
            lines: vec![Line::new()],
            x: 0,
            y: 0,
            start_y: 0,
            saved_cursor: (0, 0),
            mode: ParseMode::Normal,
            esc: String::new(),
            esc_debug: false,
            esc_record: Vec::new(),
            esc_err: Vec::new(),
            buffer: BufferTag::Main,
            raw: String::new(),
            raw_len: 0,
            utf8_pending: Vec::new(),
            dropped_chars: 0,
            dropped_lines: 0,
            total_chars: 0,
            max_chars: 8000,
            max_lines: 500,
            max_height: 30,
            keep_logs_when_clean_screen: false,
            insert_mode: false,
            limit_move: false,
            auto_move_to_end: false,
            auto_move_between_line: false,
            auto_remove_line: false,
            sink: None,
        }
    }

    /// Screen with a scroll-off sink attached; overflowing lines are dumped
    /// oldest-first instead of being discarded.
    pub fn with_sink(sink: Box<dyn HistorySink>) -> Self {
        let mut s = Screen::new();
        s.sink = Some(sink);
        s
    }

    /// Single-line edit buffer configuration used by the line editor.
    pub fn edit_buffer() -> Self {
        let mut s = Screen::new();
        s.insert_mode = true;
        s.limit_move = true;
        s.max_height = 1;
        s.auto_move_to_end = true;
        s
    }

    /// Raw characters ingested so far, bounded by `max_chars`.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn current_line(&self) -> String {
        self.lines
            .get(self.y)
            .map(|l| l.to_string())
            .unwrap_or_default()
    }

    /// All grid text joined with `\n`.
    pub fn text(&self) -> String {
        self.text_with("\n", "")
    }

    pub fn text_with(&self, end: &str, begin: &str) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push_str(end);
            }
            out.push_str(begin);
            out.push_str(&line.to_string());
        }
        out
    }

    /// First visible row given `max_height`, persisting the high-water mark
    /// so cleared screens never scroll back down.
    pub fn visible_start(&mut self) -> usize {
        let start = self.computed_start() as isize;
        if start > self.start_y {
            self.start_y = start;
        }
        self.start_y.max(0) as usize
    }

    /// Non-persisting variant for renderers holding `&Screen`.
    pub fn visible_start_hint(&self) -> usize {
        (self.computed_start() as isize).max(self.start_y).max(0) as usize
    }

    fn computed_start(&self) -> usize {
        if self.lines.len() > self.max_height {
            self.lines.len() - self.max_height
        } else {
            0
        }
    }

    /// Raw scroll offset, for the status footer.
    pub fn start_offset(&self) -> isize {
        self.start_y
    }

    fn real_y(&mut self, y: usize) -> usize {
        let y = y.min(self.max_height.saturating_sub(1));
        self.visible_start() + y
    }

    /// Dump lines beyond `keep` into the scroll-off sink, oldest first.
    fn dump_scrolloff(&mut self, keep: usize) {
        if self.lines.len() <= keep {
            return;
        }
        let excess = self.lines.len() - keep;
        let mut sink = self.sink.take();
        for line in self.lines.drain(..excess) {
            if let Some(s) = sink.as_mut() {
                s.write_line(&line.to_string());
            }
        }
        self.sink = sink;
        self.y = self.y.saturating_sub(excess);
        self.start_y -= excess as isize;
        self.dropped_lines += excess;
    }

    /// Flush every surviving line to the sink and close it.
    pub fn close(&mut self) {
        self.dump_scrolloff(0);
        if let Some(sink) = self.sink.as_mut() {
            sink.close();
        }
        self.lines = vec![Line::new()];
        self.y = 0;
        self.x = 0;
    }

    /// Drop parser state after a confusing stream (the `reset` command).
    pub fn reset_parser(&mut self) {
        self.mode = ParseMode::Normal;
        self.esc.clear();
    }

    /// Re-establish invariants after any mutation: non-negative cursor,
    /// optionally clamped to existing text, grid grown to the cursor row,
    /// current line stripped of trailing spaces then padded to the cursor
    /// column, and the grid bounded by `max_lines`.
    fn normalize(&mut self, limit: Option<bool>) {
        let limit = limit.unwrap_or(self.limit_move);
        if limit {
            if self.y + 1 > self.lines.len() {
                self.y = self.lines.len() - 1;
            }
            let cur_len = self.lines[self.y].len();
            if self.x > cur_len {
                self.x = cur_len;
            }
        }
        while self.y + 1 > self.lines.len() {
            self.lines.push(Line::new());
        }
        let x = self.x;
        let line = &mut self.lines[self.y];
        line.trim_trailing_spaces();
        line.pad_to(x);
        if self.lines.len() > self.max_lines {
            let keep = self.max_lines;
            self.dump_scrolloff(keep);
        }
    }

    /// Absolute cursor positioning, 1-based.  `(1,1)` with
    /// `keep_logs_when_clean_screen` pushes the current screen into
    /// scrollback first.
    pub fn set_cursor(&mut self, x: Option<usize>, y: Option<usize>, limit: Option<bool>) {
        if x == Some(1) && y == Some(1) && self.keep_logs_when_clean_screen {
            self.start_y = self.y as isize;
        }
        if let Some(y1) = y {
            // Normalize the line we are leaving without padding it to the
            // old column.
            let ox = self.x;
            self.x = 0;
            self.normalize(limit);
            self.x = ox;
            self.y = self.real_y(y1.saturating_sub(1));
            self.normalize(limit);
        }
        if let Some(x1) = x {
            self.x = x1.saturating_sub(1);
            self.normalize(limit);
        }
    }

    /// Relative cursor motion in direction A/B/C/D (up/down/right/left).
    pub fn move_cursor(&mut self, n: usize, dir: char, limit: Option<bool>) {
        match dir {
            'A' | 'B' => {
                let ox = self.x;
                self.x = 0;
                self.normalize(limit);
                self.x = ox;
                if dir == 'A' {
                    self.y = self.y.saturating_sub(n);
                } else {
                    self.y += n;
                }
                if self.auto_move_to_end {
                    self.normalize(limit);
                    self.x = self.lines[self.y].len();
                }
            }
            'C' => {
                if self.x < self.lines[self.y].len() {
                    self.x += n;
                } else if self.y + 1 < self.lines.len() && self.auto_move_between_line {
                    self.y += 1;
                    self.x = 0;
                }
            }
            'D' => {
                if self.x > 0 {
                    self.x = self.x.saturating_sub(n);
                } else if self.y > 0 && self.auto_move_between_line {
                    self.y -= 1;
                    self.x = self.lines[self.y].len();
                }
            }
            _ => {}
        }
        self.normalize(limit);
    }

    /// Feed raw bytes.  Decoding is incremental: a multi-byte character
    /// split across reads is held until its tail arrives, invalid bytes
    /// become replacement characters.
    pub fn write(&mut self, bytes: &[u8]) {
        self.utf8_pending.extend_from_slice(bytes);
        let buf = std::mem::take(&mut self.utf8_pending);
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    self.write_chars(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    if let Ok(s) = std::str::from_utf8(valid) {
                        self.write_chars(s);
                    }
                    match e.error_len() {
                        Some(n) => {
                            self.write_char('\u{fffd}');
                            rest = &after[n..];
                        }
                        None => {
                            // Incomplete tail; keep it for the next chunk.
                            self.utf8_pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    pub fn write_chars(&mut self, chars: &str) {
        for c in chars.chars() {
            self.write_char(c);
        }
    }

    pub fn write_char(&mut self, c: char) {
        self.total_chars += 1;
        self.raw.push(c);
        self.raw_len += 1;
        while self.raw_len > self.max_chars {
            if let Some(first) = self.raw.chars().next() {
                let n = first.len_utf8();
                self.raw.drain(..n);
            }
            self.raw_len -= 1;
            self.dropped_chars += 1;
        }
        match self.mode {
            ParseMode::Normal => self.write_char_normal(c),
            ParseMode::Esc => self.write_char_esc(c),
        }
    }

    fn write_char_normal(&mut self, c: char) {
        match c {
            '\u{07}' => return,
            '\u{1b}' => {
                self.write_char_esc(c);
                return;
            }
            '\u{08}' => {
                if self.x > 0 {
                    self.x -= 1;
                    if self.insert_mode {
                        let x = self.x;
                        self.lines[self.y].remove(x);
                    }
                } else if self.y > 0 && self.insert_mode && self.auto_remove_line {
                    let tail = self.lines.remove(self.y);
                    self.y -= 1;
                    self.x = self.lines[self.y].len();
                    self.lines[self.y].append(tail);
                }
            }
            '\r' => self.x = 0,
            '\n' => {
                if self.insert_mode {
                    let x = self.x;
                    let tail = self.lines[self.y].split_off(x);
                    self.lines.insert(self.y + 1, tail);
                    self.y += 1;
                    self.x = 0;
                } else {
                    self.y += 1;
                    self.normalize(Some(false));
                }
            }
            _ => {
                self.x += 1;
                self.normalize(Some(false));
                let x = self.x;
                let line = &mut self.lines[self.y];
                if self.insert_mode {
                    line.insert(x - 1, c);
                } else {
                    line.set(x - 1, c);
                }
            }
        }
        self.normalize(None);
    }

    fn write_char_esc(&mut self, c: char) {
        self.mode = ParseMode::Esc;
        self.esc.push(c);
        let esc = self.esc.clone();

        if self.try_escape(&esc) {
            return;
        }

        // A fresh ESC before the pending sequence resolved: try the final
        // segment alone and, if it stands on its own, give up on the prefix.
        if esc[1..].contains('\u{1b}') {
            if let Some(idx) = esc.rfind('\u{1b}') {
                if idx > 0 {
                    let last = esc[idx..].to_string();
                    if self.try_escape(&last) {
                        self.esc_err.push(esc);
                        trim_ring(&mut self.esc_err);
                    }
                }
            }
        }
    }

    /// Attempt to resolve `seq`; on success leave escape mode and apply the
    /// action.
    fn try_escape(&mut self, seq: &str) -> bool {
        let action = match escape::resolve(seq) {
            Some(a) => a,
            None => return false,
        };
        self.mode = ParseMode::Normal;
        self.esc.clear();
        if self.esc_debug {
            self.esc_record.push((seq.to_string(), action.name()));
            trim_ring(&mut self.esc_record);
        }
        self.apply_escape(action);
        true
    }

    fn apply_escape(&mut self, action: EscAction) {
        match action {
            EscAction::Ignore(_) => {}
            EscAction::Delete => self.delete_at_cursor(),
            EscAction::MoveToEnd => {
                // One past the last line: open a fresh empty line there.
                self.y = self.lines.len();
                self.lines.push(Line::new());
                self.x = 0;
            }
            EscAction::Key(k) => {
                if matches!(k, 'A' | 'B' | 'C' | 'D') {
                    self.move_cursor(1, k, None);
                } else if let Some(lit) = key_literal(k) {
                    self.write_chars(lit);
                }
            }
            EscAction::Move { n, dir } => self.move_cursor(n, dir, None),
            EscAction::SetCol(x) => self.set_cursor(Some(x), None, None),
            EscAction::SetRow(y) => self.set_cursor(None, Some(y), None),
            EscAction::SetPos { x, y } => self.set_cursor(Some(x), Some(y), None),
            EscAction::SaveCursor => self.saved_cursor = (self.x, self.y),
            EscAction::RestoreCursor => {
                self.x = self.saved_cursor.0;
                self.y = self.saved_cursor.1;
                self.normalize(None);
            }
            EscAction::ClearLine(m) => self.clear_line(m),
            EscAction::ClearScreen(m) => self.clear_screen(m),
            EscAction::UseAltBuffer => self.buffer = BufferTag::Alter,
            EscAction::UseMainBuffer => self.buffer = BufferTag::Main,
            EscAction::Literal(s) => self.write_chars(s),
        }
    }

    /// Delete under the cursor; in insert mode a delete past end-of-line
    /// pulls the next line up (when `auto_remove_line`).
    fn delete_at_cursor(&mut self) {
        if self.insert_mode {
            if self.x < self.lines[self.y].len() {
                let x = self.x;
                self.lines[self.y].remove(x);
            } else if self.y + 1 < self.lines.len() && self.auto_remove_line {
                let tail = self.lines.remove(self.y + 1);
                self.lines[self.y].append(tail);
            }
        } else {
            let x = self.x;
            self.lines[self.y].set(x, ' ');
        }
    }

    fn clear_line(&mut self, mode: u8) {
        match mode {
            0 => {
                let x = self.x;
                self.lines[self.y].truncate(x);
            }
            1 => {
                let x = self.x;
                self.lines[self.y].blank_left(x);
            }
            2 => self.lines[self.y].clear(),
            _ => {}
        }
        self.normalize(None);
    }

    fn clear_screen(&mut self, mode: u8) {
        match mode {
            0 => {
                let keep = self.y + 1;
                self.lines.truncate(keep);
            }
            1 => {
                let start = self.real_y(0);
                for i in start..self.y {
                    self.lines[i].clear();
                }
            }
            2 => {
                // Keep the old screen above the fold instead of destroying
                // it; `close()` will hand it to the scroll-off sink.
                if self.keep_logs_when_clean_screen {
                    self.start_y = self.y as isize;
                }
                let keep = self.real_y(0);
                self.lines.truncate(keep);
            }
            _ => {}
        }
        self.normalize(None);
        self.clear_line(mode);
    }
}

fn trim_ring<T>(ring: &mut Vec<T>) {
    if ring.len() > ESC_RING {
        let excess = ring.len() - ESC_RING;
        ring.drain(..excess);
    }
}

/// How [`render`] should draw the grid.
pub struct RenderOptions {
    /// Columns available for content; `None` falls back to 80.
    pub width: Option<usize>,
    /// Rows to draw; `None` means `max_height` framed, every line unframed.
    pub height: Option<usize>,
    /// Draw a `+---+` border with a status footer.
    pub frame: bool,
    /// Line terminator.
    pub end: &'static str,
    /// Marker appended to every line (the watch view uses `<`).
    pub tail: &'static str,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            width: None,
            height: None,
            frame: true,
            end: "\r\n",
            tail: "",
        }
    }
}

/// Draw the grid with the cursor cell highlighted in reverse video, plus a
/// status footer when framed.  Returns the string to write to the terminal.
pub fn render(screen: &Screen, opts: &RenderOptions) -> String {
    let width = opts.width.unwrap_or(80);
    let height = opts.height.unwrap_or(if opts.frame {
        screen.max_height
    } else {
        screen.lines.len()
    });
    let (y_begin, y_end) = if screen.lines.len() > height {
        (screen.lines.len() - height, screen.lines.len())
    } else {
        (0, height)
    };

    let mut out = String::new();
    let border = format!("+{}+{}", "-".repeat(width), opts.end);
    if opts.frame {
        out.push_str(&border);
    }
    for i in y_begin..y_end {
        let mut cells: Vec<char> = screen
            .lines
            .get(i)
            .map(|l| l.chars().collect())
            .unwrap_or_default();
        cells.extend(opts.tail.chars());
        if opts.frame {
            cells.truncate(width);
        }
        while cells.len() < width {
            cells.push(' ');
        }
        let mut display = String::new();
        if screen.y == i && screen.x < cells.len() {
            // Reverse-video cell marks the cursor.
            for (j, c) in cells.iter().enumerate() {
                if j == screen.x {
                    display.push_str("\x1b[7m");
                    display.push(*c);
                    display.push_str("\x1b[0m");
                } else {
                    display.push(*c);
                }
            }
        } else {
            display.extend(cells.iter());
        }
        if opts.frame {
            out.push('|');
            out.push_str(&display);
            out.push('|');
        } else {
            out.push_str(display.trim_end_matches(' '));
        }
        out.push_str(opts.end);
    }
    if opts.frame {
        out.push_str(&border);
        let vis = screen.visible_start_hint();
        out.push_str(&format!(
            "cursor: {{x={},y={}}}, lines: {}, offset: {}, height: {}, buffer: {}, mode: {}",
            screen.x + 1,
            screen.y.saturating_sub(vis) + 1,
            screen.lines.len(),
            screen.start_offset(),
            screen.max_height,
            screen.buffer,
            match screen.mode {
                ParseMode::Normal => "normal",
                ParseMode::Esc => "esc",
            },
        ));
        if screen.mode == ParseMode::Esc {
            out.push_str(&format!(", esc={:?}", screen.esc));
        }
        out.push_str(opts.end);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn lines(s: &Screen) -> Vec<String> {
        s.lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_plain_text_and_newlines() {
        let mut s = Screen::new();
        s.write_chars("abcde");
        assert_eq!(lines(&s), vec!["abcde"]);
        assert_eq!((s.x, s.y), (5, 0));
        s.write_chars("\r\nhello");
        assert_eq!(lines(&s), vec!["abcde", "hello"]);
        assert_eq!((s.x, s.y), (5, 1));
    }

    #[test]
    fn test_lf_without_cr_keeps_column() {
        let mut s = Screen::new();
        s.write_chars("ab\ncd");
        // Column survives the line feed; the hole is space-padded.
        assert_eq!(lines(&s), vec!["ab", "  cd"]);
        assert_eq!((s.x, s.y), (4, 1));
    }

    #[test]
    fn test_cr_overwrites_from_column_zero() {
        let mut s = Screen::new();
        s.write_chars("abcde\rXY");
        assert_eq!(lines(&s), vec!["XYcde"]);
    }

    #[test]
    fn test_backspace_overwrite_mode_only_moves() {
        let mut s = Screen::new();
        s.write_chars("abcde\u{8}\u{8}\u{8}+");
        assert_eq!(lines(&s), vec!["ab+de"]);
        assert_eq!(s.x, 3);
    }

    #[test]
    fn test_backspace_insert_mode_deletes() {
        let mut s = Screen::edit_buffer();
        s.write_chars("abcde\u{8}\u{8}");
        assert_eq!(s.current_line(), "abc");
        assert_eq!(s.x, 3);
    }

    #[test]
    fn test_backspace_merges_lines_when_auto_remove() {
        let mut s = Screen::edit_buffer();
        s.auto_remove_line = true;
        s.write_chars("ab\ncd");
        assert_eq!(lines(&s), vec!["ab", "cd"]);
        s.x = 0;
        s.write_char('\u{8}');
        assert_eq!(lines(&s), vec!["abcd"]);
        assert_eq!((s.x, s.y), (2, 0));
    }

    #[test]
    fn test_insert_mode_lf_splits_line() {
        let mut s = Screen::edit_buffer();
        s.write_chars("abcd");
        s.x = 2;
        s.write_char('\n');
        assert_eq!(lines(&s), vec!["ab", "cd"]);
        assert_eq!((s.x, s.y), (0, 1));
    }

    #[test]
    fn test_sgr_does_not_change_text() {
        let mut plain = Screen::new();
        plain.write_chars("colortext-nocolortext");
        let mut colored = Screen::new();
        colored.write_chars("\x1b[34mcolortext\x1b[0m-nocolortext");
        assert_eq!(plain.text(), colored.text());
    }

    #[test]
    fn test_save_restore_cursor_round_trip() {
        let mut s = Screen::new();
        s.write_chars("base");
        let before = (s.x, s.y);
        s.write_chars("\x1b7 more text here\x1b8");
        assert_eq!((s.x, s.y), before);
        assert!(s.text().contains("more text here"));
    }

    #[test]
    fn test_absolute_positioning_overwrites() {
        let mut s = Screen::new();
        s.max_height = 5;
        s.write_chars("aaaa\r\nbbbb\r\ncccc");
        s.write_chars("\x1b[1;1H+=+");
        assert_eq!(lines(&s)[0], "+=+a");
        s.write_chars("\x1b[2;2HXX");
        assert_eq!(lines(&s)[1], "bXXb");
    }

    #[test]
    fn test_clear_line_modes() {
        let mut s = Screen::new();
        s.write_chars("abcdef");
        s.x = 3;
        s.write_chars("\x1b[K");
        assert_eq!(s.current_line(), "abc");

        let mut s = Screen::new();
        s.write_chars("abcdef");
        s.x = 3;
        s.write_chars("\x1b[1K");
        assert_eq!(s.current_line(), "   def");

        let mut s = Screen::new();
        s.write_chars("abcdef");
        s.write_chars("\x1b[2K");
        assert_eq!(s.current_line(), "");
    }

    #[test]
    fn test_clear_screen_below() {
        let mut s = Screen::new();
        s.write_chars("aa\r\nbb\r\ncc\r\ndd");
        s.set_cursor(Some(1), Some(2), None);
        s.write_chars("\x1b[J");
        assert_eq!(lines(&s), vec!["aa", ""]);
    }

    #[test]
    fn test_clear_screen_keeps_logs() {
        // Scenario: A, B, C then a full clear with logs kept.
        let mut s = Screen::new();
        s.keep_logs_when_clean_screen = true;
        s.write_chars("A\r\nB\r\nC\r\n");
        let prior_y = s.y;
        s.write_chars("\x1b[2J\x1b[H");
        assert_eq!(s.start_offset(), prior_y as isize);
        assert_eq!(s.y, prior_y);
        assert_eq!(s.x, 0);
        // The old screen is still above the fold.
        assert_eq!(lines(&s)[..3], ["A".to_string(), "B".into(), "C".into()]);
        s.write_chars("fresh");
        assert_eq!(s.current_line(), "fresh");
    }

    #[test]
    fn test_scrolloff_dump_on_close() {
        #[derive(Default)]
        struct MemSink(Arc<Mutex<Vec<String>>>, Arc<Mutex<bool>>);
        impl HistorySink for MemSink {
            fn write_line(&mut self, line: &str) {
                self.0.lock().unwrap().push(line.to_string());
            }
            fn close(&mut self) {
                *self.1.lock().unwrap() = true;
            }
        }
        let sunk = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let mut s = Screen::with_sink(Box::new(MemSink(sunk.clone(), closed.clone())));
        s.keep_logs_when_clean_screen = true;
        s.write_chars("A\r\nB\r\nC\r\n");
        s.write_chars("\x1b[2J\x1b[H");
        s.close();
        let got = sunk.lock().unwrap().join("\n");
        assert!(got.starts_with("A\nB\nC"));
        assert!(*closed.lock().unwrap());
    }

    #[test]
    fn test_max_lines_overflow_dumps_oldest() {
        let mut s = Screen::new();
        s.max_lines = 3;
        s.write_chars("1\r\n2\r\n3\r\n4\r\n5");
        assert!(s.lines.len() <= 3);
        assert_eq!(s.dropped_lines, 2);
        assert_eq!(lines(&s), vec!["3", "4", "5"]);
        assert_eq!(s.current_line(), "5");
    }

    #[test]
    fn test_raw_ring_bounded() {
        let mut s = Screen::new();
        s.max_chars = 10;
        s.write_chars("0123456789abcdef");
        assert_eq!(s.raw(), "6789abcdef");
        assert_eq!(s.dropped_chars, 6);
        assert_eq!(s.total_chars, 16);
        assert_eq!(s.total_chars - s.raw().chars().count(), s.dropped_chars);
    }

    #[test]
    fn test_unknown_escape_recovery() {
        // Scenario: an unknown sequence followed by a known one.  The first
        // lands in the error ring, the second is eaten silently, and the
        // grid text is untouched.
        let mut s = Screen::new();
        s.write_chars("before");
        s.write_chars("\x1b[99~\x1b[?25l");
        assert_eq!(s.mode, ParseMode::Normal);
        assert_eq!(s.esc_err.len(), 1);
        assert!(s.esc_err[0].starts_with("\x1b[99~"));
        assert_eq!(s.text(), "before");
    }

    #[test]
    fn test_esc_debug_records_matches() {
        let mut s = Screen::new();
        s.esc_debug = true;
        s.write_chars("\x1b[31m\x1b[2K");
        assert_eq!(s.esc_record.len(), 2);
        assert_eq!(s.esc_record[0].0, "\x1b[31m");
    }

    #[test]
    fn test_osc_title_swallowed() {
        let mut s = Screen::new();
        s.write_chars("\x1b]0;window title\x07text");
        assert_eq!(s.text(), "text");
    }

    #[test]
    fn test_alt_buffer_tag_switch() {
        let mut s = Screen::new();
        s.write_chars("kept");
        s.write_chars("\x1b[?1049h");
        assert_eq!(s.buffer, BufferTag::Alter);
        assert_eq!(s.text(), "kept");
        s.write_chars("\x1b[?1049l");
        assert_eq!(s.buffer, BufferTag::Main);
    }

    #[test]
    fn test_arrow_key_moves_between_history_lines() {
        // The edit buffer relies on the parser for history recall.
        let mut s = Screen::edit_buffer();
        s.write_chars("first\nsecond\n");
        assert_eq!((s.x, s.y), (0, 2));
        s.write_chars("\x1b[A");
        assert_eq!(s.y, 1);
        // auto_move_to_end lands the cursor at end-of-line.
        assert_eq!(s.x, "second".len());
        s.write_chars("\x1b[B");
        assert_eq!(s.y, 2);
    }

    #[test]
    fn test_horizontal_slide_between_lines() {
        let mut s = Screen::edit_buffer();
        s.auto_move_between_line = true;
        s.write_chars("ab\ncd");
        s.x = 0;
        s.write_chars("\x1b[D");
        assert_eq!((s.x, s.y), (2, 0));
        s.write_chars("\x1b[C");
        // At end of "ab" a right-move slides to the start of "cd".
        assert_eq!((s.x, s.y), (0, 1));
    }

    #[test]
    fn test_keypad_application_digits() {
        let mut s = Screen::new();
        s.write_chars("\x1bOp\x1bOq\x1bOr");
        assert_eq!(s.text(), "012");
    }

    #[test]
    fn test_end_key_opens_line_past_last() {
        let mut s = Screen::new();
        s.write_chars("one\r\ntwo");
        let n = s.lines.len();
        s.write_chars("\x1b[F");
        assert_eq!(s.y, n);
        assert_eq!((s.x, s.current_line().as_str()), (0, ""));
    }

    #[test]
    fn test_delete_key_flavors() {
        let mut s = Screen::edit_buffer();
        s.write_chars("abc");
        s.x = 1;
        s.write_chars("\x1b[3~");
        assert_eq!(s.current_line(), "ac");

        let mut s = Screen::new();
        s.write_chars("abc");
        s.x = 1;
        s.write_chars("\x1b[3~");
        assert_eq!(s.current_line(), "a c");
    }

    #[test]
    fn test_invariants_hold_after_arbitrary_bytes() {
        let streams: [&[u8]; 5] = [
            b"\x1b[10;99H@@\x1b[K\x1b[5Axyz",
            b"no escapes at all, just text\r\n\r\n",
            b"\x1b[99999C\x1b[99999B.",
            b"\xff\xfe garbage \x1b[1;31mred\x1b[0m",
            b"\x1b]0;half-finished osc",
        ];
        for bytes in streams {
            let mut s = Screen::new();
            s.write(bytes);
            if s.mode == ParseMode::Normal {
                assert!(s.y < s.lines.len());
            }
            assert!(s.lines.len() <= s.max_lines);
            assert!(s.raw().chars().count() <= s.max_chars);
        }
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut s = Screen::new();
        let bytes = "héllo".as_bytes();
        s.write(&bytes[..2]);
        s.write(&bytes[2..]);
        assert_eq!(s.text(), "héllo");
    }

    #[test]
    fn test_render_frame_and_footer() {
        let mut s = Screen::new();
        s.max_height = 3;
        s.write_chars("hi");
        let out = render(
            &s,
            &RenderOptions {
                width: Some(10),
                ..Default::default()
            },
        );
        assert!(out.starts_with("+----------+"));
        assert!(out.contains("|hi"));
        assert!(out.contains("buffer: main"));
        assert!(out.contains("mode: normal"));
    }
}
