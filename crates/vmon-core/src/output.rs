//! Output assembly for streaming command runs.
//!
//! The execute endpoint answers with one HTTP response whose body grows while
//! the command runs. The client keeps the full response text and forwards
//! only the part beyond what it already displayed.

use serde::{Deserialize, Serialize};

use crate::region::DisplayRegion;

/// How a run's output lands in its region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Clear the region before the first output.
    #[default]
    Replace,
    /// Keep the region's history, separate the new run with a marker line.
    Append,
}

/// Full response text, decoded incrementally from byte chunks.
///
/// Multi-byte characters split across chunks are held back until complete.
#[derive(Debug, Clone, Default)]
pub struct ResponseText {
    text: String,
    pending: Vec<u8>,
}

impl ResponseText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk and return the (grown) full text.
    pub fn push(&mut self, chunk: &[u8]) -> &str {
        self.pending.extend_from_slice(chunk);
        let mut consumed = 0;
        loop {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    self.text.push_str(s);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    consumed += valid;
                    match e.error_len() {
                        Some(bad) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            consumed += bad;
                        }
                        None => break,
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        &self.text
    }

    /// Flush an incomplete trailing sequence, if any.
    pub fn finish(&mut self) -> &str {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.text.push_str(&tail);
            self.pending.clear();
        }
        &self.text
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Tracks how much of the growing response was already forwarded.
#[derive(Debug, Clone, Default)]
pub struct DeltaTracker {
    last_len: usize,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text in `full` beyond the previously recorded length.
    pub fn delta<'a>(&mut self, full: &'a str) -> &'a str {
        let delta = full.get(self.last_len..).unwrap_or("");
        self.last_len = full.len();
        delta
    }

    pub fn seen(&self) -> usize {
        self.last_len
    }
}

/// Writes one run's output into a region according to its [`OutputMode`].
///
/// The region is only touched once there is something to show: a replace-mode
/// region keeps its previous content until the first chunk or error arrives.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    mode: OutputMode,
    command: String,
    started: bool,
}

impl OutputWriter {
    pub fn new(mode: OutputMode, command: impl Into<String>) -> Self {
        Self {
            mode,
            command: command.into(),
            started: false,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    fn begin(&mut self, region: &mut dyn DisplayRegion) {
        if self.started {
            return;
        }
        self.started = true;
        match self.mode {
            OutputMode::Replace => region.replace_text(""),
            OutputMode::Append => {
                let current = region.text();
                if !current.is_empty() && !current.ends_with('\n') {
                    region.append_escaped("\n");
                }
                region.append_escaped(&separator_marker(&self.command));
            }
        }
    }

    pub fn write_chunk(&mut self, region: &mut dyn DisplayRegion, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.begin(region);
        region.append_escaped(delta);
        region.scroll_to_end();
    }

    pub fn write_error(&mut self, region: &mut dyn DisplayRegion, text: &str) {
        self.begin(region);
        region.append_escaped(text);
        if !text.ends_with('\n') {
            region.append_escaped("\n");
        }
        region.scroll_to_end();
    }
}

/// Marker line written before a run's output in append mode.
pub fn separator_marker(command: &str) -> String {
    format!("$ {command}\n")
}

/// Escape text for inclusion in HTML-like markup.
pub fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape text for a terminal: control characters other than newline and tab
/// are shown as `^X` / `\u{..}` instead of being interpreted.
pub fn escape_control(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' | '\t' => out.push(c),
            '\r' => {}
            c if (c as u32) < 0x20 => {
                out.push('^');
                out.push((b'@' + c as u8) as char);
            }
            c if c.is_control() => out.push_str(&format!("\\u{{{:x}}}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::BufferRegion;

    #[test]
    fn delta_only_append() {
        let mut tracker = DeltaTracker::new();
        assert_eq!(tracker.delta("A"), "A");
        assert_eq!(tracker.delta("AB"), "B");
        assert_eq!(tracker.delta("ABC"), "C");
        assert_eq!(tracker.delta("ABC"), "");
        assert_eq!(tracker.seen(), 3);
    }

    #[test]
    fn delta_tolerates_shrinking_text() {
        let mut tracker = DeltaTracker::new();
        tracker.delta("ABCD");
        assert_eq!(tracker.delta("AB"), "");
    }

    #[test]
    fn response_text_joins_split_utf8() {
        let mut resp = ResponseText::new();
        let bytes = "temp 21°C".as_bytes();
        let split = bytes.len() - 2; // inside the two-byte '°'
        assert_eq!(resp.push(&bytes[..split]), "temp 21");
        assert_eq!(resp.push(&bytes[split..]), "temp 21°C");
    }

    #[test]
    fn response_text_replaces_invalid_bytes() {
        let mut resp = ResponseText::new();
        assert_eq!(resp.push(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }

    #[test]
    fn response_text_finish_flushes_tail() {
        let mut resp = ResponseText::new();
        resp.push(&[b'x', 0xc3]);
        assert_eq!(resp.as_str(), "x");
        assert_eq!(resp.finish(), "x\u{fffd}");
    }

    #[test]
    fn replace_mode_clears_lazily() {
        let mut region = BufferRegion::with_text("old output");
        let mut writer = OutputWriter::new(OutputMode::Replace, "stat");
        writer.write_chunk(&mut region, "");
        assert_eq!(region.text(), "old output", "untouched before first chunk");
        writer.write_chunk(&mut region, "SOC 80%");
        writer.write_chunk(&mut region, "\n");
        assert_eq!(region.text(), "SOC 80%\n");
    }

    #[test]
    fn append_mode_keeps_history_and_marks_run() {
        let mut region = BufferRegion::with_text("previous");
        let mut writer = OutputWriter::new(OutputMode::Append, "metrics list");
        writer.write_chunk(&mut region, "a=1\n");
        assert_eq!(region.text(), "previous\n$ metrics list\na=1\n");
    }

    #[test]
    fn chunks_are_escaped() {
        let mut region = BufferRegion::new();
        let mut writer = OutputWriter::new(OutputMode::Replace, "x");
        writer.write_chunk(&mut region, "<script>");
        assert_eq!(region.text(), "&lt;script&gt;");
    }

    #[test]
    fn error_replaces_when_nothing_shown() {
        let mut region = BufferRegion::with_text("stale");
        let mut writer = OutputWriter::new(OutputMode::Replace, "x");
        writer.write_error(&mut region, "Error: timeout");
        assert_eq!(region.text(), "Error: timeout\n");
    }

    #[test]
    fn error_appends_after_partial_output() {
        let mut region = BufferRegion::new();
        let mut writer = OutputWriter::new(OutputMode::Replace, "x");
        writer.write_chunk(&mut region, "partial\n");
        writer.write_error(&mut region, "aborted");
        assert_eq!(region.text(), "partial\naborted\n");
    }

    #[test]
    fn escape_control_neutralizes_ansi() {
        assert_eq!(escape_control("\x1b[2Jhi\r\n"), "^[[2Jhi\n");
        assert_eq!(escape_control("tab\there"), "tab\there");
        assert_eq!(escape_control("\u{9b}x"), "\\u{9b}x");
    }
}
