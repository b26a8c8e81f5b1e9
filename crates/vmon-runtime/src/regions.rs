//! Terminal display regions.
//!
//! `TerminalRegion` buffers a widget's text for the dashboard screen;
//! `StdoutRegion` writes output straight through, for `exec` and `console`.
//! Both neutralize control characters before anything reaches the terminal.

use std::io::{self, Write};
use std::sync::Arc;

use tokio::sync::Mutex;

use vmon_core::{DisplayRegion, RegionId, escape_control};
use vmon_transport::SharedRegion;

const FRAME_WIDTH: usize = 60;

/// Buffered region rendered by the monitor screen.
#[derive(Debug, Clone, Default)]
pub struct TerminalRegion {
    content: String,
    loading: bool,
    dirty: bool,
}

impl TerminalRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Header line plus the content, trailing newline included.
    pub fn render(&self, id: &RegionId) -> String {
        let status = if self.loading { " (updating)" } else { "" };
        let title = format!("── {id}{status} ");
        let pad = FRAME_WIDTH.saturating_sub(title.chars().count());
        let mut out = format!("{title}{}\n", "─".repeat(pad));
        out.push_str(&self.content);
        if !self.content.is_empty() && !self.content.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

impl DisplayRegion for TerminalRegion {
    fn text(&self) -> String {
        self.content.clone()
    }

    fn replace_text(&mut self, text: &str) {
        self.content = escape_control(text);
        self.dirty = true;
    }

    fn append_escaped(&mut self, text: &str) {
        self.content.push_str(&escape_control(text));
        self.dirty = true;
    }

    fn set_loading(&mut self, loading: bool) {
        if self.loading != loading {
            self.loading = loading;
            self.dirty = true;
        }
    }
}

/// The monitor dashboard: one framed block per widget region.
#[derive(Debug, Default)]
pub struct Screen {
    regions: Vec<(RegionId, Arc<Mutex<TerminalRegion>>)>,
}

impl Screen {
    pub fn new(ids: impl IntoIterator<Item = RegionId>) -> Self {
        Self {
            regions: ids
                .into_iter()
                .map(|id| (id, Arc::new(Mutex::new(TerminalRegion::new()))))
                .collect(),
        }
    }

    /// Regions in the form the client loop writes to.
    pub fn shared_regions(&self) -> Vec<(RegionId, SharedRegion)> {
        self.regions
            .iter()
            .map(|(id, region)| {
                let shared: SharedRegion = region.clone();
                (id.clone(), shared)
            })
            .collect()
    }

    /// Full frame when any region changed since the last render, else `None`.
    /// Regions locked by a writer at this instant are picked up next time.
    pub fn render_if_dirty(&self) -> Option<String> {
        let mut changed = false;
        let mut blocks = Vec::with_capacity(self.regions.len());
        for (id, region) in &self.regions {
            let Ok(mut region) = region.try_lock() else {
                changed = true;
                continue;
            };
            changed |= region.take_dirty();
            blocks.push(region.render(id));
        }
        if !changed {
            return None;
        }
        Some(blocks.join("\n"))
    }

    /// Redraw on every `interval` until cancelled by the caller dropping the future.
    pub async fn run(&self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Some(frame) = self.render_if_dirty() {
                // Clear screen + cursor home
                print!("\x1b[2J\x1b[H{frame}");
                let _ = io::stdout().flush();
            }
        }
    }
}

/// Region that streams straight to a writer (stdout by default).
#[derive(Debug)]
pub struct StdoutRegion<W = io::Stdout> {
    out: W,
    content: String,
}

impl StdoutRegion {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> StdoutRegion<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            content: String::new(),
        }
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()) {
            tracing::debug!("terminal write failed: {e}");
        }
    }
}

impl<W: Write + Send> DisplayRegion for StdoutRegion<W> {
    fn text(&self) -> String {
        self.content.clone()
    }

    /// A terminal cannot take back what it printed; the new text starts here.
    fn replace_text(&mut self, text: &str) {
        let text = escape_control(text);
        self.emit(&text);
        self.content = text;
    }

    fn append_escaped(&mut self, text: &str) {
        let text = escape_control(text);
        self.emit(&text);
        self.content.push_str(&text);
    }

    /// Plain streams have no indicator; the prompt returning is the signal.
    fn set_loading(&mut self, _loading: bool) {}
}
