//! Display region contract. Regions belong to the presentation layer; the
//! core only looks them up by id and writes through this trait.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::output::escape_markup;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub String);

impl RegionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RegionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Operations a monitored region must support.
///
/// `append_escaped` receives raw device text; each implementation escapes it
/// for its own medium before it becomes visible.
pub trait DisplayRegion: Send {
    fn text(&self) -> String;
    fn replace_text(&mut self, text: &str);
    fn append_escaped(&mut self, text: &str);
    fn scroll_to_end(&mut self) {}
    fn set_loading(&mut self, loading: bool);
}

/// In-memory markup region, e.g. the backing store of a web or TUI view.
#[derive(Debug, Clone, Default)]
pub struct BufferRegion {
    content: String,
    loading: bool,
    scrolled: usize,
}

impl BufferRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            ..Self::default()
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Number of scroll-to-end requests received.
    pub fn scroll_count(&self) -> usize {
        self.scrolled
    }
}

impl DisplayRegion for BufferRegion {
    fn text(&self) -> String {
        self.content.clone()
    }

    fn replace_text(&mut self, text: &str) {
        self.content = text.to_string();
    }

    fn append_escaped(&mut self, text: &str) {
        self.content.push_str(&escape_markup(text));
    }

    fn scroll_to_end(&mut self) {
        self.scrolled += 1;
    }

    fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_region_escapes_appends() {
        let mut region = BufferRegion::with_text("ok\n");
        region.append_escaped("<b>x</b> & y");
        assert_eq!(region.text(), "ok\n&lt;b&gt;x&lt;/b&gt; &amp; y");
    }

    #[test]
    fn replace_is_verbatim() {
        let mut region = BufferRegion::with_text("old");
        region.replace_text("");
        assert_eq!(region.text(), "");
    }

    #[test]
    fn region_id_display() {
        assert_eq!(RegionId::from("#main").to_string(), "#main");
    }
}
