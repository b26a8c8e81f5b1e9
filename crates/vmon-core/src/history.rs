//! Command history for the interactive console.

use std::collections::VecDeque;

pub const DEFAULT_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct ShellHistory {
    entries: VecDeque<String>,
    limit: usize,
}

impl Default for ShellHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ShellHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Record a line. Blank lines and immediate repeats are not stored.
    pub fn push(&mut self, line: &str) {
        let line = line.trim();
        if !line.is_empty() && self.entries.back().map(String::as_str) != Some(line) {
            if self.entries.len() == self.limit {
                self.entries.pop_front();
            }
            self.entries.push_back(line.to_string());
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Expand `!!` (last command) and `!n` (1-based entry n). Other input is
    /// returned unchanged. `None` if the reference does not exist.
    pub fn expand(&self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed == "!!" {
            return self.entries.back().cloned();
        }
        if let Some(n) = trimmed.strip_prefix('!')
            && let Ok(n) = n.parse::<usize>()
        {
            return n
                .checked_sub(1)
                .and_then(|i| self.entries.get(i))
                .cloned();
        }
        Some(line.to_string())
    }
}
