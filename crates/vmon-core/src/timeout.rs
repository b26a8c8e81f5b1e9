//! Idle-timeout selection for command runs.
//!
//! Most commands answer within seconds. A few (self tests, firmware updates,
//! bus scans) can stay silent for minutes; they get the long timeout. Which
//! commands count as long-running is configuration.

use std::time::Duration;

use regex::RegexSet;

use crate::scheduler::PatternError;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_LONG_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_LONG_RUNNING_PATTERNS: &[&str] = &["^test ", "^ota ", "^co .* scan"];

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    idle: Duration,
    long_idle: Duration,
    long_running: RegexSet,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_IDLE_TIMEOUT_SECS,
            DEFAULT_LONG_IDLE_TIMEOUT_SECS,
            DEFAULT_LONG_RUNNING_PATTERNS,
        )
        .unwrap_or_else(|_| Self::without_patterns(DEFAULT_IDLE_TIMEOUT_SECS))
    }
}

impl TimeoutPolicy {
    pub fn new<S: AsRef<str>>(
        idle_secs: u64,
        long_idle_secs: u64,
        patterns: &[S],
    ) -> Result<Self, PatternError> {
        let long_running = RegexSet::new(patterns.iter().map(AsRef::as_ref)).map_err(|e| {
            PatternError {
                pattern: patterns
                    .iter()
                    .map(AsRef::as_ref)
                    .collect::<Vec<_>>()
                    .join(" | "),
                source: e,
            }
        })?;
        Ok(Self {
            idle: Duration::from_secs(idle_secs),
            long_idle: Duration::from_secs(long_idle_secs),
            long_running,
        })
    }

    /// Single timeout for every command.
    pub fn without_patterns(idle_secs: u64) -> Self {
        Self {
            idle: Duration::from_secs(idle_secs),
            long_idle: Duration::from_secs(idle_secs),
            long_running: RegexSet::empty(),
        }
    }

    pub fn is_long_running(&self, command: &str) -> bool {
        self.long_running.is_match(command)
    }

    pub fn idle_timeout(&self, command: &str) -> Duration {
        if self.is_long_running(command) {
            self.long_idle
        } else {
            self.idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_long_running_commands() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.idle_timeout("stat"), Duration::from_secs(20));
        assert_eq!(policy.idle_timeout("test cpu"), Duration::from_secs(300));
        assert_eq!(policy.idle_timeout("ota flash http"), Duration::from_secs(300));
        assert_eq!(policy.idle_timeout("co can1 scan 1-10"), Duration::from_secs(300));
        assert_eq!(policy.idle_timeout("metrics list test"), Duration::from_secs(20));
    }

    #[test]
    fn custom_patterns() {
        let policy = TimeoutPolicy::new(5, 60, &["^sleep"]).expect("valid");
        assert!(policy.is_long_running("sleep 30"));
        assert_eq!(policy.idle_timeout("test cpu"), Duration::from_secs(5));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = TimeoutPolicy::new(5, 60, &["(unclosed"]).expect_err("invalid");
        assert!(err.pattern.contains("(unclosed"));
    }

    #[test]
    fn without_patterns_uses_one_timeout() {
        let policy = TimeoutPolicy::without_patterns(7);
        assert_eq!(policy.idle_timeout("test cpu"), Duration::from_secs(7));
    }
}
