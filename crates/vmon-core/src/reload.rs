//! Device restart detection.
//!
//! The device publishes a monotonic counter (`m.monotonic` by default). A value
//! lower than the last one seen means the device rebooted and every piece of
//! client-side state is stale. That is fatal to the session: the caller must
//! rebuild the client from scratch, never retry in place.

use serde_json::Value;
use thiserror::Error;

/// Default metric key carrying the device monotonic counter.
pub const DEFAULT_MONOTONIC_KEY: &str = "m.monotonic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("device restart detected: monotonic counter went from {last} to {observed}")]
pub struct ReloadRequired {
    pub last: i64,
    pub observed: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ReloadGuard {
    last: i64,
}

impl ReloadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> i64 {
        self.last
    }

    /// Accept `observed` if it did not regress, else signal a reload.
    /// The stored value is left unchanged on regression.
    pub fn check_monotonic(&mut self, observed: i64) -> Result<(), ReloadRequired> {
        if observed < self.last {
            return Err(ReloadRequired {
                last: self.last,
                observed,
            });
        }
        self.last = observed;
        Ok(())
    }
}

/// Interpret a metric value as a counter: integers, floats (truncated) and
/// numeric strings. Anything else reads as 0.
pub fn counter_value(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => parse_leading_int(s),
        _ => 0,
    }
}

fn parse_leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().map(|n| sign * n).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increasing_sequence_never_reloads() {
        let mut guard = ReloadGuard::new();
        for v in [100, 101, 102] {
            guard.check_monotonic(v).expect("monotonic");
        }
        assert_eq!(guard.last(), 102);
    }

    #[test]
    fn regression_reloads_at_third_value() {
        let mut guard = ReloadGuard::new();
        assert!(guard.check_monotonic(100).is_ok());
        assert!(guard.check_monotonic(101).is_ok());
        let err = guard.check_monotonic(50).expect_err("regression");
        assert_eq!(err, ReloadRequired { last: 101, observed: 50 });
        assert_eq!(guard.last(), 101, "last value kept on regression");
    }

    #[test]
    fn equal_value_is_not_a_regression() {
        let mut guard = ReloadGuard::new();
        guard.check_monotonic(7).expect("first");
        guard.check_monotonic(7).expect("repeat");
    }

    #[test]
    fn counter_value_shapes() {
        assert_eq!(counter_value(&Value::from(42)), 42);
        assert_eq!(counter_value(&Value::from(42.9)), 42);
        assert_eq!(counter_value(&Value::from("1234")), 1234);
        assert_eq!(counter_value(&Value::from(" 77sec")), 77);
        assert_eq!(counter_value(&Value::from("-3")), -3);
        assert_eq!(counter_value(&Value::from("n/a")), 0);
        assert_eq!(counter_value(&Value::Null), 0);
    }
}
