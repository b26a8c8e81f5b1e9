//! Metric snapshot and its single-writer store.

use std::collections::HashMap;

use serde_json::Value;

use crate::message::MetricDelta;
use crate::reload::{DEFAULT_MONOTONIC_KEY, ReloadGuard, ReloadRequired, counter_value};

/// Latest known value for every metric key seen so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSnapshot {
    values: HashMap<String, Value>,
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shallow merge: keys present in `delta` overwrite, absent keys are untouched.
    pub fn merge(&mut self, delta: &MetricDelta) {
        for (key, value) in delta {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Owner of the snapshot. Only the client event loop holds a `&mut`.
#[derive(Debug, Clone)]
pub struct StateStore {
    snapshot: MetricSnapshot,
    guard: ReloadGuard,
    monotonic_key: String,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_MONOTONIC_KEY)
    }
}

impl StateStore {
    pub fn new(monotonic_key: impl Into<String>) -> Self {
        Self {
            snapshot: MetricSnapshot::new(),
            guard: ReloadGuard::new(),
            monotonic_key: monotonic_key.into(),
        }
    }

    pub fn snapshot(&self) -> &MetricSnapshot {
        &self.snapshot
    }

    /// Run restart detection on the delta's monotonic key, then merge.
    /// On regression nothing is merged.
    pub fn apply_delta(&mut self, delta: &MetricDelta) -> Result<(), ReloadRequired> {
        if let Some(value) = delta.get(&self.monotonic_key) {
            self.guard.check_monotonic(counter_value(value))?;
        }
        self.snapshot.merge(delta);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(v: Value) -> MetricDelta {
        match v {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn merge_overwrites_present_keys_only() {
        let mut snap = MetricSnapshot::new();
        snap.merge(&delta(json!({"a": 1, "b": "x"})));
        snap.merge(&delta(json!({"a": 2})));
        assert_eq!(snap.get("a"), Some(&json!(2)));
        assert_eq!(snap.get("b"), Some(&json!("x")));
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let d = delta(json!({"v.b.soc": 80, "v.p.location": {"lat": 1.5}}));
        let mut once = MetricSnapshot::new();
        once.merge(&d);
        let mut twice = once.clone();
        twice.merge(&d);
        assert_eq!(once, twice);
    }

    #[test]
    fn store_checks_monotonic_before_merge() {
        let mut store = StateStore::default();
        store
            .apply_delta(&delta(json!({"m.monotonic": 100, "a": 1})))
            .expect("first");
        let err = store
            .apply_delta(&delta(json!({"m.monotonic": 5, "a": 2})))
            .expect_err("restart");
        assert_eq!(err.observed, 5);
        assert_eq!(store.snapshot().get("a"), Some(&json!(1)), "not merged");
    }

    #[test]
    fn store_without_monotonic_key_merges() {
        let mut store = StateStore::new("m.uptime");
        store.apply_delta(&delta(json!({"a": 1}))).expect("merge");
        store.apply_delta(&delta(json!({"m.monotonic": 0}))).expect("other key ignored");
        assert_eq!(store.snapshot().len(), 2);
    }
}
