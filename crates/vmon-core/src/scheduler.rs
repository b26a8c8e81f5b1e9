//! Widget scheduler: decides which monitor widgets refresh, and when.
//!
//! A monitor widget re-runs a status command into its display region, either
//! on a cadence (a bounded number of times) or whenever a matching named
//! event arrives. The scheduler only decides; it hands back
//! [`RefreshRequest`]s for the caller to execute and is told via
//! [`WidgetScheduler::complete`] when a run has finished.
//!
//! Invariants:
//! - a widget without a refresh command is display-only and never scheduled;
//! - at most one run per widget is in flight; further triggers are coalesced
//!   (no decrement, no timestamp update) until `complete` is called;
//! - at most one run per region: a widget whose region already has a run in
//!   flight is skipped, the same way;
//! - event triggers ignore `remaining_refreshes`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use thiserror::Error;

use crate::output::OutputMode;
use crate::region::RegionId;

/// Cadence used when a command button arms a widget without one.
pub const DEFAULT_WATCH_CADENCE_SECS: u64 = 2;

#[derive(Debug, Error)]
#[error("invalid pattern {pattern:?}: {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetId(u64);

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Registration parameters for a monitor widget.
#[derive(Debug, Clone)]
pub struct WidgetSpec {
    pub region: RegionId,
    pub refresh_command: Option<String>,
    pub cadence_secs: Option<u64>,
    pub remaining_refreshes: u32,
    pub event_pattern: Option<String>,
    pub mode: OutputMode,
}

#[derive(Debug, Clone)]
pub struct MonitorWidget {
    pub id: WidgetId,
    /// Back-reference used for lookup only.
    pub region: RegionId,
    pub refresh_command: Option<String>,
    pub cadence_secs: Option<u64>,
    pub remaining_refreshes: u32,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub event_pattern: Option<Regex>,
    pub mode: OutputMode,
    pub in_flight: bool,
}

impl MonitorWidget {
    fn cadence_due(&self, now: DateTime<Utc>) -> bool {
        let Some(cadence) = self.cadence_secs else {
            return false;
        };
        match self.last_refresh_at {
            None => true,
            // a cadence beyond chrono's range never comes round again
            Some(last) => cadence_delta(cadence).is_some_and(|period| now - last >= period),
        }
    }

    fn matches_event(&self, name: &str) -> bool {
        self.event_pattern
            .as_ref()
            .is_some_and(|re| re.is_match(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Cadence,
    Event,
    Prime,
}

/// One widget refresh the caller must execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub widget: WidgetId,
    pub region: RegionId,
    pub command: String,
    pub mode: OutputMode,
    pub trigger: Trigger,
}

#[derive(Debug, Default)]
pub struct WidgetScheduler {
    widgets: BTreeMap<WidgetId, MonitorWidget>,
    next_id: u64,
}

impl WidgetScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_widget(&mut self, spec: WidgetSpec) -> Result<WidgetId, PatternError> {
        let event_pattern = spec
            .event_pattern
            .map(|p| {
                Regex::new(&p).map_err(|source| PatternError {
                    pattern: p.clone(),
                    source,
                })
            })
            .transpose()?;

        let id = WidgetId(self.next_id);
        self.next_id += 1;
        self.widgets.insert(
            id,
            MonitorWidget {
                id,
                region: spec.region,
                refresh_command: spec.refresh_command.filter(|c| !c.trim().is_empty()),
                cadence_secs: spec.cadence_secs,
                remaining_refreshes: spec.remaining_refreshes,
                last_refresh_at: None,
                event_pattern,
                mode: spec.mode,
                in_flight: false,
            },
        );
        Ok(id)
    }

    /// Drop every widget living in `region`. Returns how many were removed.
    pub fn unregister_region(&mut self, region: &RegionId) -> usize {
        let before = self.widgets.len();
        self.widgets.retain(|_, w| &w.region != region);
        before - self.widgets.len()
    }

    pub fn widget(&self, id: WidgetId) -> Option<&MonitorWidget> {
        self.widgets.get(&id)
    }

    pub fn widgets(&self) -> impl Iterator<Item = &MonitorWidget> {
        self.widgets.values()
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    pub fn is_region_in_flight(&self, region: &RegionId) -> bool {
        self.widgets
            .values()
            .any(|w| &w.region == region && w.in_flight)
    }

    /// Cadence evaluation, once per scheduler tick.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<RefreshRequest> {
        let mut busy = self.busy_regions();
        let mut requests = Vec::new();
        for w in self.widgets.values_mut() {
            if busy.contains(&w.region) || w.remaining_refreshes == 0 || !w.cadence_due(now) {
                continue;
            }
            let Some(command) = w.refresh_command.clone() else {
                continue;
            };
            w.remaining_refreshes -= 1;
            busy.insert(w.region.clone());
            requests.push(start(w, command, now, Trigger::Cadence));
        }
        requests
    }

    /// Refresh every widget whose event pattern matches `name`.
    pub fn on_event(&mut self, name: &str, now: DateTime<Utc>) -> Vec<RefreshRequest> {
        let mut busy = self.busy_regions();
        let mut requests = Vec::new();
        for w in self.widgets.values_mut() {
            if busy.contains(&w.region) || !w.matches_event(name) {
                continue;
            }
            let Some(command) = w.refresh_command.clone() else {
                continue;
            };
            busy.insert(w.region.clone());
            requests.push(start(w, command, now, Trigger::Event));
        }
        requests
    }

    /// Initial population: refresh widgets whose region is still empty, or
    /// all of them when `force` is set. Does not consume refresh budget.
    pub fn prime(
        &mut self,
        now: DateTime<Utc>,
        force: bool,
        is_empty: impl Fn(&RegionId) -> bool,
    ) -> Vec<RefreshRequest> {
        let mut busy = self.busy_regions();
        let mut requests = Vec::new();
        for w in self.widgets.values_mut() {
            if busy.contains(&w.region) || !(force || is_empty(&w.region)) {
                continue;
            }
            let Some(command) = w.refresh_command.clone() else {
                continue;
            };
            busy.insert(w.region.clone());
            requests.push(start(w, command, now, Trigger::Prime));
        }
        requests
    }

    fn busy_regions(&self) -> HashSet<RegionId> {
        self.widgets
            .values()
            .filter(|w| w.in_flight)
            .map(|w| w.region.clone())
            .collect()
    }

    /// Mark a widget's run as finished (success or failure).
    pub fn complete(&mut self, id: WidgetId) {
        if let Some(w) = self.widgets.get_mut(&id) {
            w.in_flight = false;
        }
    }

    /// Stop cadence refreshes in `region`, e.g. while a user command owns it.
    pub fn disarm(&mut self, region: &RegionId) -> usize {
        let mut n = 0;
        for w in self.widgets.values_mut().filter(|w| &w.region == region) {
            w.remaining_refreshes = 0;
            n += 1;
        }
        n
    }

    /// Watch `region` after a user command: `count` more refreshes every
    /// `cadence_secs`, counted from `now`.
    pub fn arm(
        &mut self,
        region: &RegionId,
        count: u32,
        cadence_secs: u64,
        now: DateTime<Utc>,
    ) -> usize {
        let mut n = 0;
        for w in self.widgets.values_mut().filter(|w| &w.region == region) {
            w.remaining_refreshes = count;
            w.cadence_secs = Some(cadence_secs);
            w.last_refresh_at = Some(now);
            n += 1;
        }
        n
    }
}

fn cadence_delta(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

fn start(
    w: &mut MonitorWidget,
    command: String,
    now: DateTime<Utc>,
    trigger: Trigger,
) -> RefreshRequest {
    w.last_refresh_at = Some(now);
    w.in_flight = true;
    RefreshRequest {
        widget: w.id,
        region: w.region.clone(),
        command,
        mode: w.mode,
        trigger,
    }
}
