//! Configuration: TOML file, CLI overrides and defaults.
//!
//! ```toml
//! host = "192.168.4.1"
//! tick_interval_ms = 1000
//! idle_timeout_secs = 20
//! long_idle_timeout_secs = 300
//! long_running_patterns = ["^test ", "^ota ", "^co .* scan"]
//! inhibit_cycles = 5
//! monotonic_key = "m.monotonic"
//!
//! [[widget]]
//! region = "battery"
//! command = "metrics list v.b"
//! cadence_secs = 2
//! refreshes = 30
//! events = "^vehicle\\.charge\\."
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use vmon_core::inhibit::DEFAULT_INHIBIT_CYCLES;
use vmon_core::timeout::{
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_LONG_IDLE_TIMEOUT_SECS, DEFAULT_LONG_RUNNING_PATTERNS,
};
use vmon_core::{
    DEFAULT_MONOTONIC_KEY, OutputMode, PatternError, RegionId, TimeoutPolicy, WidgetScheduler,
    WidgetSpec,
};

pub const DEFAULT_HOST: &str = "192.168.4.1";
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
pub const HOST_ENV: &str = "VMON_HOST";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub host: Option<String>,
    pub tick_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub long_idle_timeout_secs: u64,
    pub long_running_patterns: Vec<String>,
    pub inhibit_cycles: u32,
    pub monotonic_key: String,
    #[serde(rename = "widget")]
    pub widgets: Vec<WidgetConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: None,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            long_idle_timeout_secs: DEFAULT_LONG_IDLE_TIMEOUT_SECS,
            long_running_patterns: DEFAULT_LONG_RUNNING_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            inhibit_cycles: DEFAULT_INHIBIT_CYCLES,
            monotonic_key: DEFAULT_MONOTONIC_KEY.to_string(),
            widgets: Vec::new(),
        }
    }
}

/// One `[[widget]]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WidgetConfig {
    pub region: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub cadence_secs: Option<u64>,
    #[serde(default)]
    pub refreshes: u32,
    /// Regex matched against event names.
    #[serde(default)]
    pub events: Option<String>,
    #[serde(default)]
    pub mode: OutputMode,
}

impl WidgetConfig {
    pub fn to_spec(&self) -> WidgetSpec {
        WidgetSpec {
            region: RegionId::new(self.region.clone()),
            refresh_command: self.command.clone(),
            cadence_secs: self.cadence_secs,
            remaining_refreshes: self.refreshes,
            event_pattern: self.events.clone(),
            mode: self.mode,
        }
    }
}

impl Settings {
    /// Load from `path`, or from the default location when `None`. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reject values that would only fail later, inside the event loop.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be greater than zero");
        }
        if self.idle_timeout_secs == 0 || self.long_idle_timeout_secs == 0 {
            bail!("idle timeouts must be greater than zero");
        }
        self.timeout_policy()?;
        self.scheduler()?;
        Ok(())
    }

    /// CLI flag, then config file, then `$VMON_HOST`, then the device default.
    pub fn resolve_host(&self, cli_host: Option<&str>) -> String {
        resolve_host(
            cli_host,
            self.host.as_deref(),
            std::env::var(HOST_ENV).ok().as_deref(),
        )
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn timeout_policy(&self) -> Result<TimeoutPolicy, PatternError> {
        TimeoutPolicy::new(
            self.idle_timeout_secs,
            self.long_idle_timeout_secs,
            &self.long_running_patterns,
        )
    }

    pub fn widget_specs(&self) -> Vec<WidgetSpec> {
        self.widgets.iter().map(WidgetConfig::to_spec).collect()
    }

    /// Fresh scheduler with every configured widget registered.
    pub fn scheduler(&self) -> Result<WidgetScheduler, PatternError> {
        let mut scheduler = WidgetScheduler::new();
        for spec in self.widget_specs() {
            scheduler.register_widget(spec)?;
        }
        Ok(scheduler)
    }

    /// Regions named by widgets, in config order, without duplicates.
    pub fn widget_regions(&self) -> Vec<RegionId> {
        let mut regions: Vec<RegionId> = Vec::new();
        for w in &self.widgets {
            let id = RegionId::new(w.region.clone());
            if !regions.contains(&id) {
                regions.push(id);
            }
        }
        regions
    }
}

fn resolve_host(cli: Option<&str>, file: Option<&str>, env: Option<&str>) -> String {
    [cli, file, env]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|h| !h.is_empty())
        .unwrap_or(DEFAULT_HOST)
        .to_string()
}

/// `$XDG_CONFIG_HOME/vmon/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME")
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir).join("vmon/config.toml"));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/vmon/config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(text.as_bytes()).expect("write");
        file
    }

    #[test]
    fn empty_file_gives_defaults() {
        let file = write_config("");
        let settings = Settings::load(Some(file.path())).expect("load");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.tick_interval(), Duration::from_secs(1));
        assert_eq!(settings.inhibit_cycles, 5);
        assert_eq!(settings.monotonic_key, "m.monotonic");
    }

    #[test]
    fn widgets_from_file() {
        let file = write_config(
            r#"
host = "10.1.1.1"
idle_timeout_secs = 15

[[widget]]
region = "battery"
command = "metrics list v.b"
cadence_secs = 2
refreshes = 30
events = "^vehicle\\.charge\\."

[[widget]]
region = "log"
command = "log tail"
mode = "append"
"#,
        );
        let settings = Settings::load(Some(file.path())).expect("load");
        assert_eq!(settings.host.as_deref(), Some("10.1.1.1"));
        assert_eq!(settings.idle_timeout_secs, 15);
        assert_eq!(settings.long_idle_timeout_secs, 300);

        let specs = settings.widget_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].region.as_str(), "battery");
        assert_eq!(specs[0].cadence_secs, Some(2));
        assert_eq!(specs[0].remaining_refreshes, 30);
        assert_eq!(specs[0].event_pattern.as_deref(), Some("^vehicle\\.charge\\."));
        assert_eq!(specs[1].mode, OutputMode::Append);
        assert_eq!(specs[1].remaining_refreshes, 0);
        assert_eq!(settings.scheduler().expect("scheduler").len(), 2);
    }

    #[test]
    fn long_running_patterns_are_configurable() {
        let settings = Settings::parse(r#"long_running_patterns = ["^flash "]"#).expect("parse");
        let policy = settings.timeout_policy().expect("policy");
        assert_eq!(policy.idle_timeout("flash all"), Duration::from_secs(300));
        assert_eq!(policy.idle_timeout("ota flash vfs"), Duration::from_secs(20));
    }

    #[test]
    fn invalid_event_pattern_is_rejected() {
        let file = write_config("[[widget]]\nregion = \"x\"\nevents = \"(\"\n");
        let err = Settings::load(Some(file.path())).expect_err("bad regex");
        assert!(err.to_string().contains("invalid pattern"), "{err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Settings::parse("hots = \"typo\"").is_err());
    }

    #[test]
    fn zero_tick_is_rejected() {
        let settings = Settings::parse("tick_interval_ms = 0").expect("parse");
        assert!(settings.validate().is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(Settings::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn host_precedence() {
        assert_eq!(resolve_host(None, None, None), "192.168.4.1");
        assert_eq!(resolve_host(None, None, Some("env")), "env");
        assert_eq!(resolve_host(None, Some("file"), Some("env")), "file");
        assert_eq!(resolve_host(Some("cli"), Some("file"), Some("env")), "cli");
        assert_eq!(resolve_host(Some("  "), None, None), "192.168.4.1");
    }

    #[test]
    fn widget_regions_dedup_in_order() {
        let settings = Settings::parse(
            "[[widget]]\nregion = \"b\"\n[[widget]]\nregion = \"a\"\n[[widget]]\nregion = \"b\"\n",
        )
        .expect("parse");
        let regions: Vec<String> = settings
            .widget_regions()
            .into_iter()
            .map(|r| r.0)
            .collect();
        assert_eq!(regions, vec!["b", "a"]);
    }
}
