//! `vmon metrics` — passive observer of the push channel.

use std::io::{self, Write};

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vmon_transport::{HttpCommandRunner, WsConnector};

use crate::cli::MetricsOpts;
use crate::client_loop::{ClientParts, Observation, drive, observers};
use crate::config::Settings;

/// Entry point for `vmon metrics`.
pub async fn cmd_metrics(
    settings: &Settings,
    host: &str,
    opts: &MetricsOpts,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    // Observe only: configured widgets stay idle.
    let settings = Settings {
        widgets: Vec::new(),
        ..settings.clone()
    };
    let obs = observers();
    let printer = print_observations(obs.subscribe(), opts, io::stdout());

    let (_commands_tx, mut commands) = mpsc::channel(1);
    let parts = ClientParts {
        settings: &settings,
        connector: WsConnector::for_host(host),
        runner: HttpCommandRunner::new(&format!("http://{host}"))?,
        regions: &[],
        observers: obs,
        force_prime: false,
    };

    tokio::select! {
        result = drive(parts, &mut commands, shutdown) => result,
        result = printer => result,
    }
}

async fn print_observations<W: Write>(
    mut rx: broadcast::Receiver<Observation>,
    opts: &MetricsOpts,
    mut out: W,
) -> anyhow::Result<()> {
    loop {
        match rx.recv().await {
            Ok(obs) => {
                if let Some(text) = format_observation(&obs, opts) {
                    writeln!(out, "{text}")?;
                    out.flush()?;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "metrics output fell behind, messages dropped");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

/// One or more output lines, or `None` when filtered out.
fn format_observation(obs: &Observation, opts: &MetricsOpts) -> Option<String> {
    match obs {
        Observation::Metrics(delta) => {
            let mut lines: Vec<String> = delta
                .iter()
                .filter(|(key, _)| {
                    opts.prefix
                        .as_deref()
                        .is_none_or(|prefix| key.starts_with(prefix))
                })
                .map(|(key, value)| format!("{key} = {}", display_value(value)))
                .collect();
            if lines.is_empty() {
                return None;
            }
            lines.sort();
            Some(lines.join("\n"))
        }
        Observation::Event(_) if opts.no_events => None,
        Observation::Event(event) if event.payload.is_empty() => {
            Some(format!("event {}", event.name))
        }
        Observation::Event(event) => Some(format!(
            "event {} {}",
            event.name,
            Value::Object(event.payload.clone())
        )),
        Observation::ConnectionClosed => Some("-- push channel closed, reconnecting".to_string()),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
