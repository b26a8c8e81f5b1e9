//! Error types for the device transports.

use std::time::Duration;

use thiserror::Error;
use vmon_core::RegionId;

/// Push channel failures. Always recovered locally by the reconnect cycle.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("push channel unavailable: {0}")]
    Unavailable(String),
}

/// Command run failures. Shown inline in the run's region.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("device answered HTTP {status}")]
    Status { status: u16, body: String },

    #[error("no output for {}s, command aborted", .idle.as_secs())]
    Timeout { idle: Duration },

    #[error("command cancelled")]
    Cancelled,

    #[error("region {0} already has a command running")]
    RegionBusy(RegionId),

    #[error("response stream failed: {0}")]
    Stream(String),

    #[error("run task failed: {0}")]
    Task(String),
}

impl CommandError {
    /// Stall as opposed to the device rejecting or the network failing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Text shown in the region: the device's own response body when it sent
    /// one, the error description otherwise.
    pub fn display_text(&self) -> String {
        match self {
            Self::Status { body, .. } if !body.trim().is_empty() => body.clone(),
            other => format!("Error: {other}"),
        }
    }
}
