//! `vmon monitor` — live dashboard of the configured widgets.

use std::time::Duration;

use anyhow::bail;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vmon_transport::{HttpCommandRunner, WsConnector};

use crate::cli::MonitorOpts;
use crate::client_loop::{ClientParts, drive, observers};
use crate::config::Settings;
use crate::regions::Screen;

const MIN_REDRAW: Duration = Duration::from_millis(50);

/// Entry point for `vmon monitor`.
pub async fn cmd_monitor(
    settings: &Settings,
    host: &str,
    opts: &MonitorOpts,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if settings.widgets.is_empty() {
        bail!("no [[widget]] tables configured, nothing to monitor");
    }

    let screen = Screen::new(settings.widget_regions());
    let regions = screen.shared_regions();
    // The dashboard never issues user commands; keep the channel open.
    let (_commands_tx, mut commands) = mpsc::channel(1);
    let parts = ClientParts {
        settings,
        connector: WsConnector::for_host(host),
        runner: HttpCommandRunner::new(&format!("http://{host}"))?,
        regions: &regions,
        observers: observers(),
        force_prime: opts.force_prime,
    };
    let redraw = Duration::from_millis(opts.redraw_ms).max(MIN_REDRAW);

    tracing::info!(host, widgets = settings.widgets.len(), "monitor starting");
    tokio::select! {
        result = drive(parts, &mut commands, shutdown) => result,
        () = screen.run(redraw) => Ok(()),
    }
}
