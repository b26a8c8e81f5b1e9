//! vmon: live telemetry monitor and remote console for a vehicle module.
//! One single-threaded event loop per client; see `client_loop`.

use clap::Parser;
use tokio_util::sync::CancellationToken;

mod cli;
mod client_loop;
mod cmd_console;
mod cmd_exec;
mod cmd_metrics;
mod cmd_monitor;
mod config;
#[cfg(test)]
mod fakes;
mod regions;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // Logs go to stderr; stdout carries device output.
    let filter = std::env::var("VMON_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let settings = config::Settings::load(args.config.as_deref())?;
    let host = settings.resolve_host(args.host.as_deref());
    tracing::debug!(%host, "device host resolved");

    match args.command {
        cli::Command::Monitor(opts) => {
            cmd_monitor::cmd_monitor(&settings, &host, &opts, shutdown_signal()).await?;
        }
        cli::Command::Exec(opts) => {
            let exit_code = cmd_exec::cmd_exec(&settings, &host, &opts).await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
        cli::Command::Console(opts) => {
            cmd_console::cmd_console(&settings, &host, &opts).await?;
        }
        cli::Command::Metrics(opts) => {
            cmd_metrics::cmd_metrics(&settings, &host, &opts, shutdown_signal()).await?;
        }
    }

    Ok(())
}

/// Token cancelled on ctrl-c or SIGTERM.
fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => tokio::select! {
                    _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                },
                Err(e) => {
                    tracing::warn!("SIGTERM handler unavailable: {e}");
                    ctrl_c.await.ok();
                    tracing::info!("received ctrl-c, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            tracing::info!("received ctrl-c, shutting down");
        }

        trigger.cancel();
    });
    token
}
