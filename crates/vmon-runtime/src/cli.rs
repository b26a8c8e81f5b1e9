//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vmon", about = "Live telemetry monitor and remote console for a vehicle module")]
pub struct Cli {
    /// Device host or host:port (default: config file, then $VMON_HOST, then 192.168.4.1)
    #[arg(long, short = 'H', global = true)]
    pub host: Option<String>,

    /// Config file (default: $XDG_CONFIG_HOME/vmon/config.toml)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Live dashboard of the configured monitor widgets
    Monitor(MonitorOpts),
    /// Run one command on the device and stream its output
    Exec(ExecOpts),
    /// Interactive shell on the device
    Console(ConsoleOpts),
    /// Print every metric delta and event pushed by the device
    Metrics(MetricsOpts),
}

#[derive(clap::Args, Default)]
pub struct MonitorOpts {
    /// Refresh every widget at startup, not only empty ones
    #[arg(long)]
    pub force_prime: bool,

    /// Screen redraw interval in milliseconds
    #[arg(long, default_value = "500")]
    pub redraw_ms: u64,
}

#[derive(clap::Args)]
pub struct ExecOpts {
    /// Idle timeout in seconds (default: from config, by command pattern)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Command line to run, e.g. `metrics list v.b`
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

impl ExecOpts {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

#[derive(clap::Args, Default)]
pub struct ConsoleOpts {
    /// Maximum number of history entries kept
    #[arg(long, default_value = "200")]
    pub history: usize,
}

#[derive(clap::Args, Default)]
pub struct MetricsOpts {
    /// Only print metrics whose key starts with this prefix
    #[arg(long)]
    pub prefix: Option<String>,

    /// Do not print named events
    #[arg(long)]
    pub no_events: bool,
}
