//! CLI argument definitions for onecmon-server.

use std::path::PathBuf;

use clap::Parser;

/// onecmon ingestion server.
///
/// Accepts agent connections, parses shipped tech log events into the configured
/// store and pushes capture seances to subscribed agents.
#[derive(Parser, Debug)]
#[command(name = "onecmon-server")]
#[command(version, about, long_about = None)]
pub struct ServerCli {
    /// Path to onecmon.toml configuration file.
    #[arg(short, long, default_value = "/etc/onecmon/onecmon.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the server.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path (takes precedence over config file).
    #[arg(long)]
    pub pid_file: Option<String>,
}
