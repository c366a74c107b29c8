//! CLI argument definitions for onecmon-agent.

use std::path::PathBuf;

use clap::Parser;

/// onecmon tech log agent.
///
/// Tails the tech log folder, ships raw events to the onecmon server and keeps
/// `logcfg.xml` in sync with the capture seances the server assigns to this agent.
#[derive(Parser, Debug)]
#[command(name = "onecmon-agent")]
#[command(version, about, long_about = None)]
pub struct AgentCli {
    /// Path to onecmon.toml configuration file.
    #[arg(short, long, default_value = "/etc/onecmon/onecmon.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the agent.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path (takes precedence over config file).
    #[arg(long)]
    pub pid_file: Option<String>,
}
