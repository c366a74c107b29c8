use anyhow::Result;
use clap::Parser;

use onecmon_agent::cli::AgentCli;
use onecmon_agent::logging::init_tracing;
use onecmon_agent::orchestrator::AgentOrchestrator;
use onecmon_core::config::OnecmonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AgentCli::parse();

    let mut config = OnecmonConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", cli.config.display(), e))?;

    // CLI flags win over env and file
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    if let Some(pid_file) = cli.pid_file {
        config.general.pid_file = pid_file;
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

    if cli.validate {
        println!("configuration OK: {}", cli.config.display());
        return Ok(());
    }

    init_tracing(&config.general)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "onecmon-agent starting");

    let mut orchestrator = AgentOrchestrator::build_from_config(config).await?;
    orchestrator.run().await?;

    tracing::info!("onecmon-agent shut down");
    Ok(())
}
