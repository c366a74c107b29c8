use anyhow::Result;
use clap::Parser;

use onecmon_core::config::OnecmonConfig;
use onecmon_server::cli::ServerCli;
use onecmon_server::logging::init_tracing;
use onecmon_server::orchestrator::ServerOrchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ServerCli::parse();

    let mut config = OnecmonConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config {}: {}", cli.config.display(), e))?;

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
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_addr = %config.server.bind_addr,
        storage = %config.storage.backend,
        "onecmon-server starting"
    );

    let mut orchestrator = ServerOrchestrator::build_from_config(config).await?;
    orchestrator.run().await?;

    tracing::info!("onecmon-server shut down");
    Ok(())
}
