//! Server assembly and lifecycle management.
//!
//! # Startup Order
//!
//! 1. Metrics recorder (if enabled)
//! 2. Storage backend and schema
//! 3. Seance catalog and connection registry
//! 4. Ingestion pipeline
//! 5. Agent listener
//!
//! # Shutdown Order
//!
//! 1. Listener stops accepting; open sessions end and stop submitting
//! 2. Background tasks (catalog reload, uptime)
//! 3. Ingestion pipeline drains intake, flushes the last batch and stops

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use onecmon_core::config::OnecmonConfig;
use onecmon_core::pipeline::Pipeline;
use onecmon_techlog::{IngestionPipeline, IngestionPipelineBuilder, StorageBackend, TechLogStorage};

use crate::catalog::SeanceCatalog;
use crate::health::{ModuleHealth, ServerHealth, aggregate_status};
use crate::listener::AgentListener;
use crate::metrics_server;
use crate::registry::ConnectionRegistry;
use crate::session::SessionContext;

/// Interval of the periodic health log line.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// The server orchestrator.
pub struct ServerOrchestrator {
    config: OnecmonConfig,
    pipeline: IngestionPipeline<StorageBackend>,
    ctx: SessionContext<StorageBackend>,
    listener: Option<AgentListener>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    start_time: Instant,
}

impl ServerOrchestrator {
    /// Load configuration from `config_path` and build the orchestrator.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = OnecmonConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - configuration validation fails
    /// - the storage backend cannot be created or its schema initialized
    /// - the seance catalog cannot be loaded
    /// - the listen address cannot be bound
    pub async fn build_from_config(config: OnecmonConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let storage = Arc::new(
            StorageBackend::from_config(&config.storage)
                .map_err(|e| anyhow::anyhow!("failed to create storage backend: {}", e))?,
        );
        storage
            .init_schema()
            .await
            .map_err(|e| anyhow::anyhow!("failed to initialize storage schema: {}", e))?;
        tracing::info!(backend = storage.name(), "storage ready");

        let catalog = if config.server.seances_path.is_empty() {
            tracing::info!("no seance catalog configured");
            SeanceCatalog::empty()
        } else {
            SeanceCatalog::load(&config.server.seances_path)
                .await
                .map_err(|e| anyhow::anyhow!("failed to load seance catalog: {}", e))?
        };
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(catalog)));

        let (pipeline, ingest) = IngestionPipelineBuilder::new(Arc::clone(&storage))
            .config(config.pipeline.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build ingestion pipeline: {}", e))?;

        let listener = AgentListener::bind(&config.server.bind_addr, config.server.max_connections)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", config.server.bind_addr, e))?;
        let local_addr = listener.local_addr()?;

        let ctx = SessionContext {
            registry,
            ingest,
            storage,
            queue_capacity: config.server.queue_capacity,
        };

        Ok(Self {
            config,
            pipeline,
            ctx,
            listener: Some(listener),
            local_addr,
            cancel: CancellationToken::new(),
            start_time: Instant::now(),
        })
    }

    /// Run until SIGTERM or SIGINT.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            match wait_for_shutdown_signal().await {
                Ok(signal) => tracing::info!(signal = signal, "shutdown signal received"),
                Err(e) => tracing::error!(error = %e, "signal handling failed, shutting down"),
            }
        })
        .await
    }

    /// Serve agents until `shutdown` completes.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let pid_file = (!self.config.general.pid_file.is_empty())
            .then(|| PathBuf::from(&self.config.general.pid_file));
        if let Some(path) = &pid_file {
            write_pid_file(path)?;
        }

        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("server already ran"))?;

        if let Err(e) = self.pipeline.start().await {
            if let Some(path) = &pid_file {
                remove_pid_file(path);
            }
            return Err(anyhow::anyhow!("failed to start ingestion pipeline: {}", e));
        }

        let listener_task = tokio::spawn(listener.run(self.ctx.clone(), self.cancel.clone()));
        let reload_task = self.spawn_catalog_reload();
        let uptime_task = self
            .config
            .metrics
            .enabled
            .then(|| spawn_uptime_updater(self.start_time, self.cancel.clone()));

        tracing::info!(addr = %self.local_addr, "onecmon-server running");

        tokio::pin!(shutdown);
        let mut health_tick = tokio::time::interval(HEALTH_LOG_INTERVAL);
        health_tick.tick().await;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = health_tick.tick() => {
                    let health = self.health().await;
                    tracing::info!(
                        status = %health.status,
                        uptime_secs = health.uptime_secs,
                        connected_agents = health.connected_agents,
                        "health"
                    );
                }
            }
        }

        tracing::info!("stopping server");
        self.cancel.cancel();
        let tasks = [
            ("listener", Some(listener_task)),
            ("catalog reload", reload_task),
            ("uptime", uptime_task),
        ];
        for (name, task) in tasks {
            let Some(task) = task else { continue };
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "task panicked");
            }
        }

        let stopped = self.pipeline.stop().await;

        if let Some(path) = &pid_file {
            remove_pid_file(path);
        }
        stopped.map_err(|e| anyhow::anyhow!("failed to stop ingestion pipeline: {}", e))?;

        tracing::info!(
            events_written = self.pipeline.stats().events_written(),
            "server stopped"
        );
        Ok(())
    }

    fn spawn_catalog_reload(&self) -> Option<JoinHandle<()>> {
        let registry = Arc::clone(&self.ctx.registry);
        registry.catalog().path()?;
        let interval = Duration::from_secs(self.config.server.seances_reload_secs.max(1));
        let cancel = self.cancel.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match registry.catalog().reload_if_changed().await {
                            Ok(true) => {
                                let pushed = registry.push_seances_to_all().await;
                                tracing::info!(
                                    seances = registry.catalog().len(),
                                    agents = pushed,
                                    "seance catalog changed"
                                );
                            }
                            Ok(false) => {}
                            Err(e) => tracing::warn!(error = %e, "failed to reload seance catalog"),
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }))
    }

    /// Current aggregated health.
    pub async fn health(&self) -> ServerHealth {
        let modules = vec![ModuleHealth {
            name: "ingestion-pipeline".to_owned(),
            enabled: true,
            status: self.pipeline.health_check().await,
        }];
        ServerHealth {
            status: aggregate_status(&modules),
            uptime_secs: self.start_time.elapsed().as_secs(),
            connected_agents: self.ctx.registry.connected_agents(),
            modules,
        }
    }

    /// Address the agent listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    pub fn storage(&self) -> Arc<StorageBackend> {
        Arc::clone(&self.ctx.storage)
    }

    pub fn config(&self) -> &OnecmonConfig {
        &self.config
    }
}

/// Keep the uptime gauge current.
fn spawn_uptime_updater(start_time: Instant, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(onecmon_core::metrics::SERVER_UPTIME_SECONDS)
                        .set(start_time.elapsed().as_secs() as f64);
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Write the current process PID to a file.
///
/// # Security
///
/// - `create_new(true)` creates the file atomically
/// - the created file must be a regular file
/// - parent directory mode 0o700, file mode 0o600
fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700).recursive(true);
            builder.create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing_pid = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    if !file.metadata()?.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file (possible symlink attack)",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{}", pid)?;

    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on shutdown. Logs a warning on failure.
fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn pid_file_contains_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("nested").join("server.pid");

        write_pid_file(&pid_file).unwrap();

        let parsed: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert_eq!(parsed, std::process::id());
    }

    #[test]
    fn existing_pid_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("server.pid");
        fs::write(&pid_file, "777").unwrap();

        let err = write_pid_file(&pid_file).unwrap_err().to_string();
        assert!(err.contains("already exists"));
        assert!(err.contains("777"));
    }

    #[test]
    fn removing_missing_pid_file_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        remove_pid_file(&dir.path().join("absent.pid"));
    }
}
