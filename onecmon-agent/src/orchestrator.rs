//! Agent assembly and lifecycle management.
//!
//! The [`AgentOrchestrator`] loads the identity, opens the server connection, starts the
//! folder watcher and runs the long-lived tasks until a shutdown signal arrives.
//!
//! # Tasks
//!
//! 1. Transport supervisor (connects, reconnects, re-subscribes)
//! 2. Exporter (consumes the dispatch channel, one tail task per file)
//! 3. Startup scan (feeds existing files into the dispatch channel, then exits)
//! 4. Command watcher (seance list updates pushed by the server)
//! 5. Seance scheduler (`logcfg.xml`)
//!
//! All tasks share one root [`CancellationToken`]; shutdown cancels it and awaits them.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use onecmon_core::config::OnecmonConfig;
use onecmon_core::types::AgentInstance;
use onecmon_protocol::{Connection, ConnectionConfig};

use crate::commands::CommandsWatcher;
use crate::exporter::{Exporter, dispatch_existing};
use crate::identity::IdentityStore;
use crate::position_cache::PositionCache;
use crate::seances::{SeanceScheduler, SeanceStore};
use crate::watcher::FolderWatcher;

/// The agent orchestrator.
pub struct AgentOrchestrator {
    config: OnecmonConfig,
    identity: AgentInstance,
    connection: Connection,
    transport: Option<JoinHandle<()>>,
    watcher: FolderWatcher,
    paths_rx: Option<mpsc::Receiver<PathBuf>>,
    cache: Arc<PositionCache>,
    store: Arc<Mutex<SeanceStore>>,
    cancel: CancellationToken,
}

impl AgentOrchestrator {
    /// Load configuration from `config_path` and build the orchestrator.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = OnecmonConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration.
    ///
    /// The transport starts connecting in the background right away; an unreachable
    /// server is not a startup error.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, the identity or seance state cannot be
    /// loaded, or the log folder cannot be watched.
    pub async fn build_from_config(config: OnecmonConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        let data_dir = Path::new(&config.general.data_dir);
        let identity = IdentityStore::load_or_create(data_dir, &config.agent.instance_name)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load agent identity: {}", e))?;
        tracing::info!(
            agent_id = %identity.id,
            instance_name = %identity.instance_name,
            utc_offset = identity.utc_offset,
            "agent identity loaded"
        );

        let store = SeanceStore::load(data_dir)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load seance state: {}", e))?;

        let (watcher, paths_rx) = FolderWatcher::start(
            &config.agent.log_folder,
            config.agent.watch_channel_capacity,
        )
        .map_err(|e| anyhow::anyhow!("failed to watch log folder: {}", e))?;

        let cancel = CancellationToken::new();
        let (connection, transport) = Connection::connect(
            config.agent.server_host.clone(),
            config.agent.server_port,
            identity.clone(),
            ConnectionConfig {
                queue_capacity: config.agent.queue_capacity,
                connect_timeout: Duration::from_secs(config.agent.connect_timeout_secs),
                reconnect_delay: Duration::from_millis(config.agent.reconnect_delay_ms),
            },
            cancel.clone(),
        );

        let cache = Arc::new(PositionCache::new(Duration::from_secs(
            config.agent.position_cache_ttl_secs,
        )));

        Ok(Self {
            config,
            identity,
            connection,
            transport: Some(transport),
            watcher,
            paths_rx: Some(paths_rx),
            cache,
            store: Arc::new(Mutex::new(store)),
            cancel,
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

    /// Run all agent tasks until `shutdown` completes.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let pid_file = (!self.config.general.pid_file.is_empty())
            .then(|| PathBuf::from(&self.config.general.pid_file));
        if let Some(path) = &pid_file {
            write_pid_file(path)?;
        }

        let paths_rx = self
            .paths_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent already ran"))?;

        let exporter = Exporter::new(
            self.watcher.root(),
            Arc::new(self.connection.clone()),
            Arc::clone(&self.cache),
            self.cancel.clone(),
        )
        .with_retry_delay(Duration::from_millis(self.config.agent.reconnect_delay_ms));
        let exporter_task = tokio::spawn(exporter.run(paths_rx));

        let root = self.watcher.root().to_path_buf();
        let scan_tx = self.watcher.sender();
        let scan_task = tokio::spawn(async move {
            if let Err(e) = dispatch_existing(&root, &scan_tx).await {
                tracing::error!(error = %e, "startup scan failed");
            }
        });

        let commands = CommandsWatcher::new(self.connection.clone(), Arc::clone(&self.store));
        let commands_cancel = self.cancel.clone();
        let commands_task = tokio::spawn(async move {
            if let Err(e) = commands.run(commands_cancel).await {
                tracing::error!(error = %e, "command watcher failed");
            }
        });

        let scheduler = SeanceScheduler::new(
            Arc::clone(&self.store),
            &self.config.agent.log_folder,
            &self.config.agent.logcfg_path,
            Duration::from_millis(self.config.agent.seance_poll_interval_ms),
        );
        let scheduler_task = tokio::spawn(scheduler.run(self.cancel.clone()));

        tracing::info!(
            agent_id = %self.identity.id,
            server = %format!("{}:{}", self.config.agent.server_host, self.config.agent.server_port),
            "agent running"
        );
        shutdown.await;

        tracing::info!("stopping agent tasks");
        self.cancel.cancel();

        for (name, task) in [
            ("startup scan", scan_task),
            ("exporter", exporter_task),
            ("command watcher", commands_task),
            ("seance scheduler", scheduler_task),
        ] {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "task panicked");
            }
        }
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.await {
                tracing::error!(error = %e, "transport task panicked");
            }
        }

        if let Some(path) = &pid_file {
            remove_pid_file(path);
        }
        tracing::info!("agent stopped");
        Ok(())
    }

    pub fn identity(&self) -> &AgentInstance {
        &self.identity
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn config(&self) -> &OnecmonConfig {
        &self.config
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
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
/// Fails if the file already exists, so a second agent on the same data cannot start.
/// The parent directory is created with mode 0o700 and the file with 0o600.
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
                "PID file {} already exists with PID: {}. Is another agent running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{}", pid)?;

    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on shutdown. Failure is only logged.
fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}
