//! Agent error type.
//!
//! [`AgentError`] converts into [`OnecmonError`] so orchestrator code can mix it with
//! core, transport and tech log errors through `?`.

use std::path::PathBuf;

use onecmon_core::error::{ConfigError, OnecmonError, PipelineError, StorageError};
use onecmon_protocol::TransportError;
use onecmon_techlog::TechLogError;

/// Errors raised by agent components.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A log file path does not follow `<root>/<seanceId>/<templateId>/<folder>/<file>.log`.
    #[error("unexpected tech log path {path}: {reason}")]
    UnexpectedPath { path: PathBuf, reason: String },

    /// Filesystem watcher could not be created or attached.
    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Reading or parsing a tech log file failed.
    #[error("tech log error: {0}")]
    TechLog(#[from] TechLogError),

    /// Server link failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A request to the server did not complete in time.
    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: &'static str,
        timeout_secs: u64,
    },

    /// Local state file (agent.json, seances.json) is unreadable or unwritable.
    #[error("state file {path}: {reason}")]
    State { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// True for server link failures that clear up once the connection is back.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(e) => matches!(
                e,
                TransportError::Disconnected
                    | TransportError::Io(_)
                    | TransportError::Resolve { .. }
                    | TransportError::ConnectTimeout { .. }
            ),
            _ => false,
        }
    }
}

impl From<AgentError> for OnecmonError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Io(e) => OnecmonError::Io(e),
            AgentError::Transport(e) => e.into(),
            AgentError::TechLog(e) => e.into(),
            AgentError::State { path, reason } => OnecmonError::Storage(StorageError::Query(
                format!("{}: {reason}", path.display()),
            )),
            AgentError::UnexpectedPath { path, reason } => {
                OnecmonError::Config(ConfigError::InvalidValue {
                    field: path.display().to_string(),
                    reason,
                })
            }
            other => OnecmonError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}
