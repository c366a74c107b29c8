//! Server error type.

use std::path::PathBuf;

use onecmon_core::error::{ConfigError, OnecmonError};
use onecmon_protocol::TransportError;
use onecmon_techlog::TechLogError;

/// Errors raised by server components.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Session transport failure, including protocol violations.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Ingestion or storage failure.
    #[error("tech log error: {0}")]
    TechLog(#[from] TechLogError),

    /// The seance catalog file cannot be read or parsed.
    #[error("seance catalog {path}: {reason}")]
    Catalog { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// True when the peer broke the protocol and the session must be closed.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_protocol_violation())
    }
}

impl From<ServerError> for OnecmonError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Transport(e) => e.into(),
            ServerError::TechLog(e) => e.into(),
            ServerError::Catalog { path, reason } => OnecmonError::Config(ConfigError::ParseFailed {
                reason: format!("{}: {reason}", path.display()),
            }),
            ServerError::Io(e) => OnecmonError::Io(e),
        }
    }
}
