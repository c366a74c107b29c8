//! Command watcher: reacts to unsolicited messages pushed by the server.
//!
//! The only command today is `TechLogSeances`, a hint that the seance list for this
//! agent changed. The watcher fetches the authoritative list and reconciles
//! [`SeanceStore`] with it; [`crate::seances::SeanceScheduler`] picks up the result on
//! its next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onecmon_core::types::TechLogSeance;
use onecmon_protocol::{Connection, MessageType, TransportError};

use crate::error::AgentError;
use crate::seances::{ReconcileSummary, SeanceStore};

/// Upper bound on waiting for the seance list.
pub const SEANCES_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CommandsWatcher {
    connection: Connection,
    store: Arc<Mutex<SeanceStore>>,
}

impl CommandsWatcher {
    pub fn new(connection: Connection, store: Arc<Mutex<SeanceStore>>) -> Self {
        Self { connection, store }
    }

    /// Subscribes for commands and handles them until cancelled or the connection closes.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), AgentError> {
        self.connection.subscribe_for_commands().await?;
        info!("subscribed for commands");

        loop {
            let message = tokio::select! {
                result = self.connection.read_message() => result,
                _ = cancel.cancelled() => break,
            };

            let message = match message {
                Ok(message) => message,
                Err(TransportError::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read command");
                    continue;
                }
            };

            match message.message_type() {
                MessageType::TechLogSeances => {
                    if let Err(e) = self.refresh_seances().await {
                        warn!(error = %e, "failed to refresh tech log seances");
                    }
                }
                other => {
                    warn!(message_type = %other, "unexpected command ignored");
                }
            }
        }

        debug!("command watcher stopped");
        Ok(())
    }

    /// Fetches the seance list and applies it to the local state.
    pub async fn refresh_seances(&self) -> Result<ReconcileSummary, AgentError> {
        let response = tokio::time::timeout(
            SEANCES_REQUEST_TIMEOUT,
            self.connection.request(MessageType::TechLogSeancesRequest),
        )
        .await
        .map_err(|_| AgentError::Timeout {
            operation: "tech log seances request",
            timeout_secs: SEANCES_REQUEST_TIMEOUT.as_secs(),
        })??;
        let seances: Vec<TechLogSeance> = response.decode()?;

        let mut store = self.store.lock().await;
        let summary = store.reconcile(&seances);
        if !summary.is_empty() {
            store.save().await?;
            info!(
                added = summary.added,
                removed = summary.removed,
                updated = summary.updated,
                "tech log seances updated"
            );
        }
        Ok(summary)
    }
}
