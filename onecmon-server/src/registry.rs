//! Live agent sessions and command subscriptions.
//!
//! Sessions are keyed by a per-connection id; subscriptions map an agent id to the
//! connection that subscribed last. Both are removed when the session ends.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use onecmon_core::metrics as m;
use onecmon_core::types::AgentInstance;
use onecmon_protocol::{Connection, MessageType};

use crate::catalog::SeanceCatalog;
use crate::error::ServerError;

struct Session {
    agent: Arc<AgentInstance>,
    connection: Connection,
}

/// Registry of connected agents.
pub struct ConnectionRegistry {
    catalog: Arc<SeanceCatalog>,
    sessions: DashMap<Uuid, Session>,
    subscribers: DashMap<Uuid, Uuid>,
}

impl ConnectionRegistry {
    pub fn new(catalog: Arc<SeanceCatalog>) -> Self {
        Self {
            catalog,
            sessions: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    pub fn catalog(&self) -> &Arc<SeanceCatalog> {
        &self.catalog
    }

    /// Records an identified session.
    pub fn register(&self, conn_id: Uuid, agent: Arc<AgentInstance>, connection: Connection) {
        debug!(conn_id = %conn_id, agent_id = %agent.id, "session registered");
        self.sessions.insert(conn_id, Session { agent, connection });
        self.update_gauge();
    }

    /// Marks the agent of `conn_id` as subscribed for commands.
    pub fn subscribe(&self, conn_id: Uuid) -> Option<Uuid> {
        let agent_id = self.sessions.get(&conn_id)?.agent.id;
        self.subscribers.insert(agent_id, conn_id);
        Some(agent_id)
    }

    /// Drops the session and any subscription it owns.
    pub fn unregister(&self, conn_id: Uuid) {
        if let Some((_, session)) = self.sessions.remove(&conn_id) {
            self.subscribers
                .remove_if(&session.agent.id, |_, owner| *owner == conn_id);
            debug!(conn_id = %conn_id, agent_id = %session.agent.id, "session unregistered");
        }
        self.update_gauge();
    }

    /// Number of live sessions.
    pub fn connected_agents(&self) -> usize {
        self.sessions.len()
    }

    pub fn subscribed_agents(&self) -> Vec<Uuid> {
        self.subscribers.iter().map(|e| *e.key()).collect()
    }

    pub fn is_subscribed(&self, agent_id: Uuid) -> bool {
        self.subscribers.contains_key(&agent_id)
    }

    /// Pushes the agent's current seance list. Returns false if it is not subscribed.
    pub async fn push_seances(&self, agent_id: Uuid) -> Result<bool, ServerError> {
        // Clone the handle so no map guard is held across the send.
        let connection = {
            let Some(conn_id) = self.subscribers.get(&agent_id).map(|e| *e.value()) else {
                return Ok(false);
            };
            match self.sessions.get(&conn_id) {
                Some(session) => session.connection.clone(),
                None => return Ok(false),
            }
        };
        let seances = self.catalog.seances_for(agent_id);
        connection
            .push(MessageType::TechLogSeances, &seances)
            .await?;
        debug!(agent_id = %agent_id, seances = seances.len(), "seances pushed");
        Ok(true)
    }

    /// Pushes seances to every subscribed agent. Failures are logged per agent.
    pub async fn push_seances_to_all(&self) -> usize {
        let mut pushed = 0;
        for agent_id in self.subscribed_agents() {
            match self.push_seances(agent_id).await {
                Ok(true) => pushed += 1,
                Ok(false) => {}
                Err(e) => warn!(agent_id = %agent_id, error = %e, "failed to push seances"),
            }
        }
        pushed
    }

    fn update_gauge(&self) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(m::SERVER_CONNECTED_AGENTS).set(self.sessions.len() as f64);
    }
}
