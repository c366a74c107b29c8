//! Agent identity persistence.
//!
//! The identity is created once per installation and stored as `agent.json` in the data
//! directory. The id never changes; the instance name follows the configuration and the
//! UTC offset is taken from the local clock on every start.

use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use onecmon_core::types::AgentInstance;

use crate::error::AgentError;

/// File name of the persisted identity.
pub const IDENTITY_FILE: &str = "agent.json";

const FALLBACK_INSTANCE_NAME: &str = "onecmon-agent";

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    id: Uuid,
    instance_name: String,
}

/// Loads and persists the agent identity.
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(IDENTITY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored identity, creating it on first start.
    ///
    /// An empty `instance_name` falls back to the host name. When the stored name
    /// differs from the wanted one it is corrected and written back.
    pub async fn load_or_create(
        data_dir: impl AsRef<Path>,
        instance_name: &str,
    ) -> Result<AgentInstance, AgentError> {
        let store = Self::new(data_dir);
        let wanted = if instance_name.is_empty() {
            host_name()
        } else {
            instance_name.to_owned()
        };

        let stored = match store.read().await? {
            Some(mut stored) => {
                if stored.instance_name != wanted {
                    info!(
                        agent_id = %stored.id,
                        old = %stored.instance_name,
                        new = %wanted,
                        "instance name corrected"
                    );
                    stored.instance_name = wanted;
                    store.write(&stored).await?;
                }
                stored
            }
            None => {
                let stored = StoredIdentity {
                    id: Uuid::new_v4(),
                    instance_name: wanted,
                };
                store.write(&stored).await?;
                info!(agent_id = %stored.id, path = %store.path.display(), "agent identity created");
                stored
            }
        };

        Ok(AgentInstance {
            id: stored.id,
            instance_name: stored.instance_name,
            utc_offset: local_utc_offset_secs(),
        })
    }

    async fn read(&self) -> Result<Option<StoredIdentity>, AgentError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| AgentError::State {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    async fn write(&self, identity: &StoredIdentity) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(identity).map_err(|e| AgentError::State {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

/// Offset of the local clock from UTC in seconds (east positive).
pub fn local_utc_offset_secs() -> f64 {
    f64::from(Local::now().offset().local_minus_utc())
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_INSTANCE_NAME.to_owned())
}
