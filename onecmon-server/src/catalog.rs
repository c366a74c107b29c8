//! Seance catalog loaded from a TOML file.
//!
//! ```toml
//! [[seances]]
//! id = "6f1c2a4e-0d3b-4c55-9a57-2b0e7b1f9c11"
//! start_time = "2023-01-15T10:00:00Z"
//! finish_time = "2023-01-15T12:00:00Z"
//! agents = ["0b8e5f0c-31c1-4a6e-8d0a-5d7c7f3a2b10"]
//!
//! [[seances.templates]]
//! id = "a3d4c7e2-5b61-4f0e-b1c9-8e2f6d9a7c33"
//! content = '<log location="{LOG_PATH}" history="24"><event><eq property="name" value="EXCP"/></event><property name="all"/></log>'
//! ```
//!
//! Timestamps are RFC 3339 strings in UTC.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use onecmon_core::types::TechLogSeance;

use crate::error::ServerError;

/// Placeholder an agent substitutes with its seance folder.
pub const LOG_PATH_PLACEHOLDER: &str = "{LOG_PATH}";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CatalogFile {
    seances: Vec<CatalogSeance>,
}

/// One seance definition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CatalogSeance {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    /// Agents the seance is assigned to.
    #[serde(default)]
    pub agents: Vec<Uuid>,
    #[serde(default)]
    pub templates: Vec<CatalogTemplate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CatalogTemplate {
    pub id: Uuid,
    pub content: String,
}

impl CatalogSeance {
    /// The seance as an agent receives it: templates joined line by line, each with
    /// `{LOG_PATH}` narrowed to `{LOG_PATH}<templateId>`.
    pub fn to_dto(&self) -> TechLogSeance {
        let template = self
            .templates
            .iter()
            .map(|t| {
                t.content
                    .replace(LOG_PATH_PLACEHOLDER, &format!("{LOG_PATH_PLACEHOLDER}{}", t.id))
            })
            .collect::<Vec<_>>()
            .join("\n");
        TechLogSeance {
            id: self.id,
            start_time: self.start_time,
            finish_time: self.finish_time,
            template,
        }
    }
}

/// Seance definitions, reloadable in place.
pub struct SeanceCatalog {
    path: Option<PathBuf>,
    seances: RwLock<Vec<CatalogSeance>>,
    modified: Mutex<Option<SystemTime>>,
}

impl SeanceCatalog {
    /// A catalog with no seances and no backing file.
    pub fn empty() -> Self {
        Self {
            path: None,
            seances: RwLock::new(Vec::new()),
            modified: Mutex::new(None),
        }
    }

    /// Loads the catalog from `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref().to_path_buf();
        let modified = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .ok();
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ServerError::Catalog {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        let seances = Self::parse(&text).map_err(|reason| ServerError::Catalog {
            path: path.clone(),
            reason,
        })?;
        info!(path = %path.display(), seances = seances.len(), "seance catalog loaded");

        Ok(Self {
            path: Some(path),
            seances: RwLock::new(seances),
            modified: Mutex::new(modified),
        })
    }

    /// Parses and checks catalog text.
    ///
    /// Rejects duplicate seance ids and seances that finish before they start.
    pub fn parse(text: &str) -> Result<Vec<CatalogSeance>, String> {
        let file: CatalogFile = toml::from_str(text).map_err(|e| e.to_string())?;

        let mut ids = HashSet::new();
        for seance in &file.seances {
            if !ids.insert(seance.id) {
                return Err(format!("duplicate seance id {}", seance.id));
            }
            if seance.finish_time < seance.start_time {
                return Err(format!("seance {} finishes before it starts", seance.id));
            }
        }
        Ok(file.seances)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-reads the file if its modification time changed. Returns true on reload.
    ///
    /// A parse failure keeps the previous definitions.
    pub async fn reload_if_changed(&self) -> Result<bool, ServerError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let modified = tokio::fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| ServerError::Catalog {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if *lock(&self.modified) == Some(modified) {
            return Ok(false);
        }

        let text = tokio::fs::read_to_string(path).await?;
        let seances = Self::parse(&text).map_err(|reason| ServerError::Catalog {
            path: path.clone(),
            reason,
        })?;
        debug!(path = %path.display(), seances = seances.len(), "seance catalog reloaded");
        self.replace(seances);
        *lock(&self.modified) = Some(modified);
        Ok(true)
    }

    /// Replaces all definitions.
    pub fn replace(&self, seances: Vec<CatalogSeance>) {
        *self.seances.write().unwrap_or_else(|e| e.into_inner()) = seances;
    }

    /// Seances assigned to `agent_id`, in catalog order.
    pub fn seances_for(&self, agent_id: Uuid) -> Vec<TechLogSeance> {
        self.seances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.agents.contains(&agent_id))
            .map(CatalogSeance::to_dto)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seances.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
