//! Local capture seance state and the `logcfg.xml` scheduler.
//!
//! The command watcher reconciles [`SeanceStore`] with the list the server assigns to
//! this agent. [`SeanceScheduler`] advances seance status against UTC time once per
//! poll interval and rewrites `logcfg.xml` so the platform captures exactly the started
//! seances.
//!
//! ```text
//! Scheduled --start_time<=now--> Started --finish_time<=now--> Finished
//!     \___________________ removed by server ______________________> Deleted -> dropped
//! ```

use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use onecmon_core::types::TechLogSeance;

use crate::error::AgentError;

/// File name of the persisted seance state.
pub const SEANCES_FILE: &str = "seances.json";

/// Placeholder substituted with the seance capture folder.
pub const LOG_PATH_PLACEHOLDER: &str = "{LOG_PATH}";

const LOGCFG_HEADER: &str = "<config xmlns=\"http://v8.1c.ru/v8/tech-log\">";
const LOGCFG_FOOTER: &str = "</config>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeanceStatus {
    Scheduled,
    Started,
    Finished,
    Deleted,
}

/// A seance as the agent tracks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSeance {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub template: String,
    pub status: SeanceStatus,
}

impl From<&TechLogSeance> for LocalSeance {
    fn from(seance: &TechLogSeance) -> Self {
        Self {
            id: seance.id,
            start_time: seance.start_time,
            finish_time: seance.finish_time,
            template: seance.template.clone(),
            status: SeanceStatus::Scheduled,
        }
    }
}

/// Outcome of [`SeanceStore::reconcile`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.updated == 0
    }
}

/// Status changes applied by one [`SeanceStore::advance`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transitions {
    pub started: usize,
    pub finished: usize,
}

/// Seance state persisted as `seances.json`.
pub struct SeanceStore {
    path: PathBuf,
    seances: Vec<LocalSeance>,
}

impl SeanceStore {
    /// Loads the state from `data_dir`, starting empty if the file does not exist.
    pub async fn load(data_dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = data_dir.as_ref().join(SEANCES_FILE);
        let seances = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|e| AgentError::State {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, seances })
    }

    /// An empty store that persists to `data_dir`.
    pub fn empty(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(SEANCES_FILE),
            seances: Vec::new(),
        }
    }

    pub async fn save(&self) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&self.seances).map_err(|e| AgentError::State {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    pub fn seances(&self) -> &[LocalSeance] {
        &self.seances
    }

    pub fn get(&self, id: Uuid) -> Option<&LocalSeance> {
        self.seances.iter().find(|s| s.id == id)
    }

    /// Applies the authoritative list from the server.
    ///
    /// New seances are added as scheduled, seances missing from the list are marked
    /// deleted, and changed templates are replaced in place.
    pub fn reconcile(&mut self, remote: &[TechLogSeance]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for local in &mut self.seances {
            match remote.iter().find(|r| r.id == local.id) {
                None if local.status != SeanceStatus::Deleted => {
                    local.status = SeanceStatus::Deleted;
                    summary.removed += 1;
                }
                Some(r) if r.template != local.template => {
                    local.template = r.template.clone();
                    summary.updated += 1;
                }
                _ => {}
            }
        }

        for r in remote {
            if self.get(r.id).is_none() {
                self.seances.push(LocalSeance::from(r));
                summary.added += 1;
            }
        }

        summary
    }

    /// Moves seances along their lifecycle at `now`.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Transitions {
        let mut transitions = Transitions::default();
        for seance in &mut self.seances {
            if seance.status == SeanceStatus::Scheduled && seance.start_time <= now {
                seance.status = SeanceStatus::Started;
                transitions.started += 1;
            }
            if seance.status == SeanceStatus::Started && seance.finish_time <= now {
                seance.status = SeanceStatus::Finished;
                transitions.finished += 1;
            }
        }
        transitions
    }

    /// Ids of seances marked deleted.
    pub fn deleted(&self) -> Vec<Uuid> {
        self.seances
            .iter()
            .filter(|s| s.status == SeanceStatus::Deleted)
            .map(|s| s.id)
            .collect()
    }

    /// Drops a seance from the state.
    pub fn remove(&mut self, id: Uuid) {
        self.seances.retain(|s| s.id != id);
    }

    pub fn started(&self) -> impl Iterator<Item = &LocalSeance> {
        self.seances
            .iter()
            .filter(|s| s.status == SeanceStatus::Started)
    }
}

/// Seance capture folder: `<log_folder>/<seanceId>/`.
pub fn seance_folder(log_folder: &Path, id: Uuid) -> PathBuf {
    log_folder.join(id.to_string())
}

/// Builds `logcfg.xml` for the started seances, or `None` if nothing is started.
pub fn render_logcfg<'a>(
    started: impl IntoIterator<Item = &'a LocalSeance>,
    log_folder: &Path,
) -> Option<String> {
    let mut body = String::new();
    for seance in started {
        let location = format!(
            "{}{MAIN_SEPARATOR}",
            seance_folder(log_folder, seance.id).display()
        );
        body.push_str(&seance.template.replace(LOG_PATH_PLACEHOLDER, &location));
        body.push('\n');
    }
    if body.is_empty() {
        return None;
    }
    Some(format!("{LOGCFG_HEADER}\n{body}{LOGCFG_FOOTER}\n"))
}

/// Periodic driver of seance status and `logcfg.xml`.
pub struct SeanceScheduler {
    store: Arc<Mutex<SeanceStore>>,
    log_folder: PathBuf,
    logcfg_path: PathBuf,
    interval: Duration,
}

impl SeanceScheduler {
    pub fn new(
        store: Arc<Mutex<SeanceStore>>,
        log_folder: impl Into<PathBuf>,
        logcfg_path: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            log_folder: log_folder.into(),
            logcfg_path: logcfg_path.into(),
            interval,
        }
    }

    /// Ticks until cancelled. Failures are logged and retried on the next tick.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(error = %e, "failed to apply tech log seances");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("seance scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One scheduling step at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), AgentError> {
        let mut store = self.store.lock().await;

        let transitions = store.advance(now);
        if transitions.started > 0 || transitions.finished > 0 {
            info!(
                started = transitions.started,
                finished = transitions.finished,
                "seance status changed"
            );
        }

        let mut dropped = 0;
        for id in store.deleted() {
            let folder = seance_folder(&self.log_folder, id);
            match tokio::fs::remove_dir_all(&folder).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(folder = %folder.display(), error = %e, "failed to remove seance folder");
                    continue;
                }
            }
            store.remove(id);
            dropped += 1;
        }
        if dropped > 0 {
            info!(count = dropped, "deleted seances dropped");
        }

        if transitions.started > 0 || transitions.finished > 0 || dropped > 0 {
            store.save().await?;
        }

        let content = render_logcfg(store.started(), &self.log_folder);
        drop(store);
        self.apply_logcfg(content.as_deref()).await
    }

    /// Writes or removes `logcfg.xml`, touching the file only when it would change.
    async fn apply_logcfg(&self, content: Option<&str>) -> Result<(), AgentError> {
        let current = match tokio::fs::read_to_string(&self.logcfg_path).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if current.as_deref() == content {
            trace!("logcfg.xml unchanged");
            return Ok(());
        }

        match content {
            Some(text) => {
                if let Some(parent) = self.logcfg_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&self.logcfg_path, text).await?;
                info!(path = %self.logcfg_path.display(), "logcfg.xml written");
            }
            None => {
                tokio::fs::remove_file(&self.logcfg_path).await?;
                info!(path = %self.logcfg_path.display(), "logcfg.xml removed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 15, hour, 0, 0).unwrap()
    }

    fn remote(id: Uuid, template: &str) -> TechLogSeance {
        TechLogSeance {
            id,
            start_time: at(10),
            finish_time: at(12),
            template: template.to_owned(),
        }
    }

    #[test]
    fn reconcile_adds_removes_and_updates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SeanceStore::empty(dir.path());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let summary = store.reconcile(&[remote(a, "A"), remote(b, "B")]);
        assert_eq!(
            summary,
            ReconcileSummary {
                added: 2,
                removed: 0,
                updated: 0
            }
        );

        let summary = store.reconcile(&[remote(b, "B2"), remote(c, "C")]);
        assert_eq!(
            summary,
            ReconcileSummary {
                added: 1,
                removed: 1,
                updated: 1
            }
        );
        assert_eq!(store.get(a).unwrap().status, SeanceStatus::Deleted);
        assert_eq!(store.get(b).unwrap().template, "B2");
        assert_eq!(store.get(c).unwrap().status, SeanceStatus::Scheduled);

        assert!(store.reconcile(&[remote(b, "B2"), remote(c, "C")]).is_empty());
    }

    #[test]
    fn advance_follows_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SeanceStore::empty(dir.path());
        let id = Uuid::new_v4();
        store.reconcile(&[remote(id, "T")]);

        assert_eq!(store.advance(at(9)), Transitions::default());
        assert_eq!(store.get(id).unwrap().status, SeanceStatus::Scheduled);

        let t = store.advance(at(10));
        assert_eq!(t.started, 1);
        assert_eq!(store.get(id).unwrap().status, SeanceStatus::Started);

        let t = store.advance(at(12));
        assert_eq!(t.finished, 1);
        assert_eq!(store.get(id).unwrap().status, SeanceStatus::Finished);
    }

    #[test]
    fn seance_past_its_window_finishes_in_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SeanceStore::empty(dir.path());
        let id = Uuid::new_v4();
        store.reconcile(&[remote(id, "T")]);

        let t = store.advance(at(13));
        assert_eq!(t.started, 1);
        assert_eq!(t.finished, 1);
        assert_eq!(store.started().count(), 0);
    }

    #[test]
    fn render_substitutes_log_path() {
        let id = Uuid::new_v4();
        let seance = LocalSeance {
            id,
            start_time: at(10),
            finish_time: at(12),
            template: "<log location=\"{LOG_PATH}tpl\" history=\"1\"/>".to_owned(),
            status: SeanceStatus::Started,
        };
        let xml = render_logcfg([&seance], Path::new("/var/log/onecmon")).unwrap();

        assert!(xml.starts_with("<config xmlns=\"http://v8.1c.ru/v8/tech-log\">\n"));
        assert!(xml.contains(&format!("location=\"/var/log/onecmon/{id}/tpl\"")));
        assert!(xml.ends_with("</config>\n"));
        assert!(render_logcfg([], Path::new("/x")).is_none());
    }

    #[tokio::test]
    async fn store_roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SeanceStore::empty(dir.path());
        let id = Uuid::new_v4();
        store.reconcile(&[remote(id, "T")]);
        store.advance(at(11));
        store.save().await.unwrap();

        let loaded = SeanceStore::load(dir.path()).await.unwrap();
        assert_eq!(loaded.seances(), store.seances());
        assert_eq!(loaded.get(id).unwrap().status, SeanceStatus::Started);
    }

    #[tokio::test]
    async fn missing_state_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeanceStore::load(dir.path()).await.unwrap();
        assert!(store.seances().is_empty());
    }

    #[tokio::test]
    async fn tick_writes_then_removes_logcfg() {
        let dir = tempfile::tempdir().unwrap();
        let log_folder = dir.path().join("logs");
        let logcfg = dir.path().join("conf").join("logcfg.xml");
        let store = Arc::new(Mutex::new(SeanceStore::empty(dir.path())));
        let id = Uuid::new_v4();
        store
            .lock()
            .await
            .reconcile(&[remote(id, "<log location=\"{LOG_PATH}\"/>")]);
        let scheduler = SeanceScheduler::new(
            Arc::clone(&store),
            &log_folder,
            &logcfg,
            Duration::from_secs(1),
        );

        scheduler.tick(at(9)).await.unwrap();
        assert!(!logcfg.exists());

        scheduler.tick(at(10)).await.unwrap();
        let xml = std::fs::read_to_string(&logcfg).unwrap();
        assert!(xml.contains(&id.to_string()));

        scheduler.tick(at(12)).await.unwrap();
        assert!(!logcfg.exists());
    }

    #[tokio::test]
    async fn unchanged_logcfg_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let logcfg = dir.path().join("logcfg.xml");
        let store = Arc::new(Mutex::new(SeanceStore::empty(dir.path())));
        store
            .lock()
            .await
            .reconcile(&[remote(Uuid::new_v4(), "<log/>")]);
        let scheduler = SeanceScheduler::new(
            Arc::clone(&store),
            dir.path().join("logs"),
            &logcfg,
            Duration::from_secs(1),
        );

        scheduler.tick(at(10)).await.unwrap();
        let first = std::fs::metadata(&logcfg).unwrap().modified().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        scheduler.tick(at(11)).await.unwrap();
        let second = std::fs::metadata(&logcfg).unwrap().modified().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn deleted_seance_folder_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let log_folder = dir.path().join("logs");
        let store = Arc::new(Mutex::new(SeanceStore::empty(dir.path())));
        let id = Uuid::new_v4();
        let folder = seance_folder(&log_folder, id).join("tpl").join("rphost_1");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("23011512.log"), "x").unwrap();

        {
            let mut guard = store.lock().await;
            guard.reconcile(&[remote(id, "<log/>")]);
            guard.reconcile(&[]);
        }
        let scheduler = SeanceScheduler::new(
            Arc::clone(&store),
            &log_folder,
            dir.path().join("logcfg.xml"),
            Duration::from_secs(1),
        );
        scheduler.tick(at(10)).await.unwrap();

        assert!(!seance_folder(&log_folder, id).exists());
        assert!(store.lock().await.seances().is_empty());
        let persisted = SeanceStore::load(dir.path()).await.unwrap();
        assert!(persisted.seances().is_empty());
    }
}
