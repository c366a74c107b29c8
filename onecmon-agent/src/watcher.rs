//! Tech log folder watching and file dispatch bookkeeping.
//!
//! Filesystem notifications are funneled into a bounded channel of paths consumed by a
//! single dispatcher loop (see [`crate::exporter`]). The startup scan feeds the same
//! channel, so notifications and the scan never race on dispatch.
//!
//! [`InFlightFiles`] is the only synchronization point for dispatch: a path is tailed
//! by at most one task at a time.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use onecmon_core::types::FileKey;

use crate::error::AgentError;

const LOG_EXTENSION: &str = "log";

/// Recursive watcher over the tech log root.
///
/// Dropping it stops notifications.
pub struct FolderWatcher {
    root: PathBuf,
    tx: mpsc::Sender<PathBuf>,
    _watcher: RecommendedWatcher,
}

impl FolderWatcher {
    /// Creates the root folder if needed and starts watching it.
    ///
    /// Created and modified `*.log` paths are sent to the returned receiver. Failing to
    /// create or watch the folder is fatal at startup.
    pub fn start(
        root: impl AsRef<Path>,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<PathBuf>), AgentError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let notify_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "file watch error");
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in event.paths.into_iter().filter(|p| is_log_file(p)) {
                // Runs on the notify thread, outside the runtime.
                if notify_tx.blocking_send(path).is_err() {
                    return;
                }
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        info!(root = %root.display(), "watching tech log folder");
        Ok((
            Self {
                root,
                tx,
                _watcher: watcher,
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sender into the same dispatch channel, for the startup scan.
    pub fn sender(&self) -> mpsc::Sender<PathBuf> {
        self.tx.clone()
    }
}

/// Paths currently being tailed.
///
/// A notification for a path that is already in flight is not dispatched again; it is
/// remembered instead, and [`clear_in_flight`](Self::clear_in_flight) tells the owning
/// task to make one more pass.
#[derive(Default)]
pub struct InFlightFiles {
    paths: Mutex<HashMap<PathBuf, bool>>,
}

impl InFlightFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `path` for tailing. Returns false if another task already owns it.
    pub fn mark_in_flight(&self, path: &Path) -> bool {
        let mut paths = self.lock();
        if let Some(touched) = paths.get_mut(path) {
            *touched = true;
            return false;
        }
        paths.insert(path.to_path_buf(), false);
        true
    }

    /// Releases `path` after its tail reached end of file.
    ///
    /// Returns true, and keeps the claim, if the path was touched while in flight; the
    /// caller must tail it again before calling this once more.
    pub fn clear_in_flight(&self, path: &Path) -> bool {
        let mut paths = self.lock();
        let touched = match paths.get_mut(path) {
            Some(touched) => std::mem::replace(touched, false),
            None => return false,
        };
        if !touched {
            paths.remove(path);
        }
        touched
    }

    /// Drops the claim unconditionally (tail failed).
    pub fn release(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, bool>> {
        // Critical sections never panic; recover from poisoning anyway.
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Derives the file key from `<root>/<seanceId>/<templateId>/<folder>/<file>.log`.
pub fn file_key_from_path(root: &Path, path: &Path) -> Result<FileKey, AgentError> {
    let unexpected = |reason: &str| AgentError::UnexpectedPath {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    };

    let relative = path
        .strip_prefix(root)
        .map_err(|_| unexpected("outside of the log root"))?;
    let parts: Vec<&OsStr> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    let [seance, template, folder, file] = parts.as_slice() else {
        return Err(unexpected("expected seanceId/templateId/folder/file.log"));
    };

    let parse_uuid = |part: &OsStr, what: &str| {
        part.to_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| unexpected(&format!("{what} is not a UUID")))
    };
    let file = Path::new(*file);
    if file.extension().and_then(OsStr::to_str) != Some(LOG_EXTENSION) {
        return Err(unexpected("not a .log file"));
    }

    Ok(FileKey {
        seance_id: parse_uuid(*seance, "seance id")?,
        template_id: parse_uuid(*template, "template id")?,
        folder: folder.to_string_lossy().into_owned(),
        file: file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    })
}

/// Lists existing `*.log` files under `root`, oldest first.
pub async fn scan_existing(root: &Path) -> Result<Vec<PathBuf>, AgentError> {
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                dirs.push(path);
            } else if file_type.is_file() && is_log_file(&path) {
                let modified = entry
                    .metadata()
                    .await
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((modified, path));
            }
        }
    }

    found.sort();
    debug!(root = %root.display(), count = found.len(), "existing tech log files");
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

fn is_log_file(path: &Path) -> bool {
    path.extension().and_then(OsStr::to_str) == Some(LOG_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_is_exclusive() {
        let set = InFlightFiles::new();
        let path = Path::new("/logs/a.log");
        assert!(set.mark_in_flight(path));
        assert!(!set.mark_in_flight(path));
        assert!(set.contains(path));
    }

    #[test]
    fn clear_releases_untouched_path() {
        let set = InFlightFiles::new();
        let path = Path::new("/logs/a.log");
        set.mark_in_flight(path);
        assert!(!set.clear_in_flight(path));
        assert!(!set.contains(path));
        assert!(set.mark_in_flight(path));
    }

    #[test]
    fn touch_while_in_flight_requests_another_pass() {
        let set = InFlightFiles::new();
        let path = Path::new("/logs/a.log");
        set.mark_in_flight(path);
        assert!(!set.mark_in_flight(path));

        assert!(set.clear_in_flight(path));
        assert!(set.contains(path));
        assert!(!set.clear_in_flight(path));
        assert!(set.is_empty());
    }

    #[test]
    fn release_drops_claim() {
        let set = InFlightFiles::new();
        let path = Path::new("/logs/a.log");
        set.mark_in_flight(path);
        set.mark_in_flight(path);
        set.release(path);
        assert!(set.is_empty());
    }

    #[test]
    fn key_from_four_level_path() {
        let root = Path::new("/var/log/onecmon");
        let seance = Uuid::new_v4();
        let template = Uuid::new_v4();
        let path = root
            .join(seance.to_string())
            .join(template.to_string())
            .join("rphost_1234")
            .join("23011512.log");

        let key = file_key_from_path(root, &path).unwrap();
        assert_eq!(key.seance_id, seance);
        assert_eq!(key.template_id, template);
        assert_eq!(key.folder, "rphost_1234");
        assert_eq!(key.file, "23011512");
    }

    #[test]
    fn key_rejects_bad_paths() {
        let root = Path::new("/var/log/onecmon");
        let seance = Uuid::new_v4().to_string();
        let template = Uuid::new_v4().to_string();

        let shallow = root.join(&seance).join("rphost_1").join("23011512.log");
        let not_uuid = root
            .join("not-a-uuid")
            .join(&template)
            .join("rphost_1")
            .join("23011512.log");
        let outside = Path::new("/tmp")
            .join(&seance)
            .join(&template)
            .join("rphost_1")
            .join("23011512.log");
        let not_log = root
            .join(&seance)
            .join(&template)
            .join("rphost_1")
            .join("23011512.txt");

        for path in [shallow, not_uuid, outside, not_log] {
            assert!(
                matches!(
                    file_key_from_path(root, &path),
                    Err(AgentError::UnexpectedPath { .. })
                ),
                "{} should be rejected",
                path.display()
            );
        }
    }

    #[tokio::test]
    async fn scan_finds_nested_log_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("s").join("t").join("rphost_1");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("23011512.log"), "x").unwrap();
        std::fs::write(nested.join("23011513.log"), "x").unwrap();
        std::fs::write(nested.join("notes.txt"), "x").unwrap();

        let mut files = scan_existing(dir.path()).await.unwrap();
        files.sort();
        assert_eq!(
            files,
            vec![nested.join("23011512.log"), nested.join("23011513.log")]
        );
    }

    #[tokio::test]
    async fn scan_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = scan_existing(&dir.path().join("absent")).await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn watcher_reports_new_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, mut rx) = FolderWatcher::start(dir.path(), 16).unwrap();

        let folder = dir.path().join("s").join("t").join("rphost_1");
        std::fs::create_dir_all(&folder).unwrap();
        // Let the recursive watch pick up the new directories.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let file = folder.join("23011512.log");
        std::fs::write(&file, "12:34.100000-1,CONN,0\n").unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(path) if path.ends_with("23011512.log") => return path,
                    Some(_) => continue,
                    None => panic!("watch channel closed"),
                }
            }
        })
        .await
        .expect("no notification for the new log file");
        assert!(got.ends_with("rphost_1/23011512.log"));
    }
}
