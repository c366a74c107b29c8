//! Per-file tailing and shipping of raw tech log events.
//!
//! ```text
//! FolderWatcher ──┐
//!                 ├─> dispatch channel ─> Exporter::run ─> tail task per file
//! startup scan ───┘                                          │
//!                                        resolve offset (cache, else server)
//!                                        EventReader::move_next loop
//!                                        push TechLogEventContent, update cache
//! ```
//!
//! Raw text is shipped as-is; parsing happens on the server. A file's position only
//! advances in the cache after its event was handed to the transport, and the server's
//! stored `end_position` is what a fresh agent resumes from, so a crash re-sends at most
//! the events that were in flight.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use onecmon_core::metrics as m;
use onecmon_core::types::{FileKey, LastFilePositionRequest, TechLogEventContent};
use onecmon_protocol::{Connection, MessageType, TransportError};
use onecmon_techlog::EventReader;

use crate::error::AgentError;
use crate::position_cache::PositionCache;
use crate::watcher::{InFlightFiles, file_key_from_path};

/// Upper bound on waiting for an authoritative position.
pub const POSITION_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// First pause before retrying a file after a transient server failure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retry pauses double up to this bound.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// What the exporter needs from the server side.
///
/// [`Connection`] is the production implementation; tests use an in-memory recorder.
pub trait ServerLink: Send + Sync + 'static {
    /// Asks the server for the last stored `end_position` of `key`.
    fn last_file_position(
        &self,
        key: &FileKey,
    ) -> impl Future<Output = Result<i64, AgentError>> + Send;

    /// Enqueues one raw event. Waits while the outbound queue is full.
    fn send_event(
        &self,
        event: TechLogEventContent,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;
}

impl ServerLink for Connection {
    async fn last_file_position(&self, key: &FileKey) -> Result<i64, AgentError> {
        let request = LastFilePositionRequest::from(key);
        let response = tokio::time::timeout(
            POSITION_REQUEST_TIMEOUT,
            self.send_and_await(MessageType::LastFilePositionRequest, &request),
        )
        .await
        .map_err(|_| AgentError::Timeout {
            operation: "last file position request",
            timeout_secs: POSITION_REQUEST_TIMEOUT.as_secs(),
        })??;
        Ok(response.decode::<i64>()?)
    }

    async fn send_event(&self, event: TechLogEventContent) -> Result<(), AgentError> {
        self.push(MessageType::TechLogEventContent, &event).await?;
        Ok(())
    }
}

/// Dispatches watched files to tail tasks.
pub struct Exporter<L: ServerLink> {
    root: PathBuf,
    link: Arc<L>,
    cache: Arc<PositionCache>,
    in_flight: Arc<InFlightFiles>,
    cancel: CancellationToken,
    retry_delay: Duration,
}

impl<L: ServerLink> Exporter<L> {
    pub fn new(
        root: impl Into<PathBuf>,
        link: Arc<L>,
        cache: Arc<PositionCache>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            root: root.into(),
            link,
            cache,
            in_flight: Arc::new(InFlightFiles::new()),
            cancel,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Sets the first pause before a file is retried after a transient failure.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay.max(Duration::from_millis(1));
        self
    }

    pub fn in_flight(&self) -> Arc<InFlightFiles> {
        Arc::clone(&self.in_flight)
    }

    /// Consumes dispatch requests until cancelled or the channel closes, then waits for
    /// running tail tasks.
    pub async fn run(self, mut paths: mpsc::Receiver<PathBuf>) {
        let mut tasks = JoinSet::new();
        let this = Arc::new(self);

        loop {
            let path = tokio::select! {
                path = paths.recv() => path,
                _ = this.cancel.cancelled() => None,
            };
            let Some(path) = path else {
                break;
            };

            // Reap finished tails so the set does not grow without bound.
            while tasks.try_join_next().is_some() {}

            if !this.in_flight.mark_in_flight(&path) {
                trace!(file = %path.display(), "already in flight");
                continue;
            }
            let exporter = Arc::clone(&this);
            tasks.spawn(async move { exporter.tail(path).await });
        }

        debug!(running = tasks.len(), "exporter stopping");
        while tasks.join_next().await.is_some() {}
    }

    /// Tails one claimed file until end of file, repeating while it keeps being touched.
    ///
    /// Transient server failures keep the claim and retry with a growing pause; the
    /// file may never be written again, so no later notification would bring it back.
    async fn tail(&self, path: PathBuf) {
        let mut retry_delay = self.retry_delay;
        loop {
            match self.export_file(&path).await {
                Ok(sent) => {
                    trace!(file = %path.display(), sent, "reached end of file");
                    retry_delay = self.retry_delay;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        file = %path.display(),
                        error = %e,
                        retry_in_ms = retry_delay.as_millis() as u64,
                        "server unavailable, will retry tech log file"
                    );
                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(retry_delay) => false,
                        _ = self.cancel.cancelled() => true,
                    };
                    if cancelled {
                        self.in_flight.release(&path);
                        return;
                    }
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                    continue;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to export tech log file");
                    self.in_flight.release(&path);
                    return;
                }
            }
            if self.cancel.is_cancelled() || !self.in_flight.clear_in_flight(&path) {
                if self.cancel.is_cancelled() {
                    self.in_flight.release(&path);
                }
                return;
            }
        }
    }

    /// Sends every complete event past the resume offset. Returns the number sent.
    pub async fn export_file(&self, path: &Path) -> Result<u64, AgentError> {
        let key = file_key_from_path(&self.root, path)?;
        let position = self.resolve_position(&key).await?;
        let mut reader = EventReader::open(path, position).await?;
        debug!(file = %path.display(), offset = position, "tailing tech log file");

        let mut sent = 0u64;
        while !self.cancel.is_cancelled() && reader.move_next().await? {
            let end_position = i64::try_from(reader.position()).unwrap_or(i64::MAX);
            let event = TechLogEventContent {
                seance_id: key.seance_id,
                template_id: key.template_id,
                folder: key.folder.clone(),
                file: key.file.clone(),
                content: reader.event_content().to_owned(),
                end_position,
            };
            match self.link.send_event(event).await {
                Ok(()) => {
                    metrics::counter!(m::AGENT_EVENTS_SENT_TOTAL).increment(1);
                    sent += 1;
                }
                // Unframeable events are skipped; the offset still advances.
                Err(AgentError::Transport(
                    e @ (TransportError::InvalidLength { .. } | TransportError::Encode(_)),
                )) => {
                    warn!(
                        file = %path.display(),
                        offset = end_position,
                        error = %e,
                        "dropping tech log event that cannot be sent"
                    );
                }
                Err(e) => return Err(e),
            }
            self.cache.update(&key, end_position);
        }
        Ok(sent)
    }

    async fn resolve_position(&self, key: &FileKey) -> Result<u64, AgentError> {
        let position = match self.cache.get(key) {
            Some(position) => position,
            None => {
                let position = self.link.last_file_position(key).await?;
                debug!(file = %key, offset = position, "resume offset from server");
                position
            }
        };
        Ok(u64::try_from(position).unwrap_or(0))
    }
}

/// Feeds the startup scan into the dispatch channel.
pub async fn dispatch_existing(root: &Path, tx: &mpsc::Sender<PathBuf>) -> Result<usize, AgentError> {
    let files = crate::watcher::scan_existing(root).await?;
    let count = files.len();
    for path in files {
        if tx.send(path).await.is_err() {
            error!("dispatch channel closed during startup scan");
            break;
        }
    }
    info!(count, "existing tech log files queued");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;

    /// Records sent events and answers position queries from a map.
    #[derive(Default)]
    struct RecordingLink {
        positions: Mutex<HashMap<FileKey, i64>>,
        sent: Mutex<Vec<TechLogEventContent>>,
        queries: Mutex<u32>,
        /// Position queries still to fail with a timeout.
        failing_queries: Mutex<u32>,
        /// Events containing this text are refused as oversized.
        oversized: Mutex<Option<&'static str>>,
    }

    impl RecordingLink {
        fn sent(&self) -> Vec<TechLogEventContent> {
            self.sent.lock().unwrap().clone()
        }

        fn queries(&self) -> u32 {
            *self.queries.lock().unwrap()
        }
    }

    impl ServerLink for RecordingLink {
        async fn last_file_position(&self, key: &FileKey) -> Result<i64, AgentError> {
            *self.queries.lock().unwrap() += 1;
            {
                let mut failing = self.failing_queries.lock().unwrap();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(AgentError::Timeout {
                        operation: "last file position request",
                        timeout_secs: 30,
                    });
                }
            }
            Ok(self.positions.lock().unwrap().get(key).copied().unwrap_or(0))
        }

        async fn send_event(&self, event: TechLogEventContent) -> Result<(), AgentError> {
            if let Some(marker) = *self.oversized.lock().unwrap() {
                if event.content.contains(marker) {
                    return Err(TransportError::InvalidLength {
                        length: i32::MAX,
                        max: onecmon_protocol::MAX_PAYLOAD_LENGTH,
                    }
                    .into());
                }
            }
            self.sent.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        path: PathBuf,
        key: FileKey,
    }

    fn fixture(body: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let seance = Uuid::new_v4();
        let template = Uuid::new_v4();
        let folder = root
            .join(seance.to_string())
            .join(template.to_string())
            .join("rphost_1234");
        std::fs::create_dir_all(&folder).unwrap();
        let path = folder.join("23011512.log");
        std::fs::write(&path, body).unwrap();
        Fixture {
            _dir: dir,
            root,
            path,
            key: FileKey {
                seance_id: seance,
                template_id: template,
                folder: "rphost_1234".to_owned(),
                file: "23011512".to_owned(),
            },
        }
    }

    fn exporter(root: &Path, link: Arc<RecordingLink>) -> Exporter<RecordingLink> {
        Exporter::new(
            root,
            link,
            Arc::new(PositionCache::new(Duration::from_secs(3600))),
            CancellationToken::new(),
        )
    }

    const TWO_EVENTS: &str =
        "12:34.100000-500,EXCP,1,Descr='boom'\n12:34.200000-100,CONN,0,Usr=admin\n";

    #[tokio::test]
    async fn exports_all_events_with_end_positions() {
        let fx = fixture(TWO_EVENTS);
        let link = Arc::new(RecordingLink::default());
        let exporter = exporter(&fx.root, Arc::clone(&link));

        let sent = exporter.export_file(&fx.path).await.unwrap();
        assert_eq!(sent, 2);

        let events = link.sent();
        assert_eq!(events[0].seance_id, fx.key.seance_id);
        assert_eq!(events[0].folder, "rphost_1234");
        assert_eq!(events[0].file, "23011512");
        assert!(events[0].content.starts_with("2023-01-15 12:12:34.100000"));
        assert_eq!(events[0].end_position, 37);
        assert_eq!(events[1].end_position, TWO_EVENTS.len() as i64);
    }

    #[tokio::test]
    async fn resumes_from_server_position() {
        let fx = fixture(TWO_EVENTS);
        let link = Arc::new(RecordingLink::default());
        link.positions.lock().unwrap().insert(fx.key.clone(), 37);
        let exporter = exporter(&fx.root, Arc::clone(&link));

        assert_eq!(exporter.export_file(&fx.path).await.unwrap(), 1);
        assert!(link.sent()[0].content.contains("CONN"));
    }

    #[tokio::test]
    async fn second_pass_uses_cache_and_sends_only_new_events() {
        let fx = fixture(TWO_EVENTS);
        let link = Arc::new(RecordingLink::default());
        let exporter = exporter(&fx.root, Arc::clone(&link));

        exporter.export_file(&fx.path).await.unwrap();
        assert_eq!(link.queries(), 1);

        let mut body = TWO_EVENTS.to_owned();
        body.push_str("12:35.000000-7,SDBL,2,Func=commit\n");
        std::fs::write(&fx.path, &body).unwrap();

        assert_eq!(exporter.export_file(&fx.path).await.unwrap(), 1);
        assert_eq!(link.queries(), 1, "cached position must be used");
        let events = link.sent();
        assert_eq!(events.len(), 3);
        assert!(events[2].content.contains("SDBL"));
        assert_eq!(events[2].end_position, body.len() as i64);
    }

    #[tokio::test]
    async fn negative_server_position_starts_from_zero() {
        let fx = fixture(TWO_EVENTS);
        let link = Arc::new(RecordingLink::default());
        link.positions.lock().unwrap().insert(fx.key.clone(), -1);
        let exporter = exporter(&fx.root, Arc::clone(&link));
        assert_eq!(exporter.export_file(&fx.path).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn path_outside_layout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("23011512.log");
        std::fs::write(&path, TWO_EVENTS).unwrap();
        let link = Arc::new(RecordingLink::default());
        let exporter = exporter(dir.path(), Arc::clone(&link));

        let err = exporter.export_file(&path).await.unwrap_err();
        assert!(matches!(err, AgentError::UnexpectedPath { .. }));
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn run_dispatches_and_clears_in_flight() {
        let fx = fixture(TWO_EVENTS);
        let link = Arc::new(RecordingLink::default());
        let cancel = CancellationToken::new();
        let exporter = Exporter::new(
            fx.root.clone(),
            Arc::clone(&link),
            Arc::new(PositionCache::new(Duration::from_secs(3600))),
            cancel.clone(),
        );
        let in_flight = exporter.in_flight();

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(exporter.run(rx));

        dispatch_existing(&fx.root, &tx).await.unwrap();
        // Duplicate notification for the same file must not double-send.
        tx.send(fx.path.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while link.sent().len() < 2 || !in_flight.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("events were not exported");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.sent().len(), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unsendable_event_is_skipped_and_position_advances() {
        let fx = fixture(TWO_EVENTS);
        let link = Arc::new(RecordingLink::default());
        *link.oversized.lock().unwrap() = Some("EXCP");
        let cache = Arc::new(PositionCache::new(Duration::from_secs(3600)));
        let exporter = Exporter::new(
            fx.root.clone(),
            Arc::clone(&link),
            Arc::clone(&cache),
            CancellationToken::new(),
        );

        assert_eq!(exporter.export_file(&fx.path).await.unwrap(), 1);
        let events = link.sent();
        assert_eq!(events.len(), 1);
        assert!(events[0].content.contains("CONN"));
        assert_eq!(cache.get(&fx.key), Some(TWO_EVENTS.len() as i64));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_without_new_notification() {
        let fx = fixture(TWO_EVENTS);
        let link = Arc::new(RecordingLink::default());
        *link.failing_queries.lock().unwrap() = 2;
        let cancel = CancellationToken::new();
        let exporter = Exporter::new(
            fx.root.clone(),
            Arc::clone(&link),
            Arc::new(PositionCache::new(Duration::from_secs(3600))),
            cancel.clone(),
        )
        .with_retry_delay(Duration::from_millis(20));
        let in_flight = exporter.in_flight();

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(exporter.run(rx));
        dispatch_existing(&fx.root, &tx).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while link.sent().len() < 2 || !in_flight.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("file was not retried after the server came back");

        assert_eq!(link.queries(), 3);
        assert_eq!(link.sent()[1].end_position, TWO_EVENTS.len() as i64);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_during_retry_releases_claim() {
        let fx = fixture(TWO_EVENTS);
        let link = Arc::new(RecordingLink::default());
        *link.failing_queries.lock().unwrap() = u32::MAX;
        let cancel = CancellationToken::new();
        let exporter = Exporter::new(
            fx.root.clone(),
            Arc::clone(&link),
            Arc::new(PositionCache::new(Duration::from_secs(3600))),
            cancel.clone(),
        )
        .with_retry_delay(Duration::from_secs(60));
        let in_flight = exporter.in_flight();

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(exporter.run(rx));
        tx.send(fx.path.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while link.queries() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(in_flight.is_empty());
        assert!(link.sent().is_empty());
    }
}
