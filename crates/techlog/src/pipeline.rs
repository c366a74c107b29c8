//! 인제스천 파이프라인 -- 원문 제출을 벌크 쓰기로 변환합니다.
//!
//! [`IngestionPipeline`]은 core의 [`Pipeline`](onecmon_core::pipeline::Pipeline) trait을
//! 구현하여 서버 오케스트레이터에서 동일한 생명주기로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! IngestHandle -> mpsc -> parse workers (N) -> mpsc -> batch -> mpsc -> sink -> TechLogStorage
//!                                                    ^
//!                                              interval ticker
//! ```
//!
//! 모든 단계 경계는 bounded 채널이므로 느린 싱크는 배치 단계를, 배치 단계는 파싱 단계를,
//! 파싱 단계는 제출자를 멈춰 세웁니다.
//!
//! # 종료
//! `stop()`은 유입 채널을 닫습니다. 파싱 워커는 남은 제출을 모두 처리한 뒤 끝나고,
//! 배치 단계는 마지막 부분 배치를 내보낸 뒤 끝나며, 싱크는 마지막 쓰기 후 끝납니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use onecmon_core::config::PipelineConfig;
use onecmon_core::error::{OnecmonError, PipelineError};
use onecmon_core::metrics as m;
use onecmon_core::pipeline::{HealthStatus, Pipeline};
use onecmon_core::types::{AgentInstance, TechLogEventContent};

use crate::batch::BatchBuffer;
use crate::error::TechLogError;
use crate::event::ParsedEvent;
use crate::parser::LineParser;
use crate::storage::TechLogStorage;

/// 파이프라인 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 파싱 대기 중인 원문 제출
#[derive(Debug, Clone)]
pub struct Submission {
    pub agent: Arc<AgentInstance>,
    pub content: TechLogEventContent,
}

/// 파이프라인 처리 통계
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    parsed: AtomicU64,
    parse_errors: AtomicU64,
    batches_written: AtomicU64,
    batch_failures: AtomicU64,
    events_written: AtomicU64,
}

impl PipelineStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn parsed(&self) -> u64 {
        self.parsed.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }

    pub fn batch_failures(&self) -> u64 {
        self.batch_failures.load(Ordering::Relaxed)
    }

    pub fn events_written(&self) -> u64 {
        self.events_written.load(Ordering::Relaxed)
    }
}

/// 파이프라인 유입 핸들
///
/// 서버 세션마다 복제해서 사용합니다. 유입 채널이 가득 차면 `submit`이 대기합니다.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Submission>,
    stats: Arc<PipelineStats>,
}

impl IngestHandle {
    /// 원문 한 건을 제출합니다.
    ///
    /// 파이프라인이 정지되어 유입이 닫혔으면 `TechLogError::Channel`을 반환합니다.
    pub async fn submit(
        &self,
        agent: Arc<AgentInstance>,
        content: TechLogEventContent,
    ) -> Result<(), TechLogError> {
        self.tx
            .send(Submission { agent, content })
            .await
            .map_err(|_| TechLogError::Channel("ingestion intake closed".to_owned()))?;
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::INGEST_EVENTS_RECEIVED_TOTAL).increment(1);
        Ok(())
    }

    /// 유입 채널에 쌓인 제출 수
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// 인제스천 파이프라인 -- parse, batch, sink 세 단계를 관리합니다.
///
/// # 사용 예시
/// ```ignore
/// use onecmon_techlog::{IngestionPipelineBuilder, MemoryStorage};
///
/// let (mut pipeline, handle) = IngestionPipelineBuilder::new(Arc::new(MemoryStorage::new()))
///     .config(config.pipeline.clone())
///     .build()?;
///
/// pipeline.start().await?;
/// handle.submit(agent, content).await?;
/// ```
pub struct IngestionPipeline<S: TechLogStorage> {
    config: PipelineConfig,
    state: PipelineState,
    parser: Arc<LineParser>,
    storage: Arc<S>,
    /// 건강 상태 계산용 송신측 (유입 채널 사용률)
    intake_tx: mpsc::Sender<Submission>,
    intake_rx: Option<mpsc::Receiver<Submission>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
}

impl<S: TechLogStorage> IngestionPipeline<S> {
    /// 현재 상태를 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            PipelineState::Initialized => "initialized",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn storage(&self) -> Arc<S> {
        Arc::clone(&self.storage)
    }

    /// 새 유입 핸들을 만듭니다.
    pub fn handle(&self) -> IngestHandle {
        IngestHandle {
            tx: self.intake_tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// 유입 채널 사용률 (0.0~1.0)
    pub fn intake_utilization(&self) -> f64 {
        let max = self.intake_tx.max_capacity();
        if max == 0 {
            return 0.0;
        }
        let used = max - self.intake_tx.capacity();
        f64::from(u32::try_from(used).unwrap_or(u32::MAX))
            / f64::from(u32::try_from(max).unwrap_or(u32::MAX))
    }

    fn worker_count(&self) -> usize {
        if self.config.parse_workers > 0 {
            return self.config.parse_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl<S: TechLogStorage> Pipeline for IngestionPipeline<S> {
    async fn start(&mut self) -> Result<(), OnecmonError> {
        if self.state == PipelineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }
        let intake_rx = self.intake_rx.take().ok_or_else(|| {
            PipelineError::InitFailed("ingestion pipeline cannot be restarted".to_owned())
        })?;

        let workers = self.worker_count();
        let capacity = self.config.channel_capacity.max(1);
        let batch_size = self.config.batch_size.max(1);
        let batch_capacity = (capacity / batch_size).max(1);
        let flush_interval = Duration::from_millis(self.config.flush_interval_ms.max(1));

        tracing::info!(
            workers,
            batch_size,
            flush_interval_ms = self.config.flush_interval_ms,
            "starting ingestion pipeline"
        );

        let (event_tx, event_rx) = mpsc::channel::<ParsedEvent>(capacity);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<ParsedEvent>>(batch_capacity);

        // 1. 싱크 (단일 워커)
        self.tasks.push(tokio::spawn(sink_stage(
            batch_rx,
            Arc::clone(&self.storage),
            Arc::clone(&self.stats),
        )));

        // 2. 배치
        self.tasks.push(tokio::spawn(batch_stage(
            event_rx,
            batch_tx,
            batch_size,
            flush_interval,
        )));

        // 3. 파싱 워커
        let intake = Arc::new(Mutex::new(intake_rx));
        for worker in 0..workers {
            self.tasks.push(tokio::spawn(parse_worker(
                worker,
                Arc::clone(&intake),
                event_tx.clone(),
                Arc::clone(&self.parser),
                Arc::clone(&self.stats),
                self.shutdown.clone(),
            )));
        }
        drop(event_tx);

        self.state = PipelineState::Running;
        tracing::info!("ingestion pipeline started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), OnecmonError> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        tracing::info!("stopping ingestion pipeline");
        self.shutdown.cancel();

        // 파싱 -> 배치 -> 싱크 순으로 완료가 전파된다
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "ingestion task panicked");
            }
        }

        self.state = PipelineState::Stopped;
        tracing::info!(
            parsed = self.stats.parsed(),
            written = self.stats.events_written(),
            "ingestion pipeline stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            PipelineState::Running => {
                let utilization = self.intake_utilization();
                if utilization > 0.9 {
                    HealthStatus::Degraded(format!(
                        "intake queue utilization high: {:.1}%",
                        utilization * 100.0
                    ))
                } else {
                    HealthStatus::Healthy
                }
            }
            PipelineState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            PipelineState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 유입 큐에서 제출을 꺼내 파싱합니다.
///
/// 종료 신호를 받으면 유입을 닫고, 이미 큐에 들어온 제출은 모두 처리합니다.
async fn parse_worker(
    worker: usize,
    intake: Arc<Mutex<mpsc::Receiver<Submission>>>,
    event_tx: mpsc::Sender<ParsedEvent>,
    parser: Arc<LineParser>,
    stats: Arc<PipelineStats>,
    shutdown: CancellationToken,
) {
    loop {
        let (next, depth) = {
            let mut rx = intake.lock().await;
            let item = tokio::select! {
                biased;
                item = rx.recv() => item,
                () = shutdown.cancelled() => {
                    rx.close();
                    rx.recv().await
                }
            };
            (item, rx.len())
        };
        let Some(submission) = next else {
            break;
        };
        metrics::gauge!(m::INGEST_QUEUE_DEPTH).set(f64::from(u32::try_from(depth).unwrap_or(u32::MAX)));

        match parser.parse(&submission.agent, &submission.content) {
            Ok(event) => {
                stats.parsed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::INGEST_EVENTS_PARSED_TOTAL).increment(1);
                if event_tx.send(event).await.is_err() {
                    tracing::warn!(worker, "batch stage gone, parse worker exiting");
                    break;
                }
            }
            Err(e) => {
                stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::INGEST_PARSE_ERRORS_TOTAL).increment(1);
                tracing::warn!(
                    agent_id = %submission.agent.id,
                    file = %submission.content.file,
                    error = %e,
                    content = %submission.content.content,
                    "failed to parse tech log event content"
                );
            }
        }
    }
    tracing::debug!(worker, "parse worker finished");
}

/// 크기 또는 타이머 조건으로 배치를 내보냅니다.
async fn batch_stage(
    mut event_rx: mpsc::Receiver<ParsedEvent>,
    batch_tx: mpsc::Sender<Vec<ParsedEvent>>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer = BatchBuffer::new(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 첫 tick은 즉시 완료된다
    ticker.tick().await;

    loop {
        tokio::select! {
            item = event_rx.recv() => match item {
                Some(event) => {
                    if buffer.push(event) && !flush(&mut buffer, &batch_tx).await {
                        return;
                    }
                }
                None => {
                    flush(&mut buffer, &batch_tx).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !flush(&mut buffer, &batch_tx).await {
                    return;
                }
            }
        }
    }
    tracing::debug!(
        batches = buffer.batches_taken(),
        events = buffer.total_received(),
        "batch stage finished"
    );
}

/// 버퍼를 비워 싱크로 보냅니다. 싱크가 사라졌으면 `false`를 반환합니다.
async fn flush(buffer: &mut BatchBuffer, batch_tx: &mpsc::Sender<Vec<ParsedEvent>>) -> bool {
    let Some(batch) = buffer.take() else {
        return true;
    };
    if batch_tx.send(batch).await.is_err() {
        tracing::error!("sink stage gone, dropping batch");
        return false;
    }
    true
}

/// 배치마다 벌크 쓰기를 한 번 수행합니다. 실패한 배치는 기록 후 버립니다.
async fn sink_stage<S: TechLogStorage>(
    mut batch_rx: mpsc::Receiver<Vec<ParsedEvent>>,
    storage: Arc<S>,
    stats: Arc<PipelineStats>,
) {
    while let Some(batch) = batch_rx.recv().await {
        let size = batch.len() as u64;
        match storage.bulk_insert(&batch).await {
            Ok(()) => {
                stats.batches_written.fetch_add(1, Ordering::Relaxed);
                stats.events_written.fetch_add(size, Ordering::Relaxed);
                metrics::counter!(m::STORAGE_BATCHES_WRITTEN_TOTAL).increment(1);
                metrics::counter!(m::STORAGE_EVENTS_WRITTEN_TOTAL).increment(size);
            }
            Err(e) => {
                stats.batch_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::STORAGE_BATCH_FAILURES_TOTAL).increment(1);
                tracing::error!(batch_size = size, error = %e, "bulk insert failed, batch dropped");
            }
        }
    }
    tracing::debug!("sink stage finished");
}

/// 인제스천 파이프라인 빌더
pub struct IngestionPipelineBuilder<S: TechLogStorage> {
    config: PipelineConfig,
    storage: Arc<S>,
    parser: LineParser,
}

impl<S: TechLogStorage> IngestionPipelineBuilder<S> {
    /// 저장소로 새 빌더를 생성합니다.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            config: PipelineConfig::default(),
            storage,
            parser: LineParser::new(),
        }
    }

    /// 파이프라인 설정을 지정합니다.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// 파서를 지정합니다.
    pub fn parser(mut self, parser: LineParser) -> Self {
        self.parser = parser;
        self
    }

    /// 파이프라인을 빌드합니다.
    ///
    /// # Returns
    /// - `IngestionPipeline`: 파이프라인 인스턴스
    /// - `IngestHandle`: 유입 핸들
    pub fn build(self) -> Result<(IngestionPipeline<S>, IngestHandle), TechLogError> {
        if self.config.batch_size == 0 {
            return Err(TechLogError::Config {
                field: "pipeline.batch_size".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.config.channel_capacity == 0 {
            return Err(TechLogError::Config {
                field: "pipeline.channel_capacity".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.config.flush_interval_ms == 0 {
            return Err(TechLogError::Config {
                field: "pipeline.flush_interval_ms".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        let (intake_tx, intake_rx) = mpsc::channel(self.config.channel_capacity);
        let stats = Arc::new(PipelineStats::default());

        let pipeline = IngestionPipeline {
            config: self.config,
            state: PipelineState::Initialized,
            parser: Arc::new(self.parser),
            storage: self.storage,
            intake_tx,
            intake_rx: Some(intake_rx),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            stats,
        };
        let handle = pipeline.handle();

        Ok((pipeline, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use uuid::Uuid;

    fn content(n: i64) -> TechLogEventContent {
        TechLogEventContent {
            seance_id: Uuid::nil(),
            template_id: Uuid::nil(),
            folder: "rphost_1".to_owned(),
            file: "23011512".to_owned(),
            content: format!("2023-01-15 12:12:34.{n:06}-1,CONN,0"),
            end_position: n,
        }
    }

    fn build(config: PipelineConfig) -> (IngestionPipeline<MemoryStorage>, IngestHandle) {
        IngestionPipelineBuilder::new(Arc::new(MemoryStorage::new()))
            .config(config)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_creates_pipeline() {
        let (pipeline, handle) = build(PipelineConfig::default());
        assert_eq!(pipeline.state_name(), "initialized");
        assert_eq!(handle.queued(), 0);
        assert_eq!(pipeline.intake_utilization(), 0.0);
    }

    #[test]
    fn builder_with_invalid_config_fails() {
        let config = PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        };
        let result = IngestionPipelineBuilder::new(Arc::new(MemoryStorage::new()))
            .config(config)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pipeline_lifecycle() {
        let (mut pipeline, _handle) = build(PipelineConfig::default());

        assert!(pipeline.health_check().await.is_unhealthy());
        assert!(pipeline.stop().await.is_err());

        pipeline.start().await.unwrap();
        assert!(pipeline.health_check().await.is_healthy());
        assert!(pipeline.start().await.is_err());

        pipeline.stop().await.unwrap();
        assert_eq!(pipeline.state_name(), "stopped");
        assert!(pipeline.health_check().await.is_unhealthy());
        assert!(pipeline.start().await.is_err());
    }

    #[tokio::test]
    async fn stop_drains_queued_submissions() {
        let config = PipelineConfig {
            parse_workers: 2,
            batch_size: 1000,
            flush_interval_ms: 60_000,
            ..PipelineConfig::default()
        };
        let (mut pipeline, handle) = build(config);
        let storage = pipeline.storage();
        pipeline.start().await.unwrap();

        let agent = Arc::new(AgentInstance::default());
        for n in 1..=25 {
            handle.submit(Arc::clone(&agent), content(n)).await.unwrap();
        }
        pipeline.stop().await.unwrap();

        assert_eq!(storage.len().await, 25);
        assert_eq!(storage.bulk_writes(), 1);
        assert!(handle.submit(agent, content(26)).await.is_err());
    }

    #[tokio::test]
    async fn intake_utilization_tracks_queue() {
        let config = PipelineConfig {
            channel_capacity: 10,
            ..PipelineConfig::default()
        };
        let (pipeline, handle) = build(config);
        let agent = Arc::new(AgentInstance::default());
        for n in 0..10 {
            handle.submit(Arc::clone(&agent), content(n)).await.unwrap();
        }
        assert_eq!(handle.queued(), 10);
        assert!(pipeline.intake_utilization() > 0.9);
    }
}
