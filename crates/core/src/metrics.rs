//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `onecmon_`
//! - 구성 요소: `ingest_`, `storage_`, `server_`, `agent_`
//! - 접미어: `_total` (counter), `_seconds` (histogram), 없음 (gauge)
//!
//! ```ignore
//! metrics::counter!(onecmon_core::metrics::INGEST_EVENTS_PARSED_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 메시지 타입 레이블 키
pub const LABEL_MESSAGE_TYPE: &str = "message_type";

// ─── Ingestion 메트릭 ───────────────────────────────────────────────

/// Ingestion: 수신된 원문 이벤트 수 (counter)
pub const INGEST_EVENTS_RECEIVED_TOTAL: &str = "onecmon_ingest_events_received_total";

/// Ingestion: 파싱 성공 이벤트 수 (counter)
pub const INGEST_EVENTS_PARSED_TOTAL: &str = "onecmon_ingest_events_parsed_total";

/// Ingestion: 파싱 실패로 드롭된 이벤트 수 (counter)
pub const INGEST_PARSE_ERRORS_TOTAL: &str = "onecmon_ingest_parse_errors_total";

/// Ingestion: 파싱 단계 입력 큐 사용량 (gauge)
pub const INGEST_QUEUE_DEPTH: &str = "onecmon_ingest_queue_depth";

// ─── Storage 메트릭 ─────────────────────────────────────────────────

/// Storage: 기록된 배치 수 (counter)
pub const STORAGE_BATCHES_WRITTEN_TOTAL: &str = "onecmon_storage_batches_written_total";

/// Storage: 기록 실패로 드롭된 배치 수 (counter)
pub const STORAGE_BATCH_FAILURES_TOTAL: &str = "onecmon_storage_batch_failures_total";

/// Storage: 기록된 이벤트 수 (counter)
pub const STORAGE_EVENTS_WRITTEN_TOTAL: &str = "onecmon_storage_events_written_total";

/// Storage: 배치 기록 소요 시간 (histogram, 초)
pub const STORAGE_BULK_INSERT_DURATION_SECONDS: &str =
    "onecmon_storage_bulk_insert_duration_seconds";

// ─── Server 메트릭 ──────────────────────────────────────────────────

/// Server: 연결된 에이전트 수 (gauge)
pub const SERVER_CONNECTED_AGENTS: &str = "onecmon_server_connected_agents";

/// Server: 프로토콜 위반으로 닫힌 연결 수 (counter, label: message_type)
pub const SERVER_PROTOCOL_VIOLATIONS_TOTAL: &str = "onecmon_server_protocol_violations_total";

/// Server: 가동 시간 (gauge, 초)
pub const SERVER_UPTIME_SECONDS: &str = "onecmon_server_uptime_seconds";

// ─── Agent 메트릭 ───────────────────────────────────────────────────

/// Agent: 서버로 전송한 이벤트 수 (counter)
pub const AGENT_EVENTS_SENT_TOTAL: &str = "onecmon_agent_events_sent_total";

/// Agent: 재연결 횟수 (counter)
pub const AGENT_RECONNECTS_TOTAL: &str = "onecmon_agent_reconnects_total";

// ─── 히스토그램 버킷 정의 ────────────────────────────────────────────

/// 배치 기록 지연 시간 히스토그램 버킷 (초)
pub const BULK_INSERT_DURATION_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0];

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출해야 합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        INGEST_EVENTS_RECEIVED_TOTAL,
        "Total number of raw tech log events received from agents"
    );
    describe_counter!(
        INGEST_EVENTS_PARSED_TOTAL,
        "Total number of tech log events parsed successfully"
    );
    describe_counter!(
        INGEST_PARSE_ERRORS_TOTAL,
        "Total number of tech log events dropped because they failed to parse"
    );
    describe_gauge!(
        INGEST_QUEUE_DEPTH,
        "Current number of raw submissions waiting in the parse stage"
    );

    describe_counter!(
        STORAGE_BATCHES_WRITTEN_TOTAL,
        "Total number of event batches written to storage"
    );
    describe_counter!(
        STORAGE_BATCH_FAILURES_TOTAL,
        "Total number of event batches dropped after a failed bulk insert"
    );
    describe_counter!(
        STORAGE_EVENTS_WRITTEN_TOTAL,
        "Total number of events written to storage"
    );
    describe_histogram!(
        STORAGE_BULK_INSERT_DURATION_SECONDS,
        "Bulk insert latency in seconds"
    );

    describe_gauge!(SERVER_CONNECTED_AGENTS, "Number of connected agents");
    describe_counter!(
        SERVER_PROTOCOL_VIOLATIONS_TOTAL,
        "Connections closed because of a protocol violation"
    );
    describe_gauge!(SERVER_UPTIME_SECONDS, "Server uptime in seconds");

    describe_counter!(
        AGENT_EVENTS_SENT_TOTAL,
        "Total number of tech log events sent by the agent"
    );
    describe_counter!(
        AGENT_RECONNECTS_TOTAL,
        "Total number of agent reconnect attempts"
    );
}
