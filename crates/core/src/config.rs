//! 설정 관리 -- onecmon.toml 파싱 및 런타임 설정
//!
//! [`OnecmonConfig`]는 에이전트와 서버 양쪽의 설정을 담는 최상위 구조체입니다.
//! 각 바이너리는 자기에게 필요한 섹션만 읽어 사용합니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`ONECMON_AGENT_SERVER_HOST=10.0.0.5` 형식)
//! 3. 설정 파일 (`onecmon.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), onecmon_core::error::OnecmonError> {
//! use onecmon_core::config::OnecmonConfig;
//!
//! let config = OnecmonConfig::load("onecmon.toml").await?;
//! let config = OnecmonConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, OnecmonError};

/// onecmon 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnecmonConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 에이전트 설정
    #[serde(default)]
    pub agent: AgentConfig,
    /// 서버 설정
    #[serde(default)]
    pub server: ServerConfig,
    /// 인제스천 파이프라인 설정
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// 스토리지 설정
    #[serde(default)]
    pub storage: StorageConfig,
    /// Prometheus 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl OnecmonConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, OnecmonError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, OnecmonError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OnecmonError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                OnecmonError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, OnecmonError> {
        toml::from_str(toml_str).map_err(|e| {
            OnecmonError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `ONECMON_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "ONECMON_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "ONECMON_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.data_dir, "ONECMON_GENERAL_DATA_DIR");
        override_string(&mut self.general.pid_file, "ONECMON_GENERAL_PID_FILE");

        // Agent
        override_string(&mut self.agent.server_host, "ONECMON_AGENT_SERVER_HOST");
        override_u16(&mut self.agent.server_port, "ONECMON_AGENT_SERVER_PORT");
        override_string(
            &mut self.agent.instance_name,
            "ONECMON_AGENT_INSTANCE_NAME",
        );
        override_string(&mut self.agent.log_folder, "ONECMON_AGENT_LOG_FOLDER");
        override_string(&mut self.agent.logcfg_path, "ONECMON_AGENT_LOGCFG_PATH");
        override_u64(
            &mut self.agent.connect_timeout_secs,
            "ONECMON_AGENT_CONNECT_TIMEOUT_SECS",
        );
        override_u64(
            &mut self.agent.reconnect_delay_ms,
            "ONECMON_AGENT_RECONNECT_DELAY_MS",
        );
        override_usize(
            &mut self.agent.queue_capacity,
            "ONECMON_AGENT_QUEUE_CAPACITY",
        );
        override_u64(
            &mut self.agent.position_cache_ttl_secs,
            "ONECMON_AGENT_POSITION_CACHE_TTL_SECS",
        );
        override_u64(
            &mut self.agent.seance_poll_interval_ms,
            "ONECMON_AGENT_SEANCE_POLL_INTERVAL_MS",
        );
        override_usize(
            &mut self.agent.watch_channel_capacity,
            "ONECMON_AGENT_WATCH_CHANNEL_CAPACITY",
        );

        // Server
        override_string(&mut self.server.bind_addr, "ONECMON_SERVER_BIND_ADDR");
        override_usize(
            &mut self.server.max_connections,
            "ONECMON_SERVER_MAX_CONNECTIONS",
        );
        override_usize(
            &mut self.server.queue_capacity,
            "ONECMON_SERVER_QUEUE_CAPACITY",
        );
        override_string(&mut self.server.seances_path, "ONECMON_SERVER_SEANCES_PATH");
        override_u64(
            &mut self.server.seances_reload_secs,
            "ONECMON_SERVER_SEANCES_RELOAD_SECS",
        );

        // Pipeline
        override_usize(
            &mut self.pipeline.parse_workers,
            "ONECMON_PIPELINE_PARSE_WORKERS",
        );
        override_usize(&mut self.pipeline.batch_size, "ONECMON_PIPELINE_BATCH_SIZE");
        override_u64(
            &mut self.pipeline.flush_interval_ms,
            "ONECMON_PIPELINE_FLUSH_INTERVAL_MS",
        );
        override_usize(
            &mut self.pipeline.channel_capacity,
            "ONECMON_PIPELINE_CHANNEL_CAPACITY",
        );

        // Storage
        override_string(&mut self.storage.backend, "ONECMON_STORAGE_BACKEND");
        override_string(&mut self.storage.url, "ONECMON_STORAGE_URL");
        override_string(&mut self.storage.database, "ONECMON_STORAGE_DATABASE");
        override_string(&mut self.storage.user, "ONECMON_STORAGE_USER");
        override_string(&mut self.storage.password, "ONECMON_STORAGE_PASSWORD");
        override_u64(
            &mut self.storage.request_timeout_secs,
            "ONECMON_STORAGE_REQUEST_TIMEOUT_SECS",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "ONECMON_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "ONECMON_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "ONECMON_METRICS_PORT");
        override_string(&mut self.metrics.endpoint, "ONECMON_METRICS_ENDPOINT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), OnecmonError> {
        const MAX_BATCH_SIZE: usize = 1_000_000;
        const MAX_CHANNEL_CAPACITY: usize = 10_000_000;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.agent.log_folder.is_empty() {
            return Err(invalid("agent.log_folder", "must not be empty".to_owned()));
        }

        if self.agent.queue_capacity == 0 {
            return Err(invalid(
                "agent.queue_capacity",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.agent.connect_timeout_secs == 0 {
            return Err(invalid(
                "agent.connect_timeout_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.agent.watch_channel_capacity == 0 {
            return Err(invalid(
                "agent.watch_channel_capacity",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.agent.seance_poll_interval_ms == 0 {
            return Err(invalid(
                "agent.seance_poll_interval_ms",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(invalid(
                "server.max_connections",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.server.queue_capacity == 0 {
            return Err(invalid(
                "server.queue_capacity",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.pipeline.batch_size == 0 || self.pipeline.batch_size > MAX_BATCH_SIZE {
            return Err(invalid(
                "pipeline.batch_size",
                format!("must be 1-{MAX_BATCH_SIZE}"),
            ));
        }

        if self.pipeline.flush_interval_ms == 0 {
            return Err(invalid(
                "pipeline.flush_interval_ms",
                "must be greater than 0".to_owned(),
            ));
        }

        if self.pipeline.channel_capacity == 0
            || self.pipeline.channel_capacity > MAX_CHANNEL_CAPACITY
        {
            return Err(invalid(
                "pipeline.channel_capacity",
                format!("must be 1-{MAX_CHANNEL_CAPACITY}"),
            ));
        }

        let valid_backends = ["memory", "clickhouse"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(invalid(
                "storage.backend",
                format!("must be one of: {}", valid_backends.join(", ")),
            ));
        }

        if self.storage.backend == "clickhouse" && self.storage.url.is_empty() {
            return Err(invalid(
                "storage.url",
                "url must not be empty when backend is clickhouse".to_owned(),
            ));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(invalid(
                "metrics.port",
                "must be greater than 0 when metrics are enabled".to_owned(),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> OnecmonError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// 데이터 디렉토리 (agent.json, seances.json 저장 위치)
    pub data_dir: String,
    /// PID 파일 경로 (빈 문자열이면 기록하지 않음)
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            data_dir: "/var/lib/onecmon".to_owned(),
            pid_file: String::new(),
        }
    }
}

/// 에이전트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// 서버 호스트명 또는 IP
    pub server_host: String,
    /// 서버 포트
    pub server_port: u16,
    /// 인스턴스 이름 (빈 문자열이면 호스트명 사용)
    pub instance_name: String,
    /// 기술 로그 루트 디렉토리
    pub log_folder: String,
    /// logcfg.xml 경로
    pub logcfg_path: String,
    /// TCP 연결 타임아웃 (초)
    pub connect_timeout_secs: u64,
    /// 재연결 대기 (밀리초)
    pub reconnect_delay_ms: u64,
    /// 송신/수신 큐 용량
    pub queue_capacity: usize,
    /// 파일 위치 캐시 TTL (초)
    pub position_cache_ttl_secs: u64,
    /// 세앙스 상태 점검 주기 (밀리초)
    pub seance_poll_interval_ms: u64,
    /// 파일 감시 이벤트 채널 용량
    pub watch_channel_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_owned(),
            server_port: 7090,
            instance_name: String::new(),
            log_folder: "/var/log/onecmon/techlog".to_owned(),
            logcfg_path: "/opt/1cv8/conf/logcfg.xml".to_owned(),
            connect_timeout_secs: 10,
            reconnect_delay_ms: 1000,
            queue_capacity: 1000,
            position_cache_ttl_secs: 3600,
            seance_poll_interval_ms: 1000,
            watch_channel_capacity: 1024,
        }
    }
}

/// 서버 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 바인드 주소
    pub bind_addr: String,
    /// 최대 동시 에이전트 연결 수
    pub max_connections: usize,
    /// 연결당 송신/수신 큐 용량
    pub queue_capacity: usize,
    /// 세앙스 카탈로그 TOML 경로 (빈 문자열이면 빈 카탈로그)
    pub seances_path: String,
    /// 세앙스 카탈로그 리로드 주기 (초)
    pub seances_reload_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7090".to_owned(),
            max_connections: 256,
            queue_capacity: 1000,
            seances_path: String::new(),
            seances_reload_secs: 10,
        }
    }
}

/// 인제스천 파이프라인 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 파싱 워커 수 (0이면 사용 가능한 코어 수)
    pub parse_workers: usize,
    /// 배치 크기
    pub batch_size: usize,
    /// 배치 플러시 간격 (밀리초)
    pub flush_interval_ms: u64,
    /// 단계 간 채널 용량
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parse_workers: 0,
            batch_size: 5000,
            flush_interval_ms: 1000,
            channel_capacity: 10_000,
        }
    }
}

/// 스토리지 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 백엔드 (memory, clickhouse)
    pub backend: String,
    /// ClickHouse HTTP 인터페이스 URL
    pub url: String,
    /// 데이터베이스 이름
    pub database: String,
    /// 사용자
    pub user: String,
    /// 비밀번호
    pub password: String,
    /// HTTP 요청 타임아웃 (초)
    pub request_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_owned(),
            url: "http://localhost:8123".to_owned(),
            database: "onecmon".to_owned(),
            user: "default".to_owned(),
            password: String::new(),
            request_timeout_secs: 30,
        }
    }
}

/// Prometheus 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 리스닝 주소
    pub listen_addr: String,
    /// 포트
    pub port: u16,
    /// 엔드포인트 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    override_parsed(target, env_key, "bool");
}

fn override_usize(target: &mut usize, env_key: &str) {
    override_parsed(target, env_key, "usize");
}

fn override_u16(target: &mut u16, env_key: &str) {
    override_parsed(target, env_key, "u16");
}

fn override_u64(target: &mut u64, env_key: &str) {
    override_parsed(target, env_key, "u64");
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str, type_name: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                type_name,
                "failed to parse env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = OnecmonConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.agent.connect_timeout_secs, 10);
        assert_eq!(config.agent.queue_capacity, 1000);
        assert_eq!(config.agent.position_cache_ttl_secs, 3600);
        assert_eq!(config.pipeline.batch_size, 5000);
        assert_eq!(config.pipeline.flush_interval_ms, 1000);
        assert_eq!(config.pipeline.channel_capacity, 10_000);
        assert_eq!(config.storage.backend, "memory");
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn default_config_passes_validation() {
        OnecmonConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = OnecmonConfig::parse("").unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:7090");
        assert_eq!(config.agent.server_port, 7090);
    }

    #[test]
    fn partial_toml_merges_with_defaults() {
        let toml = r#"
[agent]
server_host = "collector.local"
log_folder = "/srv/techlog"

[pipeline]
batch_size = 100
"#;
        let config = OnecmonConfig::parse(toml).unwrap();
        assert_eq!(config.agent.server_host, "collector.local");
        assert_eq!(config.agent.log_folder, "/srv/techlog");
        assert_eq!(config.agent.server_port, 7090);
        assert_eq!(config.pipeline.batch_size, 100);
        assert_eq!(config.pipeline.channel_capacity, 10_000);
    }

    #[test]
    fn invalid_toml_returns_parse_error() {
        let err = OnecmonConfig::parse("agent = [[[").unwrap_err();
        assert!(matches!(
            err,
            OnecmonError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = OnecmonConfig::default();
        config.general.log_level = "verbose".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let mut config = OnecmonConfig::default();
        config.pipeline.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn validate_rejects_zero_flush_interval() {
        let mut config = OnecmonConfig::default();
        config.pipeline.flush_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_log_folder() {
        let mut config = OnecmonConfig::default();
        config.agent.log_folder.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_folder"));
    }

    #[test]
    fn validate_rejects_unknown_backend() {
        let mut config = OnecmonConfig::default();
        config.storage.backend = "postgres".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage.backend"));
    }

    #[test]
    fn validate_rejects_clickhouse_without_url() {
        let mut config = OnecmonConfig::default();
        config.storage.backend = "clickhouse".to_owned();
        config.storage.url.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage.url"));
    }

    #[test]
    fn env_override_string() {
        let mut val = "original".to_owned();
        // SAFETY: 테스트는 단일 스레드에서 실행되므로 환경변수 조작이 안전합니다.
        unsafe { std::env::set_var("TEST_ONECMON_STR", "overridden") };
        override_string(&mut val, "TEST_ONECMON_STR");
        assert_eq!(val, "overridden");
        unsafe { std::env::remove_var("TEST_ONECMON_STR") };
    }

    #[test]
    fn env_override_u16_invalid_keeps_original() {
        let mut val = 7090u16;
        // SAFETY: 테스트는 단일 스레드에서 실행되므로 환경변수 조작이 안전합니다.
        unsafe { std::env::set_var("TEST_ONECMON_PORT_BAD", "99999") };
        override_u16(&mut val, "TEST_ONECMON_PORT_BAD");
        assert_eq!(val, 7090);
        unsafe { std::env::remove_var("TEST_ONECMON_PORT_BAD") };
    }

    #[test]
    fn env_override_bool_valid() {
        let mut val = false;
        // SAFETY: 테스트는 단일 스레드에서 실행되므로 환경변수 조작이 안전합니다.
        unsafe { std::env::set_var("TEST_ONECMON_BOOL", "true") };
        override_bool(&mut val, "TEST_ONECMON_BOOL");
        assert!(val);
        unsafe { std::env::remove_var("TEST_ONECMON_BOOL") };
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = 42usize;
        override_usize(&mut val, "TEST_ONECMON_NONEXISTENT_12345");
        assert_eq!(val, 42);
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = OnecmonConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = OnecmonConfig::parse(&toml_str).unwrap();
        assert_eq!(config.agent.log_folder, parsed.agent.log_folder);
        assert_eq!(config.pipeline.batch_size, parsed.pipeline.batch_size);
        assert_eq!(config.storage.url, parsed.storage.url);
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let err = OnecmonConfig::from_file("/nonexistent/path/onecmon.toml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OnecmonError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
