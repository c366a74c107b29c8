//! 이벤트 저장소 -- 벌크 싱크와 위치 조회
//!
//! [`TechLogStorage`]는 인제스천 파이프라인의 싱크 단계와 서버의 위치 조회가
//! 사용하는 저장소 능력입니다.
//!
//! # 구현
//! - [`MemoryStorage`]: 프로세스 내 저장소 (테스트, `backend = "memory"`)
//! - [`ClickHouseStorage`]: ClickHouse HTTP 인터페이스 (`backend = "clickhouse"`)
//!
//! 설정에 따라 런타임에 구현을 고르는 경우 [`StorageBackend`]를 사용합니다.

pub mod clickhouse;
pub mod memory;

pub use clickhouse::ClickHouseStorage;
pub use memory::MemoryStorage;

use std::future::Future;

use uuid::Uuid;

use onecmon_core::config::StorageConfig;
use onecmon_core::types::FileKey;

use crate::error::TechLogError;
use crate::event::ParsedEvent;

/// 원시 이벤트 테이블 이름
pub const TECH_LOG_EVENTS_TABLE: &str = "tech_log_events";

/// 기술 로그 이벤트 저장소
pub trait TechLogStorage: Send + Sync + 'static {
    /// 데이터베이스와 테이블을 생성합니다 (이미 있으면 그대로 둡니다).
    fn init_schema(&self) -> impl Future<Output = Result<(), TechLogError>> + Send;

    /// 이벤트 배치를 한 번의 요청으로 저장합니다.
    fn bulk_insert(
        &self,
        events: &[ParsedEvent],
    ) -> impl Future<Output = Result<(), TechLogError>> + Send;

    /// 에이전트와 파일 키에 대해 저장된 마지막 `end_position`을 조회합니다.
    ///
    /// 저장된 이벤트가 없으면 0입니다.
    fn query_last_position(
        &self,
        agent_id: Uuid,
        key: &FileKey,
    ) -> impl Future<Output = Result<i64, TechLogError>> + Send;

    /// 세앙스의 모든 이벤트를 삭제합니다.
    fn delete_seance_data(
        &self,
        seance_id: Uuid,
    ) -> impl Future<Output = Result<(), TechLogError>> + Send;
}

/// 설정으로 선택되는 저장소
pub enum StorageBackend {
    Memory(MemoryStorage),
    ClickHouse(ClickHouseStorage),
}

impl StorageBackend {
    /// `[storage]` 설정으로 저장소를 생성합니다.
    pub fn from_config(config: &StorageConfig) -> Result<Self, TechLogError> {
        match config.backend.as_str() {
            "memory" => Ok(Self::Memory(MemoryStorage::new())),
            "clickhouse" => Ok(Self::ClickHouse(ClickHouseStorage::new(config)?)),
            other => Err(TechLogError::Config {
                field: "storage.backend".to_owned(),
                reason: format!("unknown backend '{other}'"),
            }),
        }
    }

    /// 저장소 종류 이름
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::ClickHouse(_) => "clickhouse",
        }
    }
}

impl TechLogStorage for StorageBackend {
    async fn init_schema(&self) -> Result<(), TechLogError> {
        match self {
            Self::Memory(s) => s.init_schema().await,
            Self::ClickHouse(s) => s.init_schema().await,
        }
    }

    async fn bulk_insert(&self, events: &[ParsedEvent]) -> Result<(), TechLogError> {
        match self {
            Self::Memory(s) => s.bulk_insert(events).await,
            Self::ClickHouse(s) => s.bulk_insert(events).await,
        }
    }

    async fn query_last_position(&self, agent_id: Uuid, key: &FileKey) -> Result<i64, TechLogError> {
        match self {
            Self::Memory(s) => s.query_last_position(agent_id, key).await,
            Self::ClickHouse(s) => s.query_last_position(agent_id, key).await,
        }
    }

    async fn delete_seance_data(&self, seance_id: Uuid) -> Result<(), TechLogError> {
        match self {
            Self::Memory(s) => s.delete_seance_data(seance_id).await,
            Self::ClickHouse(s) => s.delete_seance_data(seance_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_from_config() {
        let config = StorageConfig::default();
        let backend = StorageBackend::from_config(&config).unwrap();
        assert_eq!(backend.name(), "memory");

        let config = StorageConfig {
            backend: "clickhouse".to_owned(),
            ..StorageConfig::default()
        };
        let backend = StorageBackend::from_config(&config).unwrap();
        assert_eq!(backend.name(), "clickhouse");
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let config = StorageConfig {
            backend: "postgres".to_owned(),
            ..StorageConfig::default()
        };
        assert!(matches!(
            StorageBackend::from_config(&config),
            Err(TechLogError::Config { .. })
        ));
    }
}
