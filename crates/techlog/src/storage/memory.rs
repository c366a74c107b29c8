//! 인메모리 저장소

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Mutex;
use uuid::Uuid;

use onecmon_core::types::FileKey;

use super::TechLogStorage;
use crate::error::TechLogError;
use crate::event::ParsedEvent;

/// 프로세스 내 이벤트 저장소
///
/// 벌크 쓰기 횟수를 기록하며, 쓰기 실패를 흉내 낼 수 있습니다.
#[derive(Default)]
pub struct MemoryStorage {
    rows: Mutex<Vec<ParsedEvent>>,
    bulk_writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장된 모든 행의 복사본을 반환합니다.
    pub async fn events(&self) -> Vec<ParsedEvent> {
        self.rows.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    /// 성공한 벌크 쓰기 횟수
    pub fn bulk_writes(&self) -> u64 {
        self.bulk_writes.load(Ordering::Relaxed)
    }

    /// `true`이면 이후의 벌크 쓰기가 실패합니다.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl TechLogStorage for MemoryStorage {
    async fn init_schema(&self) -> Result<(), TechLogError> {
        Ok(())
    }

    async fn bulk_insert(&self, events: &[ParsedEvent]) -> Result<(), TechLogError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(TechLogError::Storage {
                backend: "memory".to_owned(),
                reason: "write rejected".to_owned(),
            });
        }
        self.rows.lock().await.extend_from_slice(events);
        self.bulk_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn query_last_position(&self, agent_id: Uuid, key: &FileKey) -> Result<i64, TechLogError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|e| {
                e.agent_id == agent_id
                    && e.seance_id == key.seance_id
                    && e.template_id == key.template_id
                    && e.folder == key.folder
                    && e.file == key.file
            })
            .map(|e| e.end_position)
            .max()
            .unwrap_or(0))
    }

    async fn delete_seance_data(&self, seance_id: Uuid) -> Result<(), TechLogError> {
        self.rows.lock().await.retain(|e| e.seance_id != seance_id);
        Ok(())
    }
}
