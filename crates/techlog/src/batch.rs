//! 배치 누적기 -- 파싱된 이벤트를 벌크 쓰기 단위로 모읍니다.
//!
//! [`BatchBuffer`]는 배치 크기에 도달하거나 외부 타이머가 플러시를 요청하면
//! 모인 이벤트를 한 번에 내어 줍니다. 크기 조건과 타이머 조건 모두 [`take`](BatchBuffer::take)를
//! 통해 같은 경로로 배출됩니다.

use crate::event::ParsedEvent;

/// 인메모리 배치 버퍼
pub struct BatchBuffer {
    items: Vec<ParsedEvent>,
    batch_size: usize,
    /// 총 유입 이벤트 수
    total_received: u64,
    /// 배출된 배치 수
    batches_taken: u64,
}

impl BatchBuffer {
    /// 새 배치 버퍼를 생성합니다.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            items: Vec::with_capacity(batch_size.min(10_000)),
            batch_size,
            total_received: 0,
            batches_taken: 0,
        }
    }

    /// 이벤트를 추가합니다. 배치 크기에 도달하면 `true`를 반환합니다.
    pub fn push(&mut self, event: ParsedEvent) -> bool {
        self.total_received += 1;
        self.items.push(event);
        self.is_full()
    }

    /// 배치 크기에 도달했는지 확인합니다.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.batch_size
    }

    /// 모인 이벤트를 모두 꺼냅니다. 비어 있으면 `None`입니다.
    pub fn take(&mut self) -> Option<Vec<ParsedEvent>> {
        if self.items.is_empty() {
            return None;
        }
        self.batches_taken += 1;
        let next = Vec::with_capacity(self.batch_size.min(10_000));
        Some(std::mem::replace(&mut self.items, next))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn batches_taken(&self) -> u64 {
        self.batches_taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::LineParser;
    use onecmon_core::types::{AgentInstance, TechLogEventContent};
    use uuid::Uuid;

    fn make_event(n: i64) -> ParsedEvent {
        let content = TechLogEventContent {
            seance_id: Uuid::nil(),
            template_id: Uuid::nil(),
            folder: "rphost_1".to_owned(),
            file: "23011512".to_owned(),
            content: format!("2023-01-15 12:12:34.{n:06}-1,CONN,0"),
            end_position: n,
        };
        LineParser::new()
            .parse(&AgentInstance::default(), &content)
            .unwrap()
    }

    #[test]
    fn push_reports_full_at_batch_size() {
        let mut buf = BatchBuffer::new(3);
        assert!(!buf.push(make_event(1)));
        assert!(!buf.push(make_event(2)));
        assert!(buf.push(make_event(3)));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn take_drains_everything() {
        let mut buf = BatchBuffer::new(10);
        for i in 0..4 {
            buf.push(make_event(i));
        }
        let batch = buf.take().unwrap();
        assert_eq!(batch.len(), 4);
        assert!(buf.is_empty());
        assert_eq!(buf.batches_taken(), 1);
        assert_eq!(buf.total_received(), 4);
    }

    #[test]
    fn take_on_empty_is_none() {
        let mut buf = BatchBuffer::new(10);
        assert!(buf.take().is_none());
        assert_eq!(buf.batches_taken(), 0);
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let mut buf = BatchBuffer::new(0);
        assert_eq!(buf.batch_size(), 1);
        assert!(buf.push(make_event(1)));
    }

    #[test]
    fn preserves_arrival_order() {
        let mut buf = BatchBuffer::new(10);
        for i in 1..=3 {
            buf.push(make_event(i));
        }
        let positions: Vec<i64> = buf.take().unwrap().iter().map(|e| e.end_position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }
}
