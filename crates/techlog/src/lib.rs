#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//!
//! - [`reader`]: 재개 가능한 증분 이벤트 리더 (바이트 단위 경계 판정)
//! - [`parser`]: 기술 로그 줄 파서 (따옴표 이스케이프, 중복 키 보존, UTC 보정)
//! - [`event`]: 저장소 행으로 변환된 이벤트와 파생 컬럼
//! - [`batch`]: 크기/타이머 기반 배치 누적기
//! - [`pipeline`]: parse -> batch -> sink 인제스천 파이프라인 (Pipeline trait 구현)
//! - [`storage`]: 저장소 trait과 인메모리/ClickHouse 구현
//! - [`error`]: 도메인 에러 타입

pub mod batch;
pub mod error;
pub mod event;
pub mod parser;
pub mod pipeline;
pub mod reader;
pub mod storage;

// --- 주요 타입 re-export ---

// 리더/파서
pub use parser::{LineParser, ParsedLine};
pub use reader::EventReader;

// 이벤트
pub use event::ParsedEvent;

// 파이프라인
pub use pipeline::{IngestHandle, IngestionPipeline, IngestionPipelineBuilder, PipelineStats};

// 저장소
pub use storage::{ClickHouseStorage, MemoryStorage, StorageBackend, TechLogStorage};

// 에러
pub use error::TechLogError;
