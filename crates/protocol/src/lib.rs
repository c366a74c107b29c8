#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//!
//! - [`header`]: 21바이트 메시지 헤더와 메시지 타입
//! - [`message`]: 메시지 페이로드 코덱과 스트림 프레이밍
//! - [`connection`]: 역할 기반 영속 연결 (재연결, 큐, 호출 상관)
//! - [`error`]: 전송 계층 에러 타입

pub mod connection;
pub mod error;
pub mod header;
pub mod message;

// --- 주요 타입 re-export ---

pub use connection::{Connection, ConnectionConfig, ConnectionState, Role};
pub use error::TransportError;
pub use header::{HEADER_LENGTH, MessageHeader, MessageType};
pub use message::{MAX_PAYLOAD_LENGTH, Message, read_frame, write_frame};
