//! 전송 계층 에러 타입
//!
//! [`TransportError`]는 `From<TransportError> for OnecmonError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 전파할 수 있습니다.

use onecmon_core::error::{OnecmonError, ProtocolError};

/// 전송 계층 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 소켓 I/O 실패
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 호스트 이름을 주소로 해석하지 못함
    #[error("failed to resolve host '{host}'")]
    Resolve { host: String },

    /// 연결 타임아웃
    #[error("connect to {addr} timed out after {timeout_secs}s")]
    ConnectTimeout { addr: String, timeout_secs: u64 },

    /// 헤더의 length 값이 허용 범위를 벗어남
    #[error("invalid frame length {length} (max {max})")]
    InvalidLength { length: i32, max: usize },

    /// 페이로드 인코딩 실패
    #[error("payload encode failed: {0}")]
    Encode(String),

    /// 페이로드 디코딩 실패
    #[error("payload decode failed: {0}")]
    Decode(String),

    /// 세션 상태에서 허용되지 않는 메시지
    #[error("protocol violation: expected {expected}, got {actual}")]
    ProtocolViolation { expected: String, actual: String },

    /// 응답을 기다리는 동안 연결이 끊어짐
    #[error("connection lost before a response arrived")]
    Disconnected,

    /// 연결이 영구적으로 닫힘
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// 연결을 즉시 닫아야 하는 프로토콜 위반인지 확인합니다.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<TransportError> for OnecmonError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(e) => OnecmonError::Io(e),
            TransportError::ProtocolViolation { expected, actual } => {
                OnecmonError::Protocol(ProtocolError::Violation { expected, actual })
            }
            TransportError::Disconnected | TransportError::Closed => {
                OnecmonError::Protocol(ProtocolError::ConnectionClosed)
            }
            other => OnecmonError::Protocol(ProtocolError::Decode(other.to_string())),
        }
    }
}
