//! 고정 21바이트 메시지 헤더
//!
//! ```text
//! 0        1                5                                21
//! +--------+----------------+--------------------------------+
//! |  type  | length (i32 LE)|        callId (16 bytes)       |
//! +--------+----------------+--------------------------------+
//! ```
//!
//! `length`는 뒤따르는 페이로드의 정확한 바이트 수입니다. 0이면 본문 바이트가 없습니다.
//! `callId`가 모두 0이면 요청/응답 상관이 없는 일방향 메시지입니다.

use std::fmt;

use uuid::Uuid;

/// 헤더 길이 (바이트)
pub const HEADER_LENGTH: usize = 21;

/// 메시지 타입
///
/// 숫자 값은 호환성을 위해 고정되어 있습니다. 알 수 없는 값은 [`MessageType::Unknown`]으로
/// 보존되어 그대로 다시 인코딩됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    AgentInfo,
    SubscribeForCommands,
    LastFilePositionRequest,
    LastFilePosition,
    TechLogSeancesRequest,
    TechLogSeances,
    TechLogEventContent,
    Unknown(u8),
}

impl MessageType {
    /// 메트릭 레이블과 로그에 쓰이는 이름을 반환합니다.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentInfo => "AgentInfo",
            Self::SubscribeForCommands => "SubscribeForCommands",
            Self::LastFilePositionRequest => "LastFilePositionRequest",
            Self::LastFilePosition => "LastFilePosition",
            Self::TechLogSeancesRequest => "TechLogSeancesRequest",
            Self::TechLogSeances => "TechLogSeances",
            Self::TechLogEventContent => "TechLogEventContent",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::AgentInfo,
            1 => Self::SubscribeForCommands,
            2 => Self::LastFilePositionRequest,
            3 => Self::LastFilePosition,
            4 => Self::TechLogSeancesRequest,
            5 => Self::TechLogSeances,
            6 => Self::TechLogEventContent,
            other => Self::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::AgentInfo => 0,
            MessageType::SubscribeForCommands => 1,
            MessageType::LastFilePositionRequest => 2,
            MessageType::LastFilePosition => 3,
            MessageType::TechLogSeancesRequest => 4,
            MessageType::TechLogSeances => 5,
            MessageType::TechLogEventContent => 6,
            MessageType::Unknown(other) => other,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(v) => write!(f, "Unknown({v})"),
            known => f.write_str(known.name()),
        }
    }
}

/// 메시지 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub length: i32,
    pub call_id: Uuid,
}

impl MessageHeader {
    /// 새 헤더를 생성합니다.
    pub fn new(message_type: MessageType, length: i32, call_id: Uuid) -> Self {
        Self {
            message_type,
            length,
            call_id,
        }
    }

    /// 일방향(callId = 0) 메시지인지 확인합니다.
    pub fn is_unsolicited(&self) -> bool {
        self.call_id.is_nil()
    }

    /// 헤더를 21바이트 배열로 인코딩합니다.
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[0] = self.message_type.into();
        buf[1..5].copy_from_slice(&self.length.to_le_bytes());
        buf[5..].copy_from_slice(self.call_id.as_bytes());
        buf
    }

    /// 21바이트 배열에서 헤더를 디코딩합니다.
    pub fn decode(buf: &[u8; HEADER_LENGTH]) -> Self {
        let length = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let mut call_id = [0u8; 16];
        call_id.copy_from_slice(&buf[5..]);
        Self {
            message_type: MessageType::from(buf[0]),
            length,
            call_id: Uuid::from_bytes(call_id),
        }
    }
}
