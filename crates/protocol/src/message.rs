//! 메시지 = 헤더 + 페이로드, 그리고 스트림 프레이밍
//!
//! 페이로드는 MessagePack 위치 기반 배열(`rmp_serde::to_vec`)로 인코딩됩니다.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::TransportError;
use crate::header::{HEADER_LENGTH, MessageHeader, MessageType};

/// 단일 프레임 페이로드 최대 크기 (64 MiB)
pub const MAX_PAYLOAD_LENGTH: usize = 64 * 1024 * 1024;

/// 와이어 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Message {
    /// 본문 없는 메시지를 생성합니다.
    pub fn empty(message_type: MessageType, call_id: Uuid) -> Self {
        Self {
            header: MessageHeader::new(message_type, 0, call_id),
            payload: Bytes::new(),
        }
    }

    /// 이미 인코딩된 페이로드로 메시지를 생성합니다.
    ///
    /// 헤더의 `length`는 항상 페이로드 길이와 일치합니다.
    pub fn from_payload(
        message_type: MessageType,
        call_id: Uuid,
        payload: Bytes,
    ) -> Result<Self, TransportError> {
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(TransportError::InvalidLength {
                length: i32::try_from(payload.len()).unwrap_or(i32::MAX),
                max: MAX_PAYLOAD_LENGTH,
            });
        }
        let length = i32::try_from(payload.len()).map_err(|_| TransportError::InvalidLength {
            length: i32::MAX,
            max: MAX_PAYLOAD_LENGTH,
        })?;
        Ok(Self {
            header: MessageHeader::new(message_type, length, call_id),
            payload,
        })
    }

    /// 값을 MessagePack으로 인코딩하여 메시지를 생성합니다.
    pub fn encode<T: Serialize + ?Sized>(
        message_type: MessageType,
        call_id: Uuid,
        value: &T,
    ) -> Result<Self, TransportError> {
        let payload = rmp_serde::to_vec(value)?;
        Self::from_payload(message_type, call_id, Bytes::from(payload))
    }

    /// 일방향(callId = 0) 메시지를 인코딩합니다.
    pub fn unsolicited<T: Serialize + ?Sized>(
        message_type: MessageType,
        value: &T,
    ) -> Result<Self, TransportError> {
        Self::encode(message_type, Uuid::nil(), value)
    }

    /// 이 메시지의 callId를 그대로 사용하는 응답을 인코딩합니다.
    pub fn reply<T: Serialize + ?Sized>(
        &self,
        message_type: MessageType,
        value: &T,
    ) -> Result<Self, TransportError> {
        Self::encode(message_type, self.header.call_id, value)
    }

    /// 페이로드를 지정 타입으로 디코딩합니다.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    pub fn call_id(&self) -> Uuid {
        self.header.call_id
    }
}

/// 스트림에서 프레임 하나를 읽습니다.
///
/// 헤더 21바이트를 정확히 읽은 뒤 `length`가 0보다 크면 그만큼 더 읽습니다.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LENGTH];
    reader.read_exact(&mut buf).await?;
    let header = MessageHeader::decode(&buf);

    let length = usize::try_from(header.length).map_err(|_| TransportError::InvalidLength {
        length: header.length,
        max: MAX_PAYLOAD_LENGTH,
    })?;
    if length > MAX_PAYLOAD_LENGTH {
        return Err(TransportError::InvalidLength {
            length: header.length,
            max: MAX_PAYLOAD_LENGTH,
        });
    }

    let payload = if length > 0 {
        let mut data = vec![0u8; length];
        reader.read_exact(&mut data).await?;
        Bytes::from(data)
    } else {
        Bytes::new()
    };

    Ok(Message { header, payload })
}

/// 프레임 하나를 스트림에 씁니다.
///
/// 헤더와 페이로드를 하나의 버퍼로 합쳐 한 번에 기록하므로
/// 두 메시지의 바이트가 섞이지 않습니다.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(HEADER_LENGTH + message.payload.len());
    frame.extend_from_slice(&message.header.encode());
    frame.extend_from_slice(&message.payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
