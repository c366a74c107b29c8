//! 기술 로그 처리 에러 타입
//!
//! [`TechLogError`]는 리더, 파서, 파이프라인, 저장소에서 발생하는 에러를 표현합니다.
//! `From<TechLogError> for OnecmonError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

use onecmon_core::error::{ConfigError, OnecmonError, PipelineError, StorageError};

/// 기술 로그 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum TechLogError {
    /// 이벤트 원문 파싱 실패
    #[error("parse error at offset {offset}: {reason}")]
    Parse {
        /// 실패 위치 (이벤트 원문 내 바이트 오프셋)
        offset: usize,
        /// 실패 사유
        reason: String,
    },

    /// 파일 이름에서 시각 접두어를 만들 수 없음 (`YYMMDDHH` 형식이 아님)
    #[error("invalid log file name '{file}': expected YYMMDDHH")]
    InvalidFileName {
        /// 문제가 된 파일 이름
        file: String,
    },

    /// 저장소 요청 실패
    #[error("storage error: {backend}: {reason}")]
    Storage {
        /// 저장소 종류 (memory, clickhouse)
        backend: String,
        /// 실패 사유
        reason: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP 클라이언트 에러
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON 직렬화 에러
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TechLogError {
    pub(crate) fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            reason: reason.into(),
        }
    }
}

impl From<TechLogError> for OnecmonError {
    fn from(err: TechLogError) -> Self {
        match err {
            TechLogError::Io(e) => OnecmonError::Io(e),
            TechLogError::Config { field, reason } => {
                OnecmonError::Config(ConfigError::InvalidValue { field, reason })
            }
            TechLogError::Http(e) => OnecmonError::Storage(StorageError::Connection(e.to_string())),
            TechLogError::Storage { .. } => {
                OnecmonError::Storage(StorageError::Query(err.to_string()))
            }
            TechLogError::Channel(reason) => {
                OnecmonError::Pipeline(PipelineError::ChannelSend(reason))
            }
            other => OnecmonError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}
