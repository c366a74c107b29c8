//! 도메인 타입 -- 에이전트와 서버가 공유하는 데이터 구조
//!
//! 와이어 프로토콜 페이로드로 직렬화되는 타입은 모두 필드 순서가 고정된
//! 위치 기반(positional) 스키마입니다. 필드 순서를 바꾸면 호환성이 깨집니다.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 에이전트 식별 정보
///
/// 연결 직후 첫 프레임(`AgentInfo`)으로 전송됩니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    /// 설치 단위로 한 번 생성되는 에이전트 ID
    pub id: Uuid,
    /// 인스턴스 이름 (재연결 시 정정될 수 있음)
    pub instance_name: String,
    /// 에이전트 로컬 시계의 UTC 오프셋 (초)
    pub utc_offset: f64,
}

impl Default for AgentInstance {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            instance_name: String::new(),
            utc_offset: 0.0,
        }
    }
}

impl fmt::Display for AgentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.instance_name, self.id)
    }
}

/// 기술 로그 파일 식별 키
///
/// `<logRoot>/<seanceId>/<templateId>/<folder>/<file>.log` 경로에서 파생됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub seance_id: Uuid,
    pub template_id: Uuid,
    pub folder: String,
    pub file: String,
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.seance_id, self.template_id, self.folder, self.file
        )
    }
}

/// 마지막 확정 파일 위치 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastFilePositionRequest {
    pub seance_id: Uuid,
    pub template_id: Uuid,
    pub folder: String,
    pub file: String,
}

impl From<&FileKey> for LastFilePositionRequest {
    fn from(key: &FileKey) -> Self {
        Self {
            seance_id: key.seance_id,
            template_id: key.template_id,
            folder: key.folder.clone(),
            file: key.file.clone(),
        }
    }
}

impl LastFilePositionRequest {
    /// 요청이 가리키는 파일 키를 반환합니다.
    pub fn key(&self) -> FileKey {
        FileKey {
            seance_id: self.seance_id,
            template_id: self.template_id,
            folder: self.folder.clone(),
            file: self.file.clone(),
        }
    }
}

/// 기술 로그 이벤트 원문 제출 (fire-and-forget)
///
/// `end_position`은 이 이벤트 직후의 파일 바이트 오프셋입니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechLogEventContent {
    pub seance_id: Uuid,
    pub template_id: Uuid,
    pub folder: String,
    pub file: String,
    pub content: String,
    pub end_position: i64,
}

/// 기술 로그 수집 세앙스
///
/// `template`은 `{LOG_PATH}` 자리표시자를 포함한 logcfg.xml 조각입니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechLogSeance {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub template: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_key_display() {
        let key = FileKey {
            seance_id: Uuid::nil(),
            template_id: Uuid::nil(),
            folder: "rphost_1234".to_owned(),
            file: "23011512".to_owned(),
        };
        let s = key.to_string();
        assert!(s.ends_with("/rphost_1234/23011512"));
    }

    #[test]
    fn position_request_key_roundtrip() {
        let key = FileKey {
            seance_id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            folder: "rmngr_42".to_owned(),
            file: "24010100".to_owned(),
        };
        let req = LastFilePositionRequest::from(&key);
        assert_eq!(req.key(), key);
    }

    #[test]
    fn default_agent_has_nil_id() {
        let agent = AgentInstance::default();
        assert!(agent.id.is_nil());
        assert_eq!(agent.utc_offset, 0.0);
    }

    #[test]
    fn seance_json_roundtrip() {
        let seance = TechLogSeance {
            id: Uuid::new_v4(),
            start_time: Utc::now(),
            finish_time: Utc::now(),
            template: "<log location=\"{LOG_PATH}\"/>".to_owned(),
        };
        let json = serde_json::to_string(&seance).unwrap();
        let back: TechLogSeance = serde_json::from_str(&json).unwrap();
        assert_eq!(seance, back);
    }
}
