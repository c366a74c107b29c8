//! 파싱된 기술 로그 이벤트
//!
//! [`ParsedEvent`]는 저장소의 한 행에 대응합니다. 속성 맵 외에 저장소가 인덱싱하는
//! 라우팅 컬럼(`session_id`, `call_id`, `t_client_id` 등)을 속성에서 파생해 둡니다.
//! 직렬화 결과는 ClickHouse `JSONEachRow` 한 줄이며 필드 이름이 곧 컬럼 이름입니다.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use onecmon_core::types::{AgentInstance, TechLogEventContent};

use crate::parser::ParsedLine;

/// 저장소 행으로 변환된 이벤트
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedEvent {
    pub id: Uuid,
    /// 이벤트 시작 시각 (`date_time - duration`)
    #[serde(serialize_with = "serialize_datetime64")]
    pub start_date_time: DateTime<Utc>,
    /// 이벤트 기록 시각 (UTC 보정 후)
    #[serde(serialize_with = "serialize_datetime64")]
    pub date_time: DateTime<Utc>,
    /// 지속 시간 (마이크로초)
    pub duration: i64,
    pub event_name: String,
    pub level: i32,

    pub session_id: String,
    pub call_id: String,
    pub t_client_id: i32,
    pub dst_client_id: i32,
    pub usr: String,
    pub t_connect_id: String,
    pub t_computer_name: String,
    pub p_process_name: String,
    pub i_name: String,
    pub m_name: String,
    pub locks: Vec<String>,
    pub wait_connections: Vec<i32>,
    /// 원문의 모든 속성 (중복 키는 `Key1`, `Key2`... 로 보존)
    pub props: BTreeMap<String, String>,

    #[serde(rename = "_agent_id")]
    pub agent_id: Uuid,
    #[serde(rename = "_seance_id")]
    pub seance_id: Uuid,
    #[serde(rename = "_template_id")]
    pub template_id: Uuid,
    #[serde(rename = "_folder")]
    pub folder: String,
    #[serde(rename = "_file")]
    pub file: String,
    #[serde(rename = "_end_position")]
    pub end_position: i64,
}

impl ParsedEvent {
    /// 파싱된 줄과 제출 메타데이터로 이벤트를 조립합니다.
    ///
    /// `start_date_time`은 호출자가 `date_time - duration`으로 범위 검사를 마친 값입니다.
    pub fn assemble(
        line: ParsedLine,
        date_time: DateTime<Utc>,
        start_date_time: DateTime<Utc>,
        agent: &AgentInstance,
        content: &TechLogEventContent,
    ) -> Self {
        let props = line.properties;
        let text = |key: &str| props.get(key).cloned().unwrap_or_default();
        let int = |key: &str| {
            props
                .get(key)
                .and_then(|v| v.trim().parse::<i32>().ok())
                .unwrap_or_default()
        };

        let wait_connections = props
            .get("WaitConnections")
            .map(|v| {
                v.split(',')
                    .filter_map(|item| item.trim().parse::<i32>().ok())
                    .collect()
            })
            .unwrap_or_default();
        let locks = props
            .get("Locks")
            .map(|v| {
                v.split(',')
                    .map(|item| item.trim().to_owned())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: Uuid::new_v4(),
            start_date_time,
            date_time,
            duration: line.duration,
            event_name: line.event_name,
            level: line.level,
            session_id: text("SessionId"),
            call_id: text("CallID"),
            t_client_id: int("t:clientID"),
            dst_client_id: int("DstClientID"),
            usr: text("Usr"),
            t_connect_id: text("t:connectID"),
            t_computer_name: text("t:computerName"),
            p_process_name: text("p:processName"),
            i_name: text("IName"),
            m_name: text("MName"),
            locks,
            wait_connections,
            agent_id: agent.id,
            seance_id: content.seance_id,
            template_id: content.template_id,
            folder: content.folder.clone(),
            file: content.file.clone(),
            end_position: content.end_position,
            props,
        }
    }

    /// 속성 값을 조회합니다.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }
}

/// `DateTime64(6, 'UTC')` 입력 형식 (`2023-01-15 09:12:34.100000`)
pub const DATETIME64_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn serialize_datetime64<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&value.format(DATETIME64_FORMAT))
}
