//! 기술 로그 줄 파서
//!
//! 이벤트 원문 한 건을 구조화된 이벤트로 변환합니다.
//!
//! # 형식
//! ```text
//! <YYYY-MM-DD HH:MM:SS.ffffff>-<duration>,<name>,<level>[,<key>=<value>]...
//! ```
//!
//! - 타임스탬프는 에이전트의 로컬 시각이며 `utc_offset`(초)을 빼서 UTC로 보정합니다.
//! - 값이 `'` 또는 `"`로 시작하면 같은 따옴표로 닫힙니다. 값 안에서 따옴표를 두 번 쓰면
//!   (`''`, `""`) 따옴표 문자 하나로 해석합니다.
//! - 따옴표가 없는 값은 다음 쉼표 또는 줄 끝까지입니다. 빈 값(`key=,`)도 유효합니다.
//! - 같은 키가 반복되면 `Key`, `Key1`, `Key2`... 로 보존합니다.
//!
//! # 사용 예시
//! ```ignore
//! use onecmon_techlog::parser::LineParser;
//!
//! let parser = LineParser::new();
//! let line = parser.parse_line("2023-01-15 12:12:34.100000-500,EXCP,1,Descr='boom'")?;
//! assert_eq!(line.event_name, "EXCP");
//! ```

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, TimeZone, Utc};

use onecmon_core::types::{AgentInstance, TechLogEventContent};

use crate::error::TechLogError;
use crate::event::ParsedEvent;

/// 타임스탬프 길이 (`2023-01-15 12:12:34.100000`)
const TIMESTAMP_LEN: usize = 26;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// 헤더와 속성으로 분해된 이벤트 원문
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    /// 에이전트 로컬 시각 (보정 전)
    pub local_time: NaiveDateTime,
    /// 지속 시간 (마이크로초)
    pub duration: i64,
    pub event_name: String,
    pub level: i32,
    pub properties: BTreeMap<String, String>,
}

/// 기술 로그 줄 파서
///
/// 상태가 없으므로 여러 워커가 공유해도 됩니다.
#[derive(Debug, Clone)]
pub struct LineParser {
    /// 최대 허용 입력 크기 (바이트)
    max_input_size: usize,
}

impl LineParser {
    /// 기본 설정으로 새 파서를 생성합니다.
    pub fn new() -> Self {
        Self {
            max_input_size: 16 * 1024 * 1024,
        }
    }

    /// 최대 입력 크기를 설정합니다.
    pub fn with_max_input_size(mut self, size: usize) -> Self {
        self.max_input_size = size;
        self
    }

    /// 제출된 이벤트 원문을 저장소 행으로 변환합니다.
    pub fn parse(
        &self,
        agent: &AgentInstance,
        content: &TechLogEventContent,
    ) -> Result<ParsedEvent, TechLogError> {
        let line = self.parse_line(&content.content)?;
        let date_time = to_utc(line.local_time, agent.utc_offset)?;
        let start_date_time = date_time
            .checked_sub_signed(chrono::Duration::microseconds(line.duration))
            .ok_or_else(|| {
                TechLogError::parse(
                    TIMESTAMP_LEN + 1,
                    format!("duration {} is out of range", line.duration),
                )
            })?;
        Ok(ParsedEvent::assemble(
            line,
            date_time,
            start_date_time,
            agent,
            content,
        ))
    }

    /// 이벤트 원문 한 건을 헤더와 속성으로 분해합니다.
    pub fn parse_line(&self, content: &str) -> Result<ParsedLine, TechLogError> {
        if content.len() > self.max_input_size {
            return Err(TechLogError::parse(
                0,
                format!(
                    "input too large: {} bytes (max: {})",
                    content.len(),
                    self.max_input_size
                ),
            ));
        }

        let timestamp = content
            .get(..TIMESTAMP_LEN)
            .ok_or_else(|| TechLogError::parse(0, "event is shorter than its timestamp"))?;
        let local_time = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .map_err(|e| TechLogError::parse(0, format!("invalid timestamp: {e}")))?;

        let bytes = content.as_bytes();
        if bytes.get(TIMESTAMP_LEN) != Some(&b'-') {
            return Err(TechLogError::parse(
                TIMESTAMP_LEN,
                "expected '-' after timestamp",
            ));
        }

        let mut cursor = Cursor::new(content, TIMESTAMP_LEN + 1);

        let (offset, raw) = cursor
            .field()
            .ok_or_else(|| TechLogError::parse(cursor.pos, "missing duration"))?;
        let duration = raw
            .parse::<i64>()
            .map_err(|_| TechLogError::parse(offset, format!("invalid duration '{raw}'")))?;

        let (offset, event_name) = cursor
            .field()
            .ok_or_else(|| TechLogError::parse(cursor.pos, "missing event name"))?;
        if event_name.is_empty() {
            return Err(TechLogError::parse(offset, "empty event name"));
        }
        let event_name = event_name.to_owned();

        let (offset, raw) = cursor
            .field()
            .ok_or_else(|| TechLogError::parse(cursor.pos, "missing level"))?;
        let level = raw
            .parse::<i32>()
            .map_err(|_| TechLogError::parse(offset, format!("invalid level '{raw}'")))?;

        let properties = cursor.properties()?;

        Ok(ParsedLine {
            local_time,
            duration,
            event_name,
            level,
            properties,
        })
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

/// 로컬 시각에서 UTC 오프셋(초)을 빼서 UTC 시각으로 변환합니다.
fn to_utc(
    local: NaiveDateTime,
    utc_offset_secs: f64,
) -> Result<chrono::DateTime<Utc>, TechLogError> {
    if !utc_offset_secs.is_finite() {
        return Err(TechLogError::parse(0, "agent utc offset is not finite"));
    }
    let offset = chrono::Duration::microseconds((utc_offset_secs * 1_000_000.0).round() as i64);
    let naive = local
        .checked_sub_signed(offset)
        .ok_or_else(|| TechLogError::parse(0, "timestamp out of range after utc offset"))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// 중복 키를 `Key1`, `Key2`... 로 바꿔 삽입합니다.
fn insert_unique(map: &mut BTreeMap<String, String>, key: &str, value: String) {
    if !map.contains_key(key) {
        map.insert(key.to_owned(), value);
        return;
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{key}{n}");
        if !map.contains_key(&candidate) {
            map.insert(candidate, value);
            return;
        }
        n += 1;
    }
}

/// 이벤트 원문 위를 바이트 단위로 전진하는 커서
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str, pos: usize) -> Self {
        Self { text, pos }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    /// 다음 쉼표(또는 끝)까지의 필드를 반환하고 쉼표 뒤로 이동합니다.
    fn field(&mut self) -> Option<(usize, &'a str)> {
        if self.at_end() {
            return None;
        }
        let start = self.pos;
        let end = self.find_from(start, b',').unwrap_or(self.text.len());
        self.pos = end + 1;
        let text = self.text;
        Some((start, &text[start..end]))
    }

    fn find_from(&self, from: usize, needle: u8) -> Option<usize> {
        self.text.as_bytes()[from..]
            .iter()
            .position(|b| *b == needle)
            .map(|i| i + from)
    }

    fn properties(&mut self) -> Result<BTreeMap<String, String>, TechLogError> {
        let mut map = BTreeMap::new();
        while !self.at_end() {
            let key_start = self.pos;
            let eq = self.find_from(key_start, b'=').ok_or_else(|| {
                TechLogError::parse(key_start, "property without '=' separator")
            })?;
            let text = self.text;
            let key = &text[key_start..eq];
            self.pos = eq + 1;

            let value = match self.text.as_bytes().get(self.pos) {
                Some(&quote @ (b'\'' | b'"')) => self.quoted(quote)?,
                _ => self.unquoted(),
            };
            insert_unique(&mut map, key, value);
        }
        Ok(map)
    }

    fn unquoted(&mut self) -> String {
        let start = self.pos;
        let end = self.find_from(start, b',').unwrap_or(self.text.len());
        self.pos = end + 1;
        self.text[start..end].to_owned()
    }

    fn quoted(&mut self, quote: u8) -> Result<String, TechLogError> {
        let text = self.text;
        let bytes = text.as_bytes();
        let open = self.pos;
        let mut scan = open + 1;

        let close = loop {
            let Some(found) = self.find_from(scan, quote) else {
                return Err(TechLogError::parse(open, "unterminated quoted value"));
            };
            if bytes.get(found + 1) == Some(&quote) {
                scan = found + 2;
                continue;
            }
            break found;
        };

        let raw = &text[open + 1..close];
        let q = char::from(quote);
        let value = if raw.contains(q) {
            raw.replace(&format!("{q}{q}"), &q.to_string())
        } else {
            raw.to_owned()
        };

        self.pos = close + 1;
        match bytes.get(self.pos) {
            None => {}
            Some(b',') => self.pos += 1,
            Some(_) => {
                return Err(TechLogError::parse(
                    self.pos,
                    "expected ',' after quoted value",
                ));
            }
        }
        Ok(value)
    }
}
