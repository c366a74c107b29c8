#![no_main]

use libfuzzer_sys::fuzz_target;
use onecmon_core::types::{AgentInstance, TechLogEventContent};
use onecmon_techlog::LineParser;
use uuid::Uuid;

fuzz_target!(|data: &[u8]| {
    if let Ok(content) = std::str::from_utf8(data) {
        let parser = LineParser::new();
        let _ = parser.parse_line(content);

        // UTC 보정과 시작 시각 계산까지 거치는 전체 경로
        let submission = TechLogEventContent {
            seance_id: Uuid::nil(),
            template_id: Uuid::nil(),
            folder: "rphost_1".to_owned(),
            file: "23011512".to_owned(),
            content: content.to_owned(),
            end_position: 0,
        };
        let _ = parser.parse(&AgentInstance::default(), &submission);
    }
});
