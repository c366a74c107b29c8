#![no_main]

use libfuzzer_sys::fuzz_target;
use onecmon_core::types::{
    AgentInstance, LastFilePositionRequest, TechLogEventContent, TechLogSeance,
};
use onecmon_protocol::{HEADER_LENGTH, MessageHeader, MessageType, read_frame};

fuzz_target!(|data: &[u8]| {
    // 헤더는 항상 손실 없이 왕복해야 함
    if let Some(raw) = data.get(..HEADER_LENGTH) {
        let mut buf = [0u8; HEADER_LENGTH];
        buf.copy_from_slice(raw);
        let header = MessageHeader::decode(&buf);
        assert_eq!(header.encode(), buf);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };
    let mut input = data;
    let Ok(message) = runtime.block_on(read_frame(&mut input)) else {
        return;
    };

    match message.message_type() {
        MessageType::AgentInfo => {
            let _ = message.decode::<AgentInstance>();
        }
        MessageType::LastFilePositionRequest => {
            let _ = message.decode::<LastFilePositionRequest>();
        }
        MessageType::LastFilePosition => {
            let _ = message.decode::<i64>();
        }
        MessageType::TechLogSeances => {
            let _ = message.decode::<Vec<TechLogSeance>>();
        }
        MessageType::TechLogEventContent => {
            let _ = message.decode::<TechLogEventContent>();
        }
        _ => {}
    }
});
