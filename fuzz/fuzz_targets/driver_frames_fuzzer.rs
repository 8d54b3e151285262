//! Fuzz target for the worker driver under hostile clients
//!
//! # Strategy
//!
//! - Connections opened and closed in arbitrary order
//! - Raw frames with arbitrary opcodes and payloads
//! - Well-formed Hello / Submit interleaved with garbage
//! - Append and replay completions with arbitrary outcomes
//!
//! # Invariants
//!
//! - The driver NEVER panics
//! - The first frame a session receives is `Welcome` or `Error`
//! - An `Ack` only ever echoes a request id the session submitted

#![no_main]

use std::collections::{HashMap, HashSet};

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use skein_proto::{ChatMessage, Frame, FrameHeader, Hello, Opcode, Payload, Submit};
use skein_server::{DriverConfig, LogError, ServerAction, ServerDriver, ServerEvent, SystemEnv};

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Connect { session: u8 },
    RawFrame { session: u8, opcode: u16, request_id: u32, payload: Vec<u8> },
    Hello { session: u8, server_offset: u8, resume: Option<u8> },
    Submit { session: u8, request_id: u32, content: String, token: Option<String> },
    AppendDone { session: u8, request_id: u32, outcome: AppendOutcome },
    ReplayDone { session: u8, first: u8, count: u8, exhausted: bool },
    ReplayFailed { session: u8 },
    Close { session: u8 },
    Tick,
}

#[derive(Debug, Clone, Arbitrary)]
enum AppendOutcome {
    Stored(u8),
    Duplicate,
    Unavailable,
}

fn session_id(raw: u8) -> u64 {
    u64::from(raw % 8) + 1
}

fn frame(payload: Payload, request_id: u32) -> Option<Frame> {
    payload.into_frame(request_id).ok()
}

fuzz_target!(|ops: Vec<Op>| {
    let config = DriverConfig { max_connections: 6, ..DriverConfig::default() };
    let mut driver = ServerDriver::new(SystemEnv::new(), config);

    let mut received_any: HashSet<u64> = HashSet::new();
    let mut submitted: HashMap<u64, HashSet<u32>> = HashMap::new();

    for op in ops {
        let event = match op {
            Op::Connect { session } => ServerEvent::ConnectionAccepted { session_id: session_id(session) },
            Op::RawFrame { session, opcode, request_id, payload } => {
                let mut header = FrameHeader::new(Opcode::Notice);
                let mut raw = header.to_bytes();
                raw[6..8].copy_from_slice(&opcode.to_be_bytes());
                if let Ok(parsed) = FrameHeader::from_bytes(&raw) {
                    header = *parsed;
                }
                header.set_request_id(request_id);
                if opcode == Opcode::Submit.to_u16() {
                    submitted.entry(session_id(session)).or_default().insert(request_id);
                }
                ServerEvent::FrameReceived {
                    session_id: session_id(session),
                    frame: Frame::new(header, Bytes::from(payload)),
                }
            },
            Op::Hello { session, server_offset, resume } => {
                let hello = Hello {
                    server_offset: u64::from(server_offset),
                    resume_session: resume.map(session_id),
                };
                let Some(frame) = frame(Payload::Hello(hello), 0) else { continue };
                ServerEvent::FrameReceived { session_id: session_id(session), frame }
            },
            Op::Submit { session, request_id, content, token } => {
                let submit = Submit { content, dedup_token: token };
                let Some(frame) = frame(Payload::Submit(submit), request_id) else { continue };
                submitted.entry(session_id(session)).or_default().insert(request_id);
                ServerEvent::FrameReceived { session_id: session_id(session), frame }
            },
            Op::AppendDone { session, request_id, outcome } => ServerEvent::AppendCompleted {
                session_id: session_id(session),
                request_id,
                content: "fuzz".to_string(),
                result: match outcome {
                    AppendOutcome::Stored(offset) => Ok(u64::from(offset) + 1),
                    AppendOutcome::Duplicate => Err(LogError::Duplicate { token: "t".into(), offset: None }),
                    AppendOutcome::Unavailable => Err(LogError::Unavailable("fuzz".into())),
                },
            },
            Op::ReplayDone { session, first, count, exhausted } => ServerEvent::ReplayPage {
                session_id: session_id(session),
                messages: (0..u64::from(count % 16))
                    .map(|i| ChatMessage { content: format!("r{i}"), offset: u64::from(first) + i + 1 })
                    .collect(),
                exhausted,
            },
            Op::ReplayFailed { session } => {
                ServerEvent::ReplayFailed { session_id: session_id(session), reason: "fuzz".into() }
            },
            Op::Close { session } => {
                ServerEvent::ConnectionClosed { session_id: session_id(session), reason: "fuzz".into() }
            },
            Op::Tick => ServerEvent::Tick,
        };

        let accepted = match &event {
            ServerEvent::ConnectionAccepted { session_id } => Some(*session_id),
            _ => None,
        };
        let Ok(actions) = driver.process_event(event) else { continue };
        if let Some(id) = accepted {
            received_any.remove(&id);
            submitted.remove(&id);
        }

        for action in actions {
            let ServerAction::SendToSession { session_id, frame } = action else { continue };
            let opcode = frame.header.opcode_enum();

            if received_any.insert(session_id) {
                assert!(
                    matches!(opcode, Some(Opcode::Welcome | Opcode::Error)),
                    "session {session_id} first got {opcode:?}"
                );
            }
            if opcode == Some(Opcode::Ack) {
                let id = frame.header.request_id();
                assert!(
                    submitted.get(&session_id).is_some_and(|ids| ids.contains(&id)),
                    "ack for request {id} never submitted on session {session_id}"
                );
            }
        }
    }
});
