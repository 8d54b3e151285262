//! Fuzz target for Payload::from_frame
//!
//! Arbitrary payload bytes under every opcode:
//! - Malformed CBOR
//! - Type confusion (bytes of one payload under another opcode)
//! - Oversized strings or collections
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use skein_proto::{Frame, FrameHeader, Opcode, Payload};

const OPCODES: [Opcode; 14] = [
    Opcode::Hello,
    Opcode::Welcome,
    Opcode::Notice,
    Opcode::Error,
    Opcode::Submit,
    Opcode::Ack,
    Opcode::ChatMessage,
    Opcode::RecoveryIncomplete,
    Opcode::Register,
    Opcode::AppendRequest,
    Opcode::AppendReply,
    Opcode::ReadRequest,
    Opcode::ReadReply,
    Opcode::Broadcast,
];

fuzz_target!(|data: &[u8]| {
    for opcode in OPCODES {
        let frame = Frame::new(FrameHeader::new(opcode), Bytes::copy_from_slice(data));

        if let Ok(payload) = Payload::from_frame(&frame) {
            // Whatever decodes keeps the opcode it was decoded under and
            // re-encodes without error.
            assert_eq!(payload.opcode(), opcode);
            assert!(payload.into_frame(frame.header.request_id()).is_ok());
        }
    }
});
