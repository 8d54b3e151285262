//! Fuzz target for Frame::decode
//!
//! Arbitrary bytes through the header and frame parser. Looks for:
//! - Parser crashes or panics
//! - Integer overflows in size calculations
//! - Buffer over-reads
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skein_proto::{Frame, FrameHeader};

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        // A decoded frame never claims more payload than it carries.
        assert_eq!(frame.payload.len(), frame.header.payload_size() as usize);
        assert!(data.len() >= FrameHeader::SIZE + frame.payload.len());
    }
});
