//! Fuzz target for frame header boundary conditions
//!
//! # Strategy
//!
//! - Magic bytes: valid, off-by-one, all-zeros, all-ones, random
//! - Payload size: zero, small, at-max, just-over-max, `u32::MAX`
//! - Version: valid, zero, max, random
//! - Trailing data: shorter than, equal to, or longer than the claimed size
//!
//! # Invariants
//!
//! - `payload_size > MAX_PAYLOAD_SIZE` MUST return `PayloadTooLarge`
//! - Invalid magic MUST return `InvalidMagic`
//! - Fewer payload bytes than claimed MUST return `FrameTruncated`
//! - A decoded frame re-encodes to exactly `16 + payload_size` bytes

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use skein_proto::{Frame, FrameHeader, ProtocolError};

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryFrame {
    magic: MagicBytes,
    version: VersionBytes,
    opcode: u16,
    request_id: u32,
    payload_size: PayloadSize,
    available: u16,
}

#[derive(Debug, Clone, Arbitrary)]
enum MagicBytes {
    Valid,
    OffByOne(u8),
    AllZeros,
    AllOnes,
    Random([u8; 4]),
}

#[derive(Debug, Clone, Arbitrary)]
enum VersionBytes {
    Valid,
    Zero,
    Max,
    Random(u8),
}

#[derive(Debug, Clone, Arbitrary)]
enum PayloadSize {
    Zero,
    Small(u8),
    AtMax,
    JustOverMax,
    Max,
}

impl MagicBytes {
    fn bytes(&self) -> [u8; 4] {
        let valid = FrameHeader::MAGIC.to_be_bytes();
        match self {
            Self::Valid => valid,
            Self::OffByOne(index) => {
                let mut bytes = valid;
                let i = (*index % 4) as usize;
                bytes[i] = bytes[i].wrapping_add(1);
                bytes
            },
            Self::AllZeros => [0; 4],
            Self::AllOnes => [0xFF; 4],
            Self::Random(bytes) => *bytes,
        }
    }
}

impl VersionBytes {
    fn byte(&self) -> u8 {
        match self {
            Self::Valid => FrameHeader::VERSION,
            Self::Zero => 0,
            Self::Max => u8::MAX,
            Self::Random(v) => *v,
        }
    }
}

impl PayloadSize {
    fn value(&self) -> u32 {
        match self {
            Self::Zero => 0,
            Self::Small(n) => u32::from(*n),
            Self::AtMax => FrameHeader::MAX_PAYLOAD_SIZE,
            Self::JustOverMax => FrameHeader::MAX_PAYLOAD_SIZE + 1,
            Self::Max => u32::MAX,
        }
    }
}

fuzz_target!(|input: BoundaryFrame| {
    let magic = input.magic.bytes();
    let version = input.version.byte();
    let payload_size = input.payload_size.value();

    let mut bytes = Vec::with_capacity(FrameHeader::SIZE + input.available as usize);
    bytes.extend_from_slice(&magic);
    bytes.push(version);
    bytes.push(0);
    bytes.extend_from_slice(&input.opcode.to_be_bytes());
    bytes.extend_from_slice(&input.request_id.to_be_bytes());
    bytes.extend_from_slice(&payload_size.to_be_bytes());
    bytes.resize(FrameHeader::SIZE + input.available as usize, 0xAB);

    let result = Frame::decode(&bytes);

    if magic != FrameHeader::MAGIC.to_be_bytes() {
        assert_eq!(result, Err(ProtocolError::InvalidMagic));
        return;
    }
    if version != FrameHeader::VERSION {
        assert_eq!(result, Err(ProtocolError::UnsupportedVersion(version)));
        return;
    }
    if payload_size > FrameHeader::MAX_PAYLOAD_SIZE {
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
        return;
    }
    if u32::from(input.available) < payload_size {
        assert!(matches!(result, Err(ProtocolError::FrameTruncated { .. })));
        return;
    }

    let frame = result.expect("well-formed header with enough payload must decode");
    assert_eq!(frame.header.request_id(), input.request_id);
    assert_eq!(frame.header.opcode(), input.opcode);
    let encoded = frame.to_vec().expect("decoded frame must re-encode");
    assert_eq!(encoded.len(), FrameHeader::SIZE + payload_size as usize);
});
