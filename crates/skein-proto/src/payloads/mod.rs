//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary, payloads are CBOR. The payload type is
//! implied by the header opcode, so only the inner struct is serialized.
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness). Decoding an encoded payload with its own opcode yields an
//! equal value.

pub mod chat;
pub mod cluster;
pub mod session;

use bytes::BufMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads.
///
/// No variant tag is written to CBOR. The frame header's opcode identifies
/// the payload type, so a frame whose payload does not match its opcode fails
/// to decode instead of being reinterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    // Session
    /// Client handshake
    Hello(session::Hello),
    /// Server greeting
    Welcome(session::Welcome),
    /// Worker-local notice
    Notice(session::Notice),
    /// Error response
    Error(ErrorPayload),

    // Chat
    /// Client submission
    Submit(chat::Submit),
    /// Submission acknowledgement
    Ack,
    /// Live or replayed chat message
    ChatMessage(chat::ChatMessage),
    /// Replay stopped early
    RecoveryIncomplete(chat::RecoveryIncomplete),

    // Cluster
    /// Worker registration
    Register(cluster::Register),
    /// Log append request
    AppendRequest(cluster::AppendRequest),
    /// Log append reply
    AppendReply(cluster::AppendReply),
    /// Log range read request
    ReadRequest(cluster::ReadRequest),
    /// Log range read reply
    ReadReply(cluster::ReadReply),
    /// Inter-worker broadcast
    Broadcast(cluster::BroadcastEvent),
}

/// Error payload for error frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Error code identifying the type of error.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorPayload {
    /// Frame was not valid at this point of the session.
    pub const FRAME_REJECTED: u16 = 0x0001;
    /// Payload could not be decoded.
    pub const INVALID_PAYLOAD: u16 = 0x0002;
    /// The log is unavailable.
    pub const LOG_UNAVAILABLE: u16 = 0x0003;
    /// Worker is at its connection limit.
    pub const OVERLOADED: u16 = 0x0004;

    /// Create a frame rejection error.
    pub fn frame_rejected(reason: impl Into<String>) -> Self {
        Self { code: Self::FRAME_REJECTED, message: reason.into() }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self { code: Self::INVALID_PAYLOAD, message: msg.into() }
    }

    /// Create a log unavailable error.
    pub fn log_unavailable(msg: impl Into<String>) -> Self {
        Self { code: Self::LOG_UNAVAILABLE, message: msg.into() }
    }

    /// Create an overload error.
    pub fn overloaded(limit: usize) -> Self {
        Self { code: Self::OVERLOADED, message: format!("connection limit reached ({limit})") }
    }
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::Welcome(_) => Opcode::Welcome,
            Self::Notice(_) => Opcode::Notice,
            Self::Error(_) => Opcode::Error,
            Self::Submit(_) => Opcode::Submit,
            Self::Ack => Opcode::Ack,
            Self::ChatMessage(_) => Opcode::ChatMessage,
            Self::RecoveryIncomplete(_) => Opcode::RecoveryIncomplete,
            Self::Register(_) => Opcode::Register,
            Self::AppendRequest(_) => Opcode::AppendRequest,
            Self::AppendReply(_) => Opcode::AppendReply,
            Self::ReadRequest(_) => Opcode::ReadRequest,
            Self::ReadReply(_) => Opcode::ReadReply,
            Self::Broadcast(_) => Opcode::Broadcast,
        }
    }

    /// Encode payload to buffer.
    ///
    /// Serializes only the inner struct, not the variant tag. Size limits are
    /// enforced later by [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Welcome(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Notice(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Error(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Submit(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Ack => Ok(()), // zero-byte payload
            Self::ChatMessage(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RecoveryIncomplete(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Register(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::AppendRequest(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::AppendReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ReadRequest(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ReadReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Broadcast(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload from bytes based on opcode.
    ///
    /// The size check runs before CBOR parsing.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed `MAX_PAYLOAD_SIZE`
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match opcode {
            Opcode::Hello => Self::Hello(from_cbor(bytes)?),
            Opcode::Welcome => Self::Welcome(from_cbor(bytes)?),
            Opcode::Notice => Self::Notice(from_cbor(bytes)?),
            Opcode::Error => Self::Error(from_cbor(bytes)?),
            Opcode::Submit => Self::Submit(from_cbor(bytes)?),
            Opcode::Ack => Self::Ack,
            Opcode::ChatMessage => Self::ChatMessage(from_cbor(bytes)?),
            Opcode::RecoveryIncomplete => Self::RecoveryIncomplete(from_cbor(bytes)?),
            Opcode::Register => Self::Register(from_cbor(bytes)?),
            Opcode::AppendRequest => Self::AppendRequest(from_cbor(bytes)?),
            Opcode::AppendReply => Self::AppendReply(from_cbor(bytes)?),
            Opcode::ReadRequest => Self::ReadRequest(from_cbor(bytes)?),
            Opcode::ReadReply => Self::ReadReply(from_cbor(bytes)?),
            Opcode::Broadcast => Self::Broadcast(from_cbor(bytes)?),
        };

        Ok(payload)
    }

    /// Convert payload into a transport frame carrying `request_id`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self, request_id: u32) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;

        let mut header = FrameHeader::new(self.opcode());
        header.set_request_id(request_id);
        Ok(Frame::new(header, buf))
    }

    /// Parse payload from a raw transport frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the header opcode is not recognized
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    /// - `ProtocolError::PayloadTooLarge` if payload exceeds maximum size
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or_else(|| ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}
