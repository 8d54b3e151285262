//! Operation codes.

/// Frame operation code.
///
/// `0x00xx` is the client session layer, `0x001x` chat traffic and `0x01xx`
/// the worker <-> coordinator cluster link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Client handshake carrying the last observed offset
    Hello = 0x0001,
    /// Server greeting, first frame on every connection
    Welcome = 0x0002,
    /// Worker-local informational text (e.g. join notice)
    Notice = 0x0003,
    /// Error response
    Error = 0x000F,

    /// Client chat submission
    Submit = 0x0010,
    /// Submission acknowledgement (empty payload)
    Ack = 0x0011,
    /// Chat message with its log offset (live or replayed)
    ChatMessage = 0x0012,
    /// Recovery replay could not complete
    RecoveryIncomplete = 0x0013,

    /// Worker registration with the coordinator
    Register = 0x0100,
    /// Log append request
    AppendRequest = 0x0101,
    /// Log append reply
    AppendReply = 0x0102,
    /// Log range read request
    ReadRequest = 0x0103,
    /// Log range read reply
    ReadReply = 0x0104,
    /// Broadcast event relayed between workers
    Broadcast = 0x0105,
}

impl Opcode {
    /// Raw wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a raw wire value. `None` if unrecognized.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Hello),
            0x0002 => Some(Self::Welcome),
            0x0003 => Some(Self::Notice),
            0x000F => Some(Self::Error),
            0x0010 => Some(Self::Submit),
            0x0011 => Some(Self::Ack),
            0x0012 => Some(Self::ChatMessage),
            0x0013 => Some(Self::RecoveryIncomplete),
            0x0100 => Some(Self::Register),
            0x0101 => Some(Self::AppendRequest),
            0x0102 => Some(Self::AppendReply),
            0x0103 => Some(Self::ReadRequest),
            0x0104 => Some(Self::ReadReply),
            0x0105 => Some(Self::Broadcast),
            _ => None,
        }
    }

    /// Frame belongs to the worker <-> coordinator link.
    #[must_use]
    pub const fn is_cluster(self) -> bool {
        self.to_u16() >= 0x0100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Opcode; 14] = [
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

    #[test]
    fn opcode_wire_values_are_stable() {
        for opcode in ALL {
            assert_eq!(Opcode::from_u16(opcode.to_u16()), Some(opcode));
        }
    }

    #[test]
    fn unknown_opcode_is_none() {
        assert_eq!(Opcode::from_u16(0x7777), None);
        assert_eq!(Opcode::from_u16(0), None);
    }

    #[test]
    fn cluster_opcodes_are_partitioned() {
        assert!(!Opcode::Submit.is_cluster());
        assert!(!Opcode::ChatMessage.is_cluster());
        assert!(Opcode::Broadcast.is_cluster());
        assert!(Opcode::Register.is_cluster());
    }
}
