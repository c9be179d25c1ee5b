use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x5445_5448;

/// Number of sequences past `next_expected` a receiver buffers and reports in
/// an ack bitfield.
pub const REORDER_WINDOW: u32 = 32;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
}

impl PacketHeader {
    pub fn new() -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum DenyReason {
    ServerFull,
}

/// One protocol frame. Everything except `Reliable` and `Unreliable` is a
/// control frame consumed by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Frame {
    ConnectRequest { client_salt: u64, token: Vec<u8> },
    Challenge { server_salt: u64, challenge: u64 },
    ChallengeResponse { combined_salt: u64 },
    Accepted { connection_id: u32 },
    Denied { reason: DenyReason },
    KeepAlive,
    Disconnect,
    Reliable { sequence: u32, payload: Vec<u8> },
    Unreliable { payload: Vec<u8> },
    /// Every sequence before `next_expected` has been received; bit `i` of
    /// `window` covers `next_expected + 1 + i`.
    Ack { next_expected: u32, window: u32 },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectRequest { .. } => "connect-request",
            Self::Challenge { .. } => "challenge",
            Self::ChallengeResponse { .. } => "challenge-response",
            Self::Accepted { .. } => "accepted",
            Self::Denied { .. } => "denied",
            Self::KeepAlive => "keep-alive",
            Self::Disconnect => "disconnect",
            Self::Reliable { .. } => "reliable",
            Self::Unreliable { .. } => "unreliable",
            Self::Ack { .. } => "ack",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub frame: Frame,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("datagram of {0} bytes exceeds MTU")]
    TooLarge(usize),
    #[error("bad magic or protocol version")]
    BadHeader,
}

impl Packet {
    pub fn new(frame: Frame) -> Self {
        Self {
            header: PacketHeader::new(),
            frame,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let data = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;

        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(data.len()));
        }
        Ok(data)
    }

    /// Datagram buffers carry no alignment guarantee, so the bytes are copied
    /// into an aligned buffer before validation.
    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);

        let packet = rkyv::from_bytes::<Self, rancor::Error>(&aligned)
            .map_err(PacketError::Deserialize)?;

        if !packet.header.is_valid() {
            return Err(PacketError::BadHeader);
        }
        Ok(packet)
    }
}

/// Upper bound on an application payload so that its framed packet fits in
/// `MAX_PACKET_SIZE`.
pub fn max_payload_size() -> usize {
    MAX_PACKET_SIZE - 64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_packet_serialization() {
        let packet = Packet::new(Frame::Reliable {
            sequence: 7,
            payload: vec![1, 2, 3],
        });

        let serialized = packet.serialize().unwrap();
        let deserialized = Packet::deserialize(&serialized).unwrap();

        assert_eq!(packet, deserialized);
    }

    #[test]
    fn test_unaligned_input_decodes() {
        let packet = Packet::new(Frame::Ack {
            next_expected: 9,
            window: 0b101,
        });
        let serialized = packet.serialize().unwrap();

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&serialized);

        assert_eq!(Packet::deserialize(&shifted[1..]).unwrap(), packet);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Packet::deserialize(&[0xde, 0xad, 0xbe, 0xef]).is_err());
        assert!(Packet::deserialize(&[]).is_err());
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let mut packet = Packet::new(Frame::KeepAlive);
        packet.header.magic = 0x1234;
        let serialized = packet.serialize().unwrap();

        assert!(matches!(
            Packet::deserialize(&serialized),
            Err(PacketError::BadHeader)
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let packet = Packet::new(Frame::Unreliable {
            payload: vec![0; MAX_PACKET_SIZE],
        });
        assert!(matches!(packet.serialize(), Err(PacketError::TooLarge(_))));
    }

    #[test]
    fn test_max_payload_fits() {
        let packet = Packet::new(Frame::Reliable {
            sequence: u32::MAX,
            payload: vec![0xff; max_payload_size()],
        });
        assert!(packet.serialize().is_ok());
    }
}
