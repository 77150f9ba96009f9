//! Packet framing.
//!
//! Every packet on a client connection starts with a fixed 4-byte header:
//!
//! ```text
//! +----------+---------------------------+-----------------+
//! | type (1) | length (3, big-endian)    | body (length)   |
//! +----------+---------------------------+-----------------+
//! ```
//!
//! The length does **not** include the header itself. Handshake and kick
//! bodies are JSON, data bodies are an encoded [`crate::Message`], heartbeat
//! bodies are empty.

use crate::error::PacketError;

/// Size of the packet header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest body length the 3-byte length field can carry (16 MiB - 1).
pub const MAX_PACKET_SIZE: usize = (1 << 24) - 1;

/// Packet type tag, the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client hello, JSON body.
    Handshake = 0x01,
    /// Handshake acknowledgement, JSON body when sent by the server.
    HandshakeAck = 0x02,
    /// Liveness check, empty body.
    Heartbeat = 0x03,
    /// Application message.
    Data = 0x04,
    /// Server-initiated disconnect, JSON body.
    Kick = 0x05,
}

impl PacketType {
    /// Parse a header type byte.
    pub fn from_u8(value: u8) -> Result<Self, PacketError> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::HandshakeAck),
            0x03 => Ok(Self::Heartbeat),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::Kick),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub kind: PacketType,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl Packet {
    /// Build a packet from its parts.
    pub fn new(kind: PacketType, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    /// Encode this packet to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        encode(self.kind, &self.body)
    }
}

/// Encode a packet header and body.
pub fn encode(kind: PacketType, body: &[u8]) -> Result<Vec<u8>, PacketError> {
    if body.len() > MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge {
            size: body.len(),
            max: MAX_PACKET_SIZE,
        });
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header(kind, body.len()));
    out.extend_from_slice(body);
    Ok(out)
}

/// Build the 4-byte header for a body of `len` bytes. `len` must already be
/// bounded by [`MAX_PACKET_SIZE`].
pub(crate) fn header(kind: PacketType, len: usize) -> [u8; HEADER_LEN] {
    [
        kind as u8,
        ((len >> 16) & 0xFF) as u8,
        ((len >> 8) & 0xFF) as u8,
        (len & 0xFF) as u8,
    ]
}

/// Parse a 4-byte header into its type and declared body length.
pub fn parse_header(bytes: &[u8]) -> Result<(PacketType, usize), PacketError> {
    if bytes.len() < HEADER_LEN {
        return Err(PacketError::TruncatedHeader(bytes.len()));
    }
    let kind = PacketType::from_u8(bytes[0])?;
    let len = (usize::from(bytes[1]) << 16) | (usize::from(bytes[2]) << 8) | usize::from(bytes[3]);
    Ok((kind, len))
}

/// Decode exactly one packet from `bytes`.
///
/// The buffer must hold the header and precisely the declared number of body
/// bytes; anything else is a framing error.
pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
    let (kind, declared) = parse_header(bytes)?;
    let remaining = bytes.len() - HEADER_LEN;
    if declared != remaining {
        return Err(PacketError::LengthMismatch {
            declared,
            remaining,
        });
    }
    Ok(Packet {
        kind,
        body: bytes[HEADER_LEN..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_each_type() {
        for kind in [
            PacketType::Handshake,
            PacketType::HandshakeAck,
            PacketType::Heartbeat,
            PacketType::Data,
            PacketType::Kick,
        ] {
            let body = b"{\"k\":1}".to_vec();
            let bytes = encode(kind, &body).unwrap();
            assert_eq!(decode(&bytes).unwrap(), Packet::new(kind, body));
        }
    }

    #[test]
    fn test_header_is_big_endian_24_bit() {
        let body = vec![0u8; 0x01_02_03];
        let bytes = encode(PacketType::Data, &body).unwrap();
        assert_eq!(&bytes[..4], &[0x04, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_empty_heartbeat() {
        let bytes = encode(PacketType::Heartbeat, &[]).unwrap();
        assert_eq!(bytes, vec![0x03, 0, 0, 0]);
        let packet = decode(&bytes).unwrap();
        assert!(packet.body.is_empty());
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert_eq!(decode(&[0x04, 0x00]), Err(PacketError::TruncatedHeader(2)));
        assert_eq!(decode(&[]), Err(PacketError::TruncatedHeader(0)));
    }

    #[test]
    fn test_short_body_rejected() {
        let mut bytes = encode(PacketType::Data, b"hello").unwrap();
        bytes.truncate(bytes.len() - 2);
        assert_eq!(
            decode(&bytes),
            Err(PacketError::LengthMismatch {
                declared: 5,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(PacketType::Data, b"hi").unwrap();
        bytes.push(0xFF);
        assert!(matches!(
            decode(&bytes),
            Err(PacketError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert_eq!(
            decode(&[0x09, 0, 0, 0]),
            Err(PacketError::UnknownType(0x09))
        );
    }

    #[test]
    fn test_oversized_body_rejected() {
        let body = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(matches!(
            encode(PacketType::Data, &body),
            Err(PacketError::TooLarge { .. })
        ));
    }
}
