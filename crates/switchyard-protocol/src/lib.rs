//! Client wire protocol: packet framing, message codec, route compression
//! dictionary, payload compression and handshake bodies.
//!
//! A client connection carries a stream of [`Packet`]s. `Data` packets wrap a
//! [`Message`], whose route may be replaced by a 2-byte code from a shared
//! [`RouteDictionary`].

pub mod compression;
pub mod dictionary;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod message;
pub mod packet;

pub use compression::{CompressionError, deflate, inflate};
pub use dictionary::RouteDictionary;
pub use error::{DictionaryError, MessageError, PacketError};
pub use framing::{FrameError, read_packet, write_buffered, write_packet};
pub use handshake::{ErrorBody, HandshakeRequest, HandshakeResponse, KickBody, error_codes};
pub use message::{
    Message, MessageCodec, MessageKind, decode_message, encode_message, peek_header,
};
pub use packet::{HEADER_LEN, MAX_PACKET_SIZE, Packet, PacketType, decode, encode};
