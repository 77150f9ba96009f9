//! Codec error types.

use crate::compression::CompressionError;
use crate::handshake::error_codes;

/// Framing errors. Always fatal for the connection that produced them.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer than four header bytes were available.
    #[error("truncated packet header: {0} bytes")]
    TruncatedHeader(usize),

    /// The header names a packet type this codec does not know.
    #[error("unknown packet type 0x{0:02X}")]
    UnknownType(u8),

    /// The declared body length disagrees with the bytes that follow the header.
    #[error("declared length {declared} does not match remaining {remaining} bytes")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Bytes actually present after the header.
        remaining: usize,
    },

    /// The body exceeds the largest length a 3-byte header can express.
    #[error("packet body of {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Body size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// Errors produced while encoding or decoding a [`crate::Message`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    /// The message buffer was empty.
    #[error("empty message")]
    Empty,

    /// The kind bits of the flag byte hold an unassigned value.
    #[error("invalid message kind {0}")]
    InvalidKind(u8),

    /// The buffer ended inside the variable-length id.
    #[error("truncated message id")]
    TruncatedId,

    /// The variable-length id does not fit in 64 bits.
    #[error("message id overflows 64 bits")]
    IdOverflow,

    /// The buffer ended inside the route field.
    #[error("truncated route: need {need} bytes, have {have}")]
    TruncatedRoute {
        /// Bytes required.
        need: usize,
        /// Bytes left.
        have: usize,
    },

    /// A literal route longer than the 1-byte length prefix allows.
    #[error("route of {0} bytes exceeds 255")]
    RouteTooLong(usize),

    /// A literal route that is not valid UTF-8.
    #[error("route is not valid UTF-8")]
    InvalidRoute,

    /// A compressed route code that the dictionary does not know.
    #[error("route not found for code {0}")]
    RouteNotFound(u16),

    /// The payload could not be inflated.
    #[error("payload decompression failed: {0}")]
    Decompress(#[from] CompressionError),
}

impl MessageError {
    /// Error code to answer the message with, for failures confined to the
    /// message's route or payload. `None` means the framing itself is broken.
    pub fn message_code(&self) -> Option<u16> {
        match self {
            Self::RouteNotFound(_) => Some(error_codes::NO_HANDLER),
            Self::InvalidRoute | Self::Decompress(_) => Some(error_codes::BAD_ROUTE),
            _ => None,
        }
    }
}

/// Errors raised by the route dictionary. Registration is aborted, existing
/// mappings stay intact.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DictionaryError {
    /// The route already has a code.
    #[error("duplicate route {0:?}")]
    DuplicateRoute(String),

    /// The code is already assigned to another route.
    #[error("duplicate route code {0}")]
    DuplicateCode(u16),
}
