//! Application message codec (the body of a `Data` packet).
//!
//! ```text
//! +------+----------------+------------------------+-----------+
//! | flag | id (varint)    | route (literal | code) | payload   |
//! +------+----------------+------------------------+-----------+
//! ```
//!
//! Flag byte layout:
//!
//! | bit  | meaning                                   |
//! |------|-------------------------------------------|
//! | 0    | route is a 2-byte dictionary code         |
//! | 1..3 | message kind                              |
//! | 4    | payload is deflate-compressed             |
//! | 5    | error response                            |
//!
//! The id is present only for requests and responses, the route only for
//! requests, notifies and pushes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compression::{deflate, inflate};
use crate::dictionary::RouteDictionary;
use crate::error::MessageError;

const FLAG_ROUTE_CODE: u8 = 0x01;
const FLAG_COMPRESSED: u8 = 0x10;
const FLAG_ERROR: u8 = 0x20;
const KIND_SHIFT: u8 = 1;
const KIND_MASK: u8 = 0x07;

/// Message kind, stored in bits 1-3 of the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Client call that expects a response.
    Request = 0,
    /// Client call without a response.
    Notify = 1,
    /// Server answer to a request.
    Response = 2,
    /// Server-initiated message.
    Push = 3,
}

impl MessageKind {
    fn from_bits(bits: u8) -> Result<Self, MessageError> {
        match bits {
            0 => Ok(Self::Request),
            1 => Ok(Self::Notify),
            2 => Ok(Self::Response),
            3 => Ok(Self::Push),
            other => Err(MessageError::InvalidKind(other)),
        }
    }

    /// Whether messages of this kind carry an id.
    pub fn has_id(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }

    /// Whether messages of this kind carry a route.
    pub fn has_route(self) -> bool {
        matches!(self, Self::Request | Self::Notify | Self::Push)
    }
}

/// A decoded application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind.
    pub kind: MessageKind,
    /// Request/response correlation id; zero for notifies and pushes.
    pub id: u64,
    /// Dot-delimited `service.module.method` route; empty for responses.
    pub route: String,
    /// Opaque payload, already inflated.
    pub payload: Vec<u8>,
    /// Error flag.
    #[serde(default)]
    pub is_error: bool,
}

impl Message {
    /// A request carrying `id`.
    pub fn request(id: u64, route: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Request,
            id,
            route: route.into(),
            payload,
            is_error: false,
        }
    }

    /// A notify (no response expected).
    pub fn notify(route: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Notify,
            id: 0,
            route: route.into(),
            payload,
            is_error: false,
        }
    }

    /// A response to request `id`.
    pub fn response(id: u64, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            route: String::new(),
            payload,
            is_error: false,
        }
    }

    /// An error response to request `id`.
    pub fn error_response(id: u64, payload: Vec<u8>) -> Self {
        Self {
            is_error: true,
            ..Self::response(id, payload)
        }
    }

    /// A server push on `route`.
    pub fn push(route: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Push,
            id: 0,
            route: route.into(),
            payload,
            is_error: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Varint
// ---------------------------------------------------------------------------

/// Append `value` as a base-128 varint (low 7 bits first, high bit set on
/// every byte but the last).
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Read a base-128 varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed. Stops at the first
/// byte with the continuation bit clear.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize), MessageError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 || (shift == 63 && byte & 0x7F > 1) {
            return Err(MessageError::IdOverflow);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(MessageError::TruncatedId)
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

/// Encode a message.
///
/// The route is replaced by its dictionary code when `dictionary` knows it.
/// When `compress` is set the payload is deflated and flagged.
pub fn encode_message(
    msg: &Message,
    dictionary: Option<&RouteDictionary>,
    compress: bool,
) -> Result<Vec<u8>, MessageError> {
    let mut flag = (msg.kind as u8) << KIND_SHIFT;
    if msg.is_error {
        flag |= FLAG_ERROR;
    }
    if compress {
        flag |= FLAG_COMPRESSED;
    }

    let code = if msg.kind.has_route() {
        dictionary.and_then(|d| d.code(&msg.route))
    } else {
        None
    };
    if code.is_some() {
        flag |= FLAG_ROUTE_CODE;
    }

    let mut out = Vec::with_capacity(1 + 10 + 2 + msg.route.len() + msg.payload.len());
    out.push(flag);

    if msg.kind.has_id() {
        encode_varint(msg.id, &mut out);
    }

    if msg.kind.has_route() {
        match code {
            Some(code) => out.extend_from_slice(&code.to_be_bytes()),
            None => {
                let route = msg.route.as_bytes();
                let len = u8::try_from(route.len())
                    .map_err(|_| MessageError::RouteTooLong(route.len()))?;
                out.push(len);
                out.extend_from_slice(route);
            }
        }
    }

    if compress {
        out.extend_from_slice(&deflate(&msg.payload));
    } else {
        out.extend_from_slice(&msg.payload);
    }
    Ok(out)
}

/// Decode a message, resolving compressed routes through `dictionary`.
///
/// Every variable-length field is bounds-checked before it is read.
pub fn decode_message(
    bytes: &[u8],
    dictionary: Option<&RouteDictionary>,
) -> Result<Message, MessageError> {
    let (&flag, mut rest) = bytes.split_first().ok_or(MessageError::Empty)?;
    let kind = MessageKind::from_bits((flag >> KIND_SHIFT) & KIND_MASK)?;

    let mut id = 0;
    if kind.has_id() {
        let (value, used) = decode_varint(rest)?;
        id = value;
        rest = &rest[used..];
    }

    let mut route = String::new();
    if kind.has_route() {
        if flag & FLAG_ROUTE_CODE != 0 {
            if rest.len() < 2 {
                return Err(MessageError::TruncatedRoute {
                    need: 2,
                    have: rest.len(),
                });
            }
            let code = u16::from_be_bytes([rest[0], rest[1]]);
            route = dictionary
                .and_then(|d| d.route(code))
                .ok_or(MessageError::RouteNotFound(code))?;
            rest = &rest[2..];
        } else {
            let (&len, tail) = rest
                .split_first()
                .ok_or(MessageError::TruncatedRoute { need: 1, have: 0 })?;
            let len = usize::from(len);
            if tail.len() < len {
                return Err(MessageError::TruncatedRoute {
                    need: len,
                    have: tail.len(),
                });
            }
            route = std::str::from_utf8(&tail[..len])
                .map_err(|_| MessageError::InvalidRoute)?
                .to_string();
            rest = &tail[len..];
        }
    }

    let payload = if flag & FLAG_COMPRESSED != 0 {
        inflate(rest)?
    } else {
        rest.to_vec()
    };

    Ok(Message {
        kind,
        id,
        route,
        payload,
        is_error: flag & FLAG_ERROR != 0,
    })
}

/// Read only the kind and id of an encoded message.
///
/// Lets a receiver answer a request whose route or payload failed to
/// decode. The id is zero for kinds that carry none.
pub fn peek_header(bytes: &[u8]) -> Result<(MessageKind, u64), MessageError> {
    let (&flag, rest) = bytes.split_first().ok_or(MessageError::Empty)?;
    let kind = MessageKind::from_bits((flag >> KIND_SHIFT) & KIND_MASK)?;
    let id = if kind.has_id() { decode_varint(rest)?.0 } else { 0 };
    Ok((kind, id))
}

/// Message codec bound to a dictionary and a compression threshold.
///
/// Owned by the gateway and handed to every connection, so each gateway (and
/// each test) works against its own dictionary.
#[derive(Clone)]
pub struct MessageCodec {
    dictionary: Arc<RouteDictionary>,
    compress_threshold: usize,
}

impl MessageCodec {
    /// Create a codec. A `compress_threshold` of zero disables compression.
    pub fn new(dictionary: Arc<RouteDictionary>, compress_threshold: usize) -> Self {
        Self {
            dictionary,
            compress_threshold,
        }
    }

    /// The dictionary this codec resolves routes with.
    pub fn dictionary(&self) -> &Arc<RouteDictionary> {
        &self.dictionary
    }

    /// Encode, deflating payloads at or above the threshold.
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, MessageError> {
        let compress = self.compress_threshold > 0 && msg.payload.len() >= self.compress_threshold;
        encode_message(msg, Some(&self.dictionary), compress)
    }

    /// Decode against this codec's dictionary.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, MessageError> {
        decode_message(bytes, Some(&self.dictionary))
    }
}
