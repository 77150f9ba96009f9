//! Reading and writing packets on an async byte stream.
//!
//! The packet header carries its own length, so packets can be read straight
//! off a TCP stream without any extra delimiter.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::PacketError;
use crate::packet::{HEADER_LEN, Packet, header, parse_header};

/// Errors that can occur while reading or writing packets on a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header was malformed or the body too large.
    #[error("framing error: {0}")]
    Packet(#[from] PacketError),

    /// The peer closed the stream before a complete packet arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single packet, rejecting bodies larger than `max_body`.
///
/// `buf` is scratch space reused across calls; it is cleared first.
pub async fn read_packet<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_body: usize,
    buf: &mut Vec<u8>,
) -> Result<Packet, FrameError> {
    let mut head = [0u8; HEADER_LEN];
    reader.read_exact(&mut head).await.map_err(map_eof)?;

    let (kind, len) = parse_header(&head)?;
    if len > max_body {
        return Err(PacketError::TooLarge {
            size: len,
            max: max_body,
        }
        .into());
    }

    buf.clear();
    buf.resize(len, 0);
    if len > 0 {
        reader.read_exact(buf).await.map_err(map_eof)?;
    }

    Ok(Packet::new(kind, buf.clone()))
}

/// Write an already encoded packet and flush.
pub async fn write_packet<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), FrameError> {
    let bytes = packet.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Assemble header and body in `scratch` and write them with one call.
///
/// `scratch` is cleared first and keeps its allocation, so a writer can
/// reuse one buffer for every packet it sends.
pub async fn write_buffered<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    packet: &Packet,
    scratch: &mut Vec<u8>,
) -> Result<(), FrameError> {
    if packet.body.len() > crate::packet::MAX_PACKET_SIZE {
        return Err(PacketError::TooLarge {
            size: packet.body.len(),
            max: crate::packet::MAX_PACKET_SIZE,
        }
        .into());
    }
    scratch.clear();
    scratch.extend_from_slice(&header(packet.kind, packet.body.len()));
    scratch.extend_from_slice(&packet.body);
    writer.write_all(scratch).await?;
    writer.flush().await?;
    Ok(())
}
