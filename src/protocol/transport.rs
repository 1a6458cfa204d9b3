//! Frame codec over asynchronous byte streams.
//!
//! Every frame on the wire is an 8-byte header followed by the body:
//!
//! ```text
//! +------------------+------------------+-----------------------+
//! | kind: u32 (LE)   | body_len: u32 LE | body: body_len bytes  |
//! +------------------+------------------+-----------------------+
//! ```
//!
//! The header is encoded with bincode using fixed-width little-endian integers, so peers on
//! different architectures agree on it. There is no other out-of-band framing.
//!
//! [`FrameReader`] exposes the header and body steps separately so the connection state
//! machine can track which one it is waiting on.
use std::io;

use bincode::{Decode, Encode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{FramingError, Message, MessageHeader, MessageKind, wire_config};

pub const HEADER_LEN: usize = 8;

/// Default upper bound on an inbound body, in bytes.
pub const DEFAULT_MAX_BODY_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Framing(#[from] FramingError),
}

#[derive(Debug, Encode, Decode, PartialEq, Eq)]
struct WireHeader {
    kind: u32,
    body_len: u32,
}

pub fn encode_header<T: MessageKind>(
    header: &MessageHeader<T>,
) -> Result<[u8; HEADER_LEN], FramingError> {
    let wire = WireHeader {
        kind: header.kind.into(),
        body_len: header.body_len(),
    };

    let mut buf = [0u8; HEADER_LEN];
    bincode::encode_into_slice(wire, &mut buf, wire_config())?;
    Ok(buf)
}

/// Decodes a header, rejecting unknown kinds and bodies above `max_body_len`.
pub fn decode_header<T: MessageKind>(
    buf: &[u8; HEADER_LEN],
    max_body_len: usize,
) -> Result<(T, usize), FramingError> {
    let (wire, _): (WireHeader, usize) = bincode::decode_from_slice(buf, wire_config())?;

    let kind = T::try_from(wire.kind).map_err(|_| FramingError::UnknownKind(wire.kind))?;
    let len = wire.body_len as usize;
    if len > max_body_len {
        return Err(FramingError::BodyTooLarge {
            len,
            max: max_body_len,
        });
    }

    Ok((kind, len))
}

pub struct FrameReader<R> {
    stream: R,
    max_body_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R, max_body_len: usize) -> Self {
        Self {
            stream,
            max_body_len,
        }
    }

    pub async fn read_header<T: MessageKind>(&mut self) -> Result<(T, usize), TransportError> {
        let mut buf = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut buf).await?;
        Ok(decode_header(&buf, self.max_body_len)?)
    }

    pub async fn read_body(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        Ok(body)
    }
}

pub struct FrameWriter<W> {
    stream: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(stream: W) -> Self {
        Self { stream }
    }

    pub async fn write_header<T: MessageKind>(
        &mut self,
        header: &MessageHeader<T>,
    ) -> Result<(), TransportError> {
        let buf = encode_header(header)?;
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    pub async fn write_body(&mut self, body: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(body).await?;
        Ok(())
    }

    /// Writes the header, then the body if there is one.
    pub async fn write_message<T: MessageKind>(
        &mut self,
        msg: &Message<T>,
    ) -> Result<(), TransportError> {
        self.write_header(msg.header()).await?;
        if !msg.is_empty() {
            self.write_body(msg.body()).await?;
        }
        Ok(())
    }
}
