//! In-memory message representation and body framing.
//!
//! A [`Message`] is a [`MessageHeader`] (kind tag plus body length) followed by an opaque byte
//! body. The header's `body_len` always equals `body.len()`; every mutation below keeps the two
//! in lock-step, which is why the body is only reachable through these methods.
//!
//! # Body framing
//!
//! Two styles of payload access are supported:
//!
//! - Stack style: [`Message::push`] appends a fixed-layout value at the tail and
//!   [`Message::pop`] removes one from the tail, so values come back in reverse order.
//! - Sequential style: [`MessageWriter`] appends values, `u32`-length-prefixed strings, raw
//!   byte blobs and bincode-encoded values; [`MessageReader`] reads them back front to back.
//!
//! Fixed-layout values must be [`bytemuck::Pod`]: no pointers, no padding, any bit pattern
//! valid. They are copied in host byte order, so peers are assumed to share endianness for
//! body contents. The header itself has an explicit wire encoding, see
//! [`transport`](super::transport).
//!
//! Extraction never truncates silently: reading past the end of the body yields
//! [`FramingError::Underflow`].
use std::{fmt, string::FromUtf8Error};

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
    error::{DecodeError, EncodeError},
};
use bytemuck::Pod;
use thiserror::Error;

use super::ConnectionId;

/// Largest body a single message can carry; bounded by the `u32` length field.
pub const MAX_BODY_LEN: usize = u32::MAX as usize;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("underflow: needed {needed} bytes but only {remaining} remain")]
    Underflow { needed: usize, remaining: usize },

    #[error("body of {0} bytes exceeds the u32 length field")]
    Overflow(usize),

    #[error("string payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("declared body of {len} bytes exceeds limit of {max}")]
    BodyTooLarge { len: usize, max: usize },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] EncodeError),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] DecodeError),
}

/// Application-chosen discriminant identifying what a message means.
///
/// On the wire a kind is always a `u32`. Plain integers qualify, as do `#[repr(u32)]` enums
/// deriving `num_enum::IntoPrimitive` and `num_enum::TryFromPrimitive`.
pub trait MessageKind:
    Copy + Send + Sync + fmt::Debug + Into<u32> + TryFrom<u32> + 'static
{
}

impl<T> MessageKind for T where
    T: Copy + Send + Sync + fmt::Debug + Into<u32> + TryFrom<u32> + 'static
{
}

/// bincode configuration shared by the frame header and encoded payload values.
pub(crate) fn wire_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader<T> {
    pub kind: T,
    body_len: u32,
}

impl<T> MessageHeader<T> {
    pub fn body_len(&self) -> u32 {
        self.body_len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    header: MessageHeader<T>,
    body: Vec<u8>,
}

impl<T: MessageKind> Message<T> {
    pub fn new(kind: T) -> Self {
        Self {
            header: MessageHeader { kind, body_len: 0 },
            body: Vec::new(),
        }
    }

    pub fn with_body(kind: T, body: Vec<u8>) -> Result<Self, FramingError> {
        if body.len() > MAX_BODY_LEN {
            return Err(FramingError::Overflow(body.len()));
        }

        Ok(Self {
            header: MessageHeader {
                kind,
                body_len: body.len() as u32,
            },
            body,
        })
    }

    pub fn kind(&self) -> T {
        self.header.kind
    }

    pub fn set_kind(&mut self, kind: T) {
        self.header.kind = kind;
    }

    pub fn header(&self) -> &MessageHeader<T> {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Appends a fixed-layout value to the end of the body.
    pub fn push<V: Pod>(&mut self, value: V) -> Result<(), FramingError> {
        self.extend(bytemuck::bytes_of(&value))
    }

    /// Removes a fixed-layout value from the end of the body.
    pub fn pop<V: Pod>(&mut self) -> Result<V, FramingError> {
        let needed = size_of::<V>();
        let remaining = self.body.len();
        if needed > remaining {
            return Err(FramingError::Underflow { needed, remaining });
        }

        let start = remaining - needed;
        let value = bytemuck::pod_read_unaligned(&self.body[start..]);
        self.body.truncate(start);
        self.sync_len();
        Ok(value)
    }

    pub fn writer(&mut self) -> MessageWriter<'_, T> {
        MessageWriter { msg: self }
    }

    pub fn reader(&self) -> MessageReader<'_, T> {
        MessageReader {
            msg: self,
            offset: 0,
        }
    }

    pub fn clear(&mut self) {
        self.body.clear();
        self.sync_len();
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        let len = self.body.len() + bytes.len();
        if len > MAX_BODY_LEN {
            return Err(FramingError::Overflow(len));
        }

        self.body.extend_from_slice(bytes);
        self.sync_len();
        Ok(())
    }

    fn sync_len(&mut self) {
        self.header.body_len = self.body.len() as u32;
    }
}

impl<T: MessageKind> fmt::Display for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[kind {:?}] size: {}", self.header.kind, self.header.body_len)
    }
}

/// A received message tagged with the connection it arrived on.
///
/// `sender` is `None` on the client side, where there is only one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMessage<T> {
    pub sender: Option<ConnectionId>,
    pub message: Message<T>,
}

/// Appends payload fields to a message body, front to back.
pub struct MessageWriter<'a, T> {
    msg: &'a mut Message<T>,
}

impl<T: MessageKind> MessageWriter<'_, T> {
    pub fn write<V: Pod>(&mut self, value: V) -> Result<&mut Self, FramingError> {
        self.msg.push(value)?;
        Ok(self)
    }

    /// Writes a `u32` byte length followed by the raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, FramingError> {
        let len = u32::try_from(bytes.len()).map_err(|_| FramingError::Overflow(bytes.len()))?;
        if self.msg.len() + size_of::<u32>() + bytes.len() > MAX_BODY_LEN {
            return Err(FramingError::Overflow(
                self.msg.len() + size_of::<u32>() + bytes.len(),
            ));
        }

        self.msg.push(len)?;
        self.msg.extend(bytes)?;
        Ok(self)
    }

    pub fn write_str(&mut self, s: &str) -> Result<&mut Self, FramingError> {
        self.write_bytes(s.as_bytes())
    }

    /// Writes a bincode-encoded value as a length-prefixed blob.
    pub fn write_encoded<V: Encode>(&mut self, value: &V) -> Result<&mut Self, FramingError> {
        let bytes = bincode::encode_to_vec(value, wire_config())?;
        self.write_bytes(&bytes)
    }
}

/// Reads payload fields from a message body, front to back.
///
/// A failed read leaves the cursor where it was.
pub struct MessageReader<'a, T> {
    msg: &'a Message<T>,
    offset: usize,
}

impl<T: MessageKind> MessageReader<'_, T> {
    pub fn remaining(&self) -> usize {
        self.msg.len() - self.offset
    }

    fn take(&mut self, needed: usize) -> Result<&[u8], FramingError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(FramingError::Underflow { needed, remaining });
        }

        let start = self.offset;
        self.offset += needed;
        Ok(&self.msg.body()[start..self.offset])
    }

    pub fn read<V: Pod>(&mut self) -> Result<V, FramingError> {
        let bytes = self.take(size_of::<V>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, FramingError> {
        let start = self.offset;
        let len = self.read::<u32>()? as usize;

        match self.take(len) {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) => {
                self.offset = start;
                Err(e)
            }
        }
    }

    pub fn read_str(&mut self) -> Result<String, FramingError> {
        let start = self.offset;
        let bytes = self.read_bytes()?;

        String::from_utf8(bytes).map_err(|e| {
            self.offset = start;
            FramingError::from(e)
        })
    }

    /// Reads a length-prefixed blob and decodes it with bincode.
    pub fn read_decoded<V: Decode<()>>(&mut self) -> Result<V, FramingError> {
        let start = self.offset;
        let bytes = self.read_bytes()?;

        match bincode::decode_from_slice(&bytes, wire_config()) {
            Ok((value, _)) => Ok(value),
            Err(e) => {
                self.offset = start;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytemuck::{Pod, Zeroable};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Point {
        x: f32,
        y: f32,
    }

    #[derive(Debug, PartialEq, Encode, Decode)]
    struct Greeting {
        name: String,
        times: u16,
    }

    #[test]
    fn push_pop_reverse_order() {
        let mut msg = Message::new(1u32);
        msg.push(42u32).unwrap();
        assert_eq!(msg.header().body_len(), 4);
        msg.push(3.5f64).unwrap();
        assert_eq!(msg.header().body_len(), 12);
        msg.push(Point { x: 1.0, y: -2.0 }).unwrap();
        assert_eq!(msg.header().body_len(), 20);

        assert_eq!(msg.pop::<Point>().unwrap(), Point { x: 1.0, y: -2.0 });
        assert_eq!(msg.header().body_len(), 12);
        assert_eq!(msg.pop::<f64>().unwrap(), 3.5);
        assert_eq!(msg.header().body_len(), 4);
        assert_eq!(msg.pop::<u32>().unwrap(), 42);
        assert_eq!(msg.header().body_len(), 0);
        assert!(msg.is_empty());
    }

    #[test]
    fn pop_underflow() {
        let mut msg = Message::new(1u32);
        msg.push(7u16).unwrap();

        match msg.pop::<u64>() {
            Err(FramingError::Underflow { needed, remaining }) => {
                assert_eq!(needed, 8);
                assert_eq!(remaining, 2);
            }
            other => panic!("expected underflow, got {other:?}"),
        }
        // Nothing was consumed by the failed pop.
        assert_eq!(msg.len(), 2);
        assert_eq!(msg.pop::<u16>().unwrap(), 7);
    }

    #[test]
    fn writer_reader_values_then_string() {
        let mut msg = Message::new(9u32);
        msg.writer()
            .write(1u8)
            .unwrap()
            .write(-20i32)
            .unwrap()
            .write([1u8, 2, 3, 4])
            .unwrap()
            .write_str("hello, world")
            .unwrap();
        assert_eq!(msg.header().body_len() as usize, 1 + 4 + 4 + 4 + 12);
        assert_eq!(msg.header().body_len() as usize, msg.body().len());

        let mut reader = msg.reader();
        assert_eq!(reader.read::<u8>().unwrap(), 1);
        assert_eq!(reader.read::<i32>().unwrap(), -20);
        assert_eq!(reader.read::<[u8; 4]>().unwrap(), [1, 2, 3, 4]);
        assert_eq!(reader.read_str().unwrap(), "hello, world");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn string_length_exceeding_body() {
        let mut msg = Message::new(0u32);
        msg.push(100u32).unwrap();
        msg.push(*b"abc").unwrap();

        let mut reader = msg.reader();
        assert!(matches!(
            reader.read_str(),
            Err(FramingError::Underflow {
                needed: 100,
                remaining: 3
            })
        ));
        // Cursor is restored so the caller can inspect the raw body.
        assert_eq!(reader.remaining(), 7);
    }

    #[test]
    fn read_past_end() {
        let msg = Message::new(0u32);
        let mut reader = msg.reader();
        assert!(matches!(
            reader.read::<u32>(),
            Err(FramingError::Underflow {
                needed: 4,
                remaining: 0
            })
        ));
    }

    #[test]
    fn invalid_utf8_string() {
        let mut msg = Message::new(0u32);
        msg.writer().write_bytes(&[0xff, 0xfe]).unwrap();

        let mut reader = msg.reader();
        assert!(matches!(
            reader.read_str(),
            Err(FramingError::InvalidUtf8(_))
        ));
        assert_eq!(reader.read_bytes().unwrap(), vec![0xff, 0xfe]);
    }

    #[test]
    fn encoded_values() {
        let greeting = Greeting {
            name: "ferris".into(),
            times: 3,
        };

        let mut msg = Message::new(2u32);
        msg.writer()
            .write_encoded(&greeting)
            .unwrap()
            .write(5u64)
            .unwrap();

        let mut reader = msg.reader();
        assert_eq!(reader.read_decoded::<Greeting>().unwrap(), greeting);
        assert_eq!(reader.read::<u64>().unwrap(), 5);
    }

    #[test]
    fn with_body_sets_length() {
        let msg = Message::with_body(4u32, b"ping".to_vec()).unwrap();
        assert_eq!(msg.kind(), 4);
        assert_eq!(msg.header().body_len(), 4);
        assert_eq!(msg.body(), b"ping");
        assert_eq!(msg.to_string(), "[kind 4] size: 4");
    }

    #[test]
    fn clear_resets_length() {
        let mut msg = Message::with_body(1u32, vec![0; 16]).unwrap();
        msg.clear();
        assert_eq!(msg.header().body_len(), 0);
        assert!(msg.is_empty());
    }
}
