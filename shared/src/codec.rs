//! Binary codec used by every profile payload
//!
//! All multi-byte values are written in network byte order. Variable-length
//! values (strings and blobs) carry a 4-byte signed length prefix and no
//! terminator. Decoding never returns partially read values: a short buffer is
//! reported as [`DecodeError::Truncated`] and the caller discards the result.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors raised while decoding profile bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Tried to read past the end of the buffer
    #[error("truncated data: needed {needed} bytes at offset {offset}, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    /// A length prefix was negative
    #[error("negative length prefix {0}")]
    NegativeLength(i32),

    /// String bytes were not valid UTF-8
    #[error("string is not valid utf-8")]
    InvalidUtf8,

    /// A boolean byte other than 0 or 1
    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),

    /// Unknown list operation code
    #[error("unknown list opcode {0}")]
    UnknownOpcode(u8),

    /// A replayed list operation does not fit the receiver's sequence
    #[error("list operation at index {index} does not fit sequence of length {len}")]
    IndexOutOfRange { index: i32, len: usize },

    /// A record payload was not consumed exactly
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    /// Snapshot property count differs from the local schema
    #[error("snapshot carries {actual} properties, local schema declares {expected}")]
    SchemaMismatch { expected: usize, actual: usize },
}

/// Growable big-endian byte sink
#[derive(Debug, Default)]
pub struct Writer {
    buffer: BytesMut,
}

impl Writer {
    /// Creates an empty writer
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Creates a writer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Writes one byte
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    /// Writes a big-endian `u16`
    pub fn write_u16(&mut self, value: u16) {
        self.buffer.put_u16(value);
    }

    /// Writes a big-endian `i32`
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.put_i32(value);
    }

    /// Writes a big-endian `u32`
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    /// Writes a big-endian `i64`
    pub fn write_i64(&mut self, value: i64) {
        self.buffer.put_i64(value);
    }

    /// Writes a big-endian `u64`
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.put_u64(value);
    }

    /// Writes a length-prefixed blob
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.buffer.put_slice(bytes);
    }

    /// Writes raw bytes with no prefix
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buffer.put_slice(bytes);
    }

    /// Writes a collection or payload length as an `i32`
    ///
    /// Lengths above `i32::MAX` cannot be represented on the wire; such values
    /// never occur for profile data and are clamped.
    pub fn write_len(&mut self, len: usize) {
        self.write_i32(i32::try_from(len).unwrap_or(i32::MAX));
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Finishes writing and returns the bytes without copying
    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }

    /// Finishes writing and copies the bytes out
    pub fn into_vec(self) -> Vec<u8> {
        self.buffer.to_vec()
    }
}

/// Cursor over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the beginning of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Offset of the next unread byte
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of bytes not yet read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Takes the next `count` bytes, failing if fewer remain
    pub fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::Truncated {
                offset: self.position,
                needed: count,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    /// Reads one byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?.get_u8())
    }

    /// Reads a big-endian `u16`
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(self.take(2)?.get_u16())
    }

    /// Reads a big-endian `i32`
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.take(4)?.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(self.take(4)?.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.take(8)?.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(self.take(8)?.get_u64())
    }

    /// Reads a non-negative `i32` length prefix
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| DecodeError::NegativeLength(len))
    }

    /// Reads a length-prefixed blob
    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_len()?;
        self.take(len)
    }

    /// Fails if any bytes are left unread
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

/// A value that can be written with [`Writer`]
pub trait Encode {
    fn encode(&self, writer: &mut Writer);
}

/// A value that can be read back with [`Reader`]
pub trait Decode: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError>;
}

macro_rules! impl_codec_for_int {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, writer: &mut Writer) {
                    writer.$write(*self);
                }
            }

            impl Decode for $ty {
                fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
                    reader.$read()
                }
            }
        )*
    };
}

impl_codec_for_int! {
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    i32 => write_i32, read_i32;
    u32 => write_u32, read_u32;
    i64 => write_i64, read_i64;
    u64 => write_u64, read_u64;
}

impl Encode for bool {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u8(u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match reader.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }
}

impl Encode for f32 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u32(self.to_bits());
    }
}

impl Decode for f32 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(f32::from_bits(reader.read_u32()?))
    }
}

impl Encode for f64 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u64(self.to_bits());
    }
}

impl Decode for f64 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(f64::from_bits(reader.read_u64()?))
    }
}

impl Encode for String {
    fn encode(&self, writer: &mut Writer) {
        writer.write_bytes(self.as_bytes());
    }
}

impl Decode for String {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let raw = reader.read_bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}

impl Encode for Bytes {
    fn encode(&self, writer: &mut Writer) {
        writer.write_bytes(self);
    }
}

impl Decode for Bytes {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Bytes::copy_from_slice(reader.read_bytes()?))
    }
}

/// Encodes a single value into a fresh buffer
pub fn to_bytes<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut writer = Writer::new();
    value.encode(&mut writer);
    writer.into_vec()
}

/// Decodes a single value that must span the whole buffer
pub fn from_bytes<T: Decode>(data: &[u8]) -> Result<T, DecodeError> {
    let mut reader = Reader::new(data);
    let value = T::decode(&mut reader)?;
    reader.finish()?;
    Ok(value)
}
