//! Header and message types for the wire format.
//!
//! A message body is used as a stack of little-endian `i32` values: the
//! writer pushes fields in one order and the reader pops them back in the
//! exact reverse order.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Encoded size of a [`Header`] in bytes
pub const HEADER_SIZE: usize = 8;

/// Size of one body integer in bytes
pub const INT_SIZE: usize = std::mem::size_of::<i32>();

/// Fixed-size frame header: message type followed by body length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub type_id: u32,
    pub body_size: u32,
}

impl Header {
    pub fn new(type_id: u32, body_size: u32) -> Self {
        Self { type_id, body_size }
    }

    /// Encode as `[type_id LE (4)] [body_size LE (4)]`
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.type_id.to_le_bytes());
        out[4..].copy_from_slice(&self.body_size.to_le_bytes());
        out
    }

    /// Decode from the first [`HEADER_SIZE`] bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(TransportError::InvalidHeader);
        }

        let type_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let body_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { type_id, body_size })
    }
}

/// One frame: a header plus its body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    header: Header,
    body: BytesMut,
}

impl Message {
    /// Create an empty message of the given type
    pub fn new(type_id: u32) -> Self {
        Self {
            header: Header::new(type_id, 0),
            body: BytesMut::new(),
        }
    }

    /// Rebuild a message from a decoded header and body.
    ///
    /// Fails if the header's declared size disagrees with the body.
    pub fn from_parts(header: Header, body: BytesMut) -> Result<Self> {
        if header.body_size as usize != body.len() {
            return Err(TransportError::BodySizeMismatch {
                declared: header.body_size as usize,
                actual: body.len(),
            });
        }
        Ok(Self { header, body })
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn type_id(&self) -> u32 {
        self.header.type_id
    }

    pub fn set_type_id(&mut self, type_id: u32) {
        self.header.type_id = type_id;
    }

    pub fn body_size(&self) -> u32 {
        self.header.body_size
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Total encoded length, header included
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Append an integer to the tail of the body
    pub fn push_int(&mut self, value: i32) {
        self.body.put_i32_le(value);
        self.header.body_size += INT_SIZE as u32;
    }

    /// Remove the most recently pushed integer from the tail of the body
    pub fn pop_int(&mut self) -> Result<i32> {
        let len = self.body.len();
        if len < INT_SIZE {
            return Err(TransportError::ShortBody { len });
        }

        let tail = self.body.split_off(len - INT_SIZE);
        self.header.body_size -= INT_SIZE as u32;
        Ok(i32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]))
    }

    /// Append the encoded frame (header then body) to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_len());
        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.body);
    }

    /// Encode the frame into a fresh buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}
