use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_BODY_SIZE;
use crate::core::message::{Header, Message, HEADER_SIZE};
use crate::error::{Result, TransportError};

/// Where the decoder is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    ReadingHeader,
    ReadingBody(Header),
}

/// Two-phase frame codec: the header must be complete before the body
/// length is known, so decoding first waits for [`HEADER_SIZE`] bytes and
/// then for exactly `body_size` more.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: DecodeState,
    max_body_size: usize,
}

impl FrameCodec {
    pub fn new(max_body_size: usize) -> Self {
        Self {
            state: DecodeState::ReadingHeader,
            max_body_size,
        }
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// True while a frame has been started but not completed
    pub fn is_mid_frame(&self) -> bool {
        matches!(self.state, DecodeState::ReadingBody(_))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_BODY_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match self.state {
                DecodeState::ReadingHeader => {
                    if src.len() < HEADER_SIZE {
                        src.reserve(HEADER_SIZE - src.len());
                        return Ok(None);
                    }

                    let header = Header::from_bytes(&src[..HEADER_SIZE])?;
                    let body_size = header.body_size as usize;
                    if body_size > self.max_body_size {
                        return Err(TransportError::OversizedBody(body_size));
                    }

                    let _ = src.split_to(HEADER_SIZE);
                    self.state = DecodeState::ReadingBody(header);
                }
                DecodeState::ReadingBody(header) => {
                    let body_size = header.body_size as usize;
                    if src.len() < body_size {
                        src.reserve(body_size - src.len());
                        return Ok(None);
                    }

                    let body = src.split_to(body_size);
                    self.state = DecodeState::ReadingHeader;
                    return Message::from_parts(header, body).map(Some);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() && !self.is_mid_frame() => Ok(None),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended mid-frame").into()),
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let body_size = item.body_size() as usize;
        if body_size > self.max_body_size {
            return Err(TransportError::OversizedBody(body_size));
        }

        item.encode_into(dst);
        Ok(())
    }
}
