use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::v1::{Message, error::ProtocolError};

/// Hard ceiling on a single frame body. A peer announcing more than this is
/// broken or hostile and the connection is failed.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A growable byte buffer with typed big-endian append/extract and a read
/// cursor. One `FrameBuffer` holds exactly one frame body.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(buf: Vec<u8>) -> Self {
        FrameBuffer { buf, pos: 0 }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    pub fn get_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.get_u8()? == 1)
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_u32(value as u32);
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.get_u32()? as i32)
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn get_i64(&mut self) -> Result<i64, ProtocolError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(buf))
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn get_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?.to_vec();
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidEncoding)
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Encode an ordered set: a count then each value, in the order given.
    pub fn put_i32_set(&mut self, values: &[i32]) {
        self.put_u32(values.len() as u32);
        for value in values {
            self.put_i32(*value);
        }
    }

    /// Decode an ordered set, dropping duplicates while keeping the order in
    /// which values first appear on the wire.
    pub fn get_i32_set(&mut self) -> Result<Vec<i32>, ProtocolError> {
        let count = self.get_u32()?;
        let mut values: Vec<i32> = Vec::new();
        for _ in 0..count {
            let value = self.get_i32()?;
            if !values.contains(&value) {
                values.push(value);
            }
        }
        Ok(values)
    }
}

/// Length-prefixed framer: accumulates raw socket bytes and yields whole
/// frame bodies. A frame on the wire is `[u32 big-endian length][body]`, the
/// length covering only the body.
///
/// Once `has_frame` reports `FrameTooLarge` the reader is poisoned; the
/// connection it feeds must be dropped.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Whether a whole frame is buffered. Fails when the frontmost frame
    /// announces a body larger than [`MAX_FRAME_SIZE`].
    pub fn has_frame(&self) -> Result<bool, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(false);
        }
        let len = peek_len(&self.buf);
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(self.buf.len() >= 4 + len)
    }

    /// Detach the frontmost frame body. Call only after `has_frame`.
    pub fn read(&mut self) -> Result<FrameBuffer, ProtocolError> {
        if !self.has_frame()? {
            return Err(ProtocolError::Truncated);
        }
        let len = self.buf.get_u32() as usize;
        let body = self.buf.split_to(len);
        Ok(FrameBuffer::from_vec(body.to_vec()))
    }
}

fn peek_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
}

/// Tokio codec speaking the framed message protocol: each frame carries one
/// serialized [`Message`].
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek the length without consuming the header.
        let len = peek_len(src);
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_SIZE,
            });
        }
        if src.len() < 4 + len {
            return Ok(None);
        }

        let len = src.get_u32() as usize;
        let body = src.split_to(len);
        let mut frame = FrameBuffer::from_vec(body.to_vec());
        Ok(Some(Message::decode(&mut frame)?))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = item.to_frame().into_vec();
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
