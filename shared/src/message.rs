//! Fixed-capacity message buffer with a typed cursor.
//!
//! Every frame on the wire is `[length:u16][body]`. A [`NetworkMessage`]
//! owns one buffer large enough for the biggest legal frame and is reused
//! for every read on a connection. All multi-byte values are little-endian,
//! strings are a `u16` length followed by the raw bytes.

use thiserror::Error;

/// Total size of a message buffer, header included.
pub const NETWORKMESSAGE_MAXSIZE: usize = 15340;
/// Size of the length prefix in front of every frame.
pub const HEADER_LENGTH: usize = 2;
/// Size of the optional Adler-32 checksum field.
pub const CHECKSUM_LENGTH: usize = 4;
/// XTEA block size; encrypted bodies are padded to a multiple of this.
pub const XTEA_MULTIPLE: usize = 8;
/// Largest body a message may carry, leaving room for header, checksum and padding.
pub const MAX_BODY_LENGTH: usize =
    NETWORKMESSAGE_MAXSIZE - HEADER_LENGTH - CHECKSUM_LENGTH - XTEA_MULTIPLE;
/// Largest payload an outgoing message accepts. A sealed frame carrying
/// this much still passes the receiver's body size check.
pub const MAX_PROTOCOL_BODY_LENGTH: usize = MAX_BODY_LENGTH - 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("write of {requested} bytes at {position} exceeds message capacity")]
    Overflow { position: usize, requested: usize },

    #[error("read of {requested} bytes at {position} exceeds message length {length}")]
    Underflow {
        position: usize,
        requested: usize,
        length: usize,
    },

    #[error("string of {0} bytes is too long to encode")]
    StringTooLong(usize),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

/// A reusable message buffer.
///
/// `start..start + length` is the logical content; `position` is the
/// cursor used both for reading and appending.
pub struct NetworkMessage {
    pub(crate) buffer: Box<[u8]>,
    pub(crate) start: usize,
    pub(crate) length: usize,
    pub(crate) position: usize,
    pub(crate) capacity: usize,
}

impl NetworkMessage {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; NETWORKMESSAGE_MAXSIZE].into_boxed_slice(),
            start: 0,
            length: 0,
            position: HEADER_LENGTH,
            capacity: MAX_BODY_LENGTH,
        }
    }

    /// Builds an incoming message from a complete frame (`[length][body]`).
    ///
    /// Used by clients and tests; the server reads straight into
    /// [`header_mut`](Self::header_mut) and [`body_mut`](Self::body_mut).
    pub fn from_frame(frame: &[u8]) -> Result<Self, MessageError> {
        let mut msg = Self::new();
        if frame.len() < HEADER_LENGTH || frame.len() > NETWORKMESSAGE_MAXSIZE {
            return Err(MessageError::Overflow {
                position: 0,
                requested: frame.len(),
            });
        }
        msg.buffer[..frame.len()].copy_from_slice(frame);
        msg.length = frame.len();
        msg.position = HEADER_LENGTH;
        Ok(msg)
    }

    /// Prepares the buffer for the next incoming frame.
    pub fn reset(&mut self) {
        self.start = 0;
        self.length = 0;
        self.position = HEADER_LENGTH;
    }

    /// Slot the 2-byte length prefix is read into.
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..HEADER_LENGTH]
    }

    /// Reads the little-endian body length from the header slot.
    pub fn decode_header(&mut self) -> usize {
        let size = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
        self.length = HEADER_LENGTH;
        self.position = HEADER_LENGTH;
        size
    }

    /// Slot for a body of `size` bytes, directly after the header.
    ///
    /// The caller must have validated `size` against the buffer capacity.
    pub fn body_mut(&mut self, size: usize) -> &mut [u8] {
        self.length = HEADER_LENGTH + size;
        &mut self.buffer[HEADER_LENGTH..HEADER_LENGTH + size]
    }

    /// Number of bytes between the cursor and the end of the content.
    pub fn remaining(&self) -> usize {
        (self.start + self.length).saturating_sub(self.position)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes from the cursor to the end of the content.
    pub fn unread(&self) -> &[u8] {
        &self.buffer[self.position..self.start + self.length]
    }

    pub(crate) fn unread_mut(&mut self) -> &mut [u8] {
        let end = self.start + self.length;
        &mut self.buffer[self.position..end]
    }

    /// Shrinks the content so that `len` bytes remain after the cursor.
    pub fn set_remaining(&mut self, len: usize) -> Result<(), MessageError> {
        if len > self.remaining() {
            return Err(self.underflow(len));
        }
        self.length = self.position + len - self.start;
        Ok(())
    }

    pub fn can_read(&self, size: usize) -> bool {
        size <= self.remaining()
    }

    pub fn can_add(&self, size: usize) -> bool {
        self.position + size <= self.capacity
    }

    fn underflow(&self, requested: usize) -> MessageError {
        MessageError::Underflow {
            position: self.position,
            requested,
            length: self.length,
        }
    }

    fn take(&mut self, size: usize) -> Result<&[u8], MessageError> {
        if !self.can_read(size) {
            return Err(self.underflow(size));
        }
        let from = self.position;
        self.position += size;
        Ok(&self.buffer[from..from + size])
    }

    pub fn get_u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, MessageError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, MessageError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, MessageError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_i32(&mut self) -> Result<i32, MessageError> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_bytes(&mut self, size: usize) -> Result<Vec<u8>, MessageError> {
        Ok(self.take(size)?.to_vec())
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], MessageError> {
        let mut raw = [0u8; N];
        raw.copy_from_slice(self.take(N)?);
        Ok(raw)
    }

    pub fn get_string(&mut self) -> Result<String, MessageError> {
        let len = self.get_u16()? as usize;
        if !self.can_read(len) {
            self.position -= 2;
            return Err(self.underflow(len + 2));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| MessageError::InvalidUtf8)
    }

    pub fn skip(&mut self, count: usize) -> Result<(), MessageError> {
        self.take(count).map(|_| ())
    }

    /// Moves the cursor back by `count` bytes.
    pub fn rewind(&mut self, count: usize) -> Result<(), MessageError> {
        if count > self.position - self.start {
            return Err(self.underflow(count));
        }
        self.position -= count;
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), MessageError> {
        if !self.can_add(bytes.len()) {
            return Err(MessageError::Overflow {
                position: self.position,
                requested: bytes.len(),
            });
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        let end = self.position - self.start;
        if end > self.length {
            self.length = end;
        }
        Ok(())
    }

    pub fn add_u8(&mut self, value: u8) -> Result<(), MessageError> {
        self.put(&[value])
    }

    pub fn add_u16(&mut self, value: u16) -> Result<(), MessageError> {
        self.put(&value.to_le_bytes())
    }

    pub fn add_u32(&mut self, value: u32) -> Result<(), MessageError> {
        self.put(&value.to_le_bytes())
    }

    pub fn add_u64(&mut self, value: u64) -> Result<(), MessageError> {
        self.put(&value.to_le_bytes())
    }

    pub fn add_i32(&mut self, value: i32) -> Result<(), MessageError> {
        self.put(&value.to_le_bytes())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<(), MessageError> {
        self.put(bytes)
    }

    /// Appends a length-prefixed string. Nothing is written on failure.
    pub fn add_string(&mut self, value: &str) -> Result<(), MessageError> {
        let len = value.len();
        if len > u16::MAX as usize {
            return Err(MessageError::StringTooLong(len));
        }
        if !self.can_add(len + 2) {
            return Err(MessageError::Overflow {
                position: self.position,
                requested: len + 2,
            });
        }
        self.add_u16(len as u16)?;
        self.put(value.as_bytes())
    }

    /// Appends `count` copies of `fill`.
    pub fn add_padding(&mut self, count: usize, fill: u8) -> Result<(), MessageError> {
        if self.position + count > NETWORKMESSAGE_MAXSIZE {
            return Err(MessageError::Overflow {
                position: self.position,
                requested: count,
            });
        }
        self.buffer[self.position..self.position + count].fill(fill);
        self.position += count;
        self.length = self.position - self.start;
        Ok(())
    }

    /// Drops everything written after logical offset `len`.
    pub fn truncate(&mut self, len: usize) {
        if len < self.length {
            self.length = len;
            self.position = self.start + len;
        }
    }
}

impl Default for NetworkMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NetworkMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMessage")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("position", &self.position)
            .finish()
    }
}
