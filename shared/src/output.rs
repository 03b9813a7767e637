//! Outgoing messages with header space reserved in front of the payload.

use crate::adler::adler_checksum;
use crate::message::{MessageError, NetworkMessage, MAX_PROTOCOL_BODY_LENGTH};
use std::ops::{Deref, DerefMut};

/// Bytes reserved in front of the payload: inner length, checksum, outer length.
pub const INITIAL_BUFFER_POSITION: usize = 8;

/// A [`NetworkMessage`] that is written front to back and framed afterwards.
///
/// Handlers append the payload, then the sealing code prepends the inner
/// length (encrypted frames), the checksum and finally the outer length, so
/// the outer length is always the first field on the wire.
pub struct OutputMessage {
    msg: NetworkMessage,
}

impl OutputMessage {
    pub fn new() -> Self {
        let mut msg = NetworkMessage::new();
        msg.start = INITIAL_BUFFER_POSITION;
        msg.position = INITIAL_BUFFER_POSITION;
        msg.length = 0;
        msg.capacity = INITIAL_BUFFER_POSITION + MAX_PROTOCOL_BODY_LENGTH;
        Self { msg }
    }

    /// Clears the payload so the buffer can be reused.
    pub fn clear(&mut self) {
        self.msg.start = INITIAL_BUFFER_POSITION;
        self.msg.position = INITIAL_BUFFER_POSITION;
        self.msg.length = 0;
    }

    fn add_header(&mut self, bytes: &[u8]) -> Result<(), MessageError> {
        if self.msg.start < bytes.len() {
            return Err(MessageError::Overflow {
                position: self.msg.start,
                requested: bytes.len(),
            });
        }
        self.msg.start -= bytes.len();
        let start = self.msg.start;
        self.msg.buffer[start..start + bytes.len()].copy_from_slice(bytes);
        self.msg.length += bytes.len();
        Ok(())
    }

    /// Prepends the current length as a `u16`.
    pub fn write_message_length(&mut self) -> Result<(), MessageError> {
        let length = self.msg.length as u16;
        self.add_header(&length.to_le_bytes())
    }

    /// Prepends the optional checksum, then the outer length.
    ///
    /// Must be called exactly once, after every payload write.
    pub fn add_crypto_header(&mut self, add_checksum: bool) -> Result<(), MessageError> {
        if add_checksum {
            let checksum = adler_checksum(self.content());
            self.add_header(&checksum.to_le_bytes())?;
        }
        self.write_message_length()
    }

    /// The logical content, from the first prepended byte to the last payload byte.
    pub fn content(&self) -> &[u8] {
        &self.msg.buffer[self.msg.start..self.msg.start + self.msg.length]
    }

    pub(crate) fn content_mut(&mut self) -> &mut [u8] {
        let start = self.msg.start;
        let end = start + self.msg.length;
        &mut self.msg.buffer[start..end]
    }

    /// The bytes to put on the wire once the message has been sealed.
    pub fn frame(&self) -> &[u8] {
        self.content()
    }
}

impl Default for OutputMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for OutputMessage {
    type Target = NetworkMessage;

    fn deref(&self) -> &NetworkMessage {
        &self.msg
    }
}

impl DerefMut for OutputMessage {
    fn deref_mut(&mut self) -> &mut NetworkMessage {
        &mut self.msg
    }
}

impl std::fmt::Debug for OutputMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputMessage").field("msg", &self.msg).finish()
    }
}
