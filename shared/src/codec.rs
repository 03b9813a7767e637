//! Frame sealing and opening shared by server and client.
//!
//! Sealed frame layout:
//!
//! ```text
//! [length:u16][checksum:u32, optional][body]
//! body = payload                                      (plain)
//! body = XTEA([inner length:u16][payload][padding])   (encrypted)
//! ```
//!
//! The checksum covers every byte after it, so it is computed over the
//! ciphertext when encryption is on.

use crate::adler::adler_checksum;
use crate::message::{MessageError, NetworkMessage, CHECKSUM_LENGTH, XTEA_MULTIPLE};
use crate::output::OutputMessage;
use crate::xtea::{self, XteaKey};
use thiserror::Error;

/// Fill byte appended to reach the XTEA block size.
pub const PADDING_BYTE: u8 = 0x33;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encrypted body of {0} bytes is not a multiple of the block size")]
    BadBlockLength(usize),

    #[error("inner length {inner} exceeds decrypted body of {available} bytes")]
    BadInnerLength { inner: usize, available: usize },

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Frame policy for one direction of a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramePolicy {
    pub checksum: bool,
    pub key: Option<XteaKey>,
}

impl FramePolicy {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn checksummed() -> Self {
        Self {
            checksum: true,
            key: None,
        }
    }

    pub fn encrypted(key: XteaKey) -> Self {
        Self {
            checksum: true,
            key: Some(key),
        }
    }
}

/// Pads and encrypts the message content in place, inner length first.
pub fn encrypt_message(msg: &mut OutputMessage, key: &XteaKey) -> Result<(), MessageError> {
    msg.write_message_length()?;
    let rest = msg.len() % XTEA_MULTIPLE;
    if rest != 0 {
        msg.add_padding(XTEA_MULTIPLE - rest, PADDING_BYTE)?;
    }
    xtea::encrypt(msg.content_mut(), key);
    Ok(())
}

/// Turns a finished payload into a wire frame according to `policy`.
pub fn seal(msg: &mut OutputMessage, policy: &FramePolicy) -> Result<(), MessageError> {
    if let Some(key) = &policy.key {
        encrypt_message(msg, key)?;
    }
    msg.add_crypto_header(policy.checksum)
}

/// Reads a leading checksum if it matches the rest of the body.
///
/// On mismatch the cursor is left where it was, since the four bytes may
/// simply be payload from a peer that does not send checksums.
pub fn verify_checksum(msg: &mut NetworkMessage) -> bool {
    if msg.remaining() < CHECKSUM_LENGTH {
        return false;
    }
    let computed = adler_checksum(&msg.unread()[CHECKSUM_LENGTH..]);
    match msg.get_u32() {
        Ok(received) if received == computed => true,
        Ok(_) => {
            let _ = msg.rewind(CHECKSUM_LENGTH);
            false
        }
        Err(_) => false,
    }
}

/// Decrypts the unread part of `msg` and limits it to the inner length.
pub fn decrypt_message(msg: &mut NetworkMessage, key: &XteaKey) -> Result<(), CodecError> {
    let available = msg.remaining();
    if available == 0 || available % XTEA_MULTIPLE != 0 {
        return Err(CodecError::BadBlockLength(available));
    }
    xtea::decrypt(msg.unread_mut(), key);
    let inner = msg.get_u16()? as usize;
    let available = msg.remaining();
    if inner > available {
        return Err(CodecError::BadInnerLength { inner, available });
    }
    msg.set_remaining(inner)?;
    Ok(())
}

/// Opens a received frame whose header has already been consumed.
///
/// A checksum is required when the policy asks for one.
pub fn open(msg: &mut NetworkMessage, policy: &FramePolicy) -> Result<bool, CodecError> {
    let checksummed = verify_checksum(msg);
    if policy.checksum && !checksummed {
        return Ok(false);
    }
    if let Some(key) = &policy.key {
        decrypt_message(msg, key)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HEADER_LENGTH, MAX_PROTOCOL_BODY_LENGTH};

    fn key() -> XteaKey {
        XteaKey::new([11, 22, 33, 44])
    }

    fn sealed(payload: &[u8], policy: &FramePolicy) -> Vec<u8> {
        let mut out = OutputMessage::new();
        out.add_bytes(payload).unwrap();
        seal(&mut out, policy).unwrap();
        out.frame().to_vec()
    }

    fn received(frame: &[u8]) -> NetworkMessage {
        NetworkMessage::from_frame(frame).unwrap()
    }

    #[test]
    fn test_plain_round_trip() {
        let frame = sealed(b"status", &FramePolicy::plain());
        let mut msg = received(&frame);
        assert!(open(&mut msg, &FramePolicy::plain()).unwrap());
        assert_eq!(msg.unread(), b"status");
    }

    #[test]
    fn test_round_trip_over_payload_sizes() {
        let policies = [FramePolicy::checksummed(), FramePolicy::encrypted(key())];
        for policy in &policies {
            for size in [0usize, 1, 3, 4, 5, 6, 7, 8, 9, 255, 1024, MAX_PROTOCOL_BODY_LENGTH] {
                let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
                let frame = sealed(&payload, policy);

                let declared = u16::from_le_bytes([frame[0], frame[1]]) as usize;
                assert_eq!(declared, frame.len() - HEADER_LENGTH);

                let mut msg = received(&frame);
                assert!(open(&mut msg, policy).unwrap(), "payload of {} bytes", size);
                assert_eq!(msg.unread(), &payload[..], "payload of {} bytes", size);
            }
        }
    }

    #[test]
    fn test_empty_checksummed_frame() {
        let frame = sealed(&[], &FramePolicy::checksummed());
        assert_eq!(frame, vec![4, 0, 1, 0, 0, 0]);

        let mut msg = received(&frame);
        assert!(open(&mut msg, &FramePolicy::checksummed()).unwrap());
        assert_eq!(msg.remaining(), 0);
    }

    #[test]
    fn test_padding_is_never_payload() {
        let policy = FramePolicy::encrypted(key());
        let frame = sealed(&[1, 2, 3], &policy);
        // length + checksum + one 8-byte block (2 inner length + 3 payload + 3 padding)
        assert_eq!(frame.len(), 2 + 4 + 8);

        let mut msg = received(&frame);
        open(&mut msg, &policy).unwrap();
        assert_eq!(msg.get_bytes(3).unwrap(), vec![1, 2, 3]);
        assert!(msg.get_u8().is_err());
    }

    #[test]
    fn test_checksum_mismatch_rewinds() {
        let frame = sealed(b"abcdefgh", &FramePolicy::checksummed());
        let mut tampered = frame.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;

        let mut msg = received(&tampered);
        let before = msg.position();
        assert!(!verify_checksum(&mut msg));
        assert_eq!(msg.position(), before);

        let mut msg = received(&frame);
        assert!(verify_checksum(&mut msg));
        assert_eq!(msg.unread(), b"abcdefgh");
    }

    #[test]
    fn test_required_checksum_rejects_tampered_frame() {
        let policy = FramePolicy::encrypted(key());
        let mut frame = sealed(b"attack 7", &policy);
        frame[9] ^= 0x10;
        let mut msg = received(&frame);
        assert!(!open(&mut msg, &policy).unwrap());
    }

    #[test]
    fn test_decrypt_rejects_partial_block() {
        let mut msg = received(&[5, 0, 1, 2, 3, 4, 5]);
        assert_eq!(
            decrypt_message(&mut msg, &key()),
            Err(CodecError::BadBlockLength(5))
        );
    }

    #[test]
    fn test_decrypt_rejects_oversized_inner_length() {
        let mut block = [0xFFu8, 0xFF, 0, 0, 0, 0, 0, 0];
        xtea::encrypt(&mut block, &key());
        let mut frame = vec![8, 0];
        frame.extend_from_slice(&block);

        let mut msg = received(&frame);
        assert!(matches!(
            decrypt_message(&mut msg, &key()),
            Err(CodecError::BadInnerLength { inner: 0xFFFF, .. })
        ));
    }

    #[test]
    fn test_short_body_has_no_checksum() {
        let mut msg = received(&[3, 0, 1, 0, 0]);
        assert!(!verify_checksum(&mut msg));
        assert_eq!(msg.remaining(), 3);
    }
}
