//! # Shared wire format
//!
//! Everything both ends of a connection need to agree on: the message
//! buffers, the frame layout, checksums, encryption, key agreement and the
//! protocol vocabulary.
//!
//! ## Frame layout
//!
//! ```text
//! [length:u16][checksum:u32, optional][body]
//! ```
//!
//! Integers are little-endian and strings carry a `u16` length prefix.
//! Whether a frame has a checksum and whether its body is XTEA encrypted is
//! decided per protocol, see [`codec::FramePolicy`].
//!
//! ## Modules
//!
//! - `message`: [`NetworkMessage`], the reusable read/write buffer
//! - `output`: [`OutputMessage`], a buffer with header space in front
//! - `adler`, `xtea`: checksum and block cipher
//! - `dh`: the key agreement that produces per-connection XTEA keys
//! - `codec`: sealing and opening frames
//! - `opcodes`: protocol identifiers, opcodes and [`ErrorCode`]

pub mod adler;
pub mod codec;
pub mod dh;
pub mod message;
pub mod opcodes;
pub mod output;
pub mod xtea;

pub use adler::adler_checksum;
pub use codec::{CodecError, FramePolicy};
pub use dh::{DhKeyPair, DH_KEY_LENGTH};
pub use message::{
    MessageError, NetworkMessage, CHECKSUM_LENGTH, HEADER_LENGTH, MAX_BODY_LENGTH,
    MAX_PROTOCOL_BODY_LENGTH, NETWORKMESSAGE_MAXSIZE, XTEA_MULTIPLE,
};
pub use opcodes::{ErrorCode, ProtocolId, PROTOCOL_VERSION};
pub use output::{OutputMessage, INITIAL_BUFFER_POSITION};
pub use xtea::XteaKey;
