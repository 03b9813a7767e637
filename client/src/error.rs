use shared::{CodecError, ErrorCode, MessageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Message(#[from] MessageError),

    #[error("undecodable frame: {0}")]
    Codec(#[from] CodecError),

    #[error("server closed the connection")]
    Closed,

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("frame of {0} bytes is out of range")]
    BadFrameLength(usize),

    #[error("frame failed its checksum")]
    BadChecksum,

    #[error("unexpected reply opcode {0:#04x}")]
    UnexpectedReply(u8),

    #[error("server rejected the key exchange")]
    InvalidKey,

    #[error("server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },
}

impl ClientError {
    /// The server's error code, if this is an error reply.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
