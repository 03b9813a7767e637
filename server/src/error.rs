//! Error types for the server crate.

use shared::opcodes::ProtocolId;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Problems loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Startup and service registration failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("port {port} cannot host {protocol:?}: a port with a server-sends-first protocol holds nothing else")]
    PortConflict { port: u16, protocol: ProtocolId },

    #[error("protocol {protocol:?} is already registered on port {port}")]
    DuplicateProtocol { port: u16, protocol: ProtocolId },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no services could be bound")]
    NoServicesBound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
