//! # Gatehouse Server Library
//!
//! The networking and session layer of a game server: it accepts TCP
//! connections, frames and optionally checksums and encrypts messages,
//! routes each connection to a session protocol and funnels all session
//! logic through a single dispatcher thread.
//!
//! ## Threads
//!
//! - **I/O**: a tokio runtime runs every accept loop and the read and write
//!   task of each connection. Nothing on it touches session or world state.
//! - **Dispatcher**: a worker thread that runs queued tasks one at a time,
//!   in order. Protocol handlers parse on the I/O thread and queue the rest.
//! - **Scheduler**: a worker thread that hands delayed tasks to the
//!   dispatcher when they are due, e.g. the batched output flush.
//!
//! ## Message flow
//!
//! A connection reads `[length][body]`, checks the packet rate, verifies the
//! checksum and gives the message to its [`protocol::Protocol`]. The first
//! message picks the protocol by its identifier byte. Replies are written
//! into a per-protocol buffer that [`output_pool::OutputMessagePool`]
//! flushes for every session at once, once per flush interval.
//!
//! ## Protocols
//!
//! | Protocol | Identifier | Checksum | Encryption |
//! |----------|-----------:|----------|------------|
//! | Login    | `0x01`     | required | no         |
//! | Game     | `0x0A`     | required | XTEA after key exchange |
//! | Admin    | `0xFE`     | optional | no         |
//! | Status   | `0xFF`     | optional | no         |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use tokio::runtime::Handle;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::default())?;
//!     server.start(&Handle::current())?;
//!     server.run_until_shutdown().await;
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

pub mod accounts;
pub mod bans;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod network;
pub mod output_pool;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod world;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use error::{ConfigError, ServerError};
pub use network::Server;
