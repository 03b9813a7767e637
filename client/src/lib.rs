//! # Gatehouse Client Library
//!
//! A headless client for every service the server offers. It speaks the
//! same frames as the server through the `shared` crate and is what the
//! integration tests and the `client` binary drive.
//!
//! ## Modules
//!
//! - `network`: one framed TCP connection with its checksum and encryption policy
//! - `status`: server info and player list queries
//! - `login`: logging in for a session token, creating accounts
//! - `game`: key exchange, entering the world, chat and movement
//! - `admin`: authenticated administration commands
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::game::{GameClient, GameEvent};
//! use client::login;
//!
//! # async fn run() -> Result<(), client::ClientError> {
//! let addr = "127.0.0.1:7171".parse().unwrap();
//! let list = login::login(addr, "alice", "secret").await?;
//!
//! let game_addr = format!("{}:{}", list.game_host, list.game_port).parse().unwrap();
//! let mut game = GameClient::enter(game_addr, "alice", list.token, &list.characters[0]).await?;
//! game.say("hello").await?;
//! let echo = game.wait_for(|e| matches!(e, GameEvent::Chat { .. })).await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod error;
pub mod game;
pub mod login;
pub mod network;
pub mod status;

pub use error::ClientError;
