//! Game session: key exchange, entering the world and the encrypted
//! message stream that follows.

use crate::error::{ClientError, Result};
use crate::network::{read_error, Connection};
use log::{debug, info};
use shared::opcodes::{GameReply, GameRequest, ProtocolId};
use shared::{DhKeyPair, MessageError, NetworkMessage, OutputMessage, DH_KEY_LENGTH, PROTOCOL_VERSION};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

/// Something the server told us about the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    EnterWorld { id: u32, name: String, x: i32, y: i32 },
    PlayerJoined { id: u32, name: String, x: i32, y: i32 },
    PlayerLeft { id: u32 },
    PlayerMoved { id: u32, x: i32, y: i32 },
    Chat { sender: String, text: String },
    ServerMessage(String),
    Pong(u32),
}

/// A character that has entered the world.
pub struct GameClient {
    connection: Connection,
    player_id: u32,
    name: String,
    position: (i32, i32),
    events: VecDeque<GameEvent>,
}

impl GameClient {
    /// Performs the key exchange and waits until the character is in the world.
    pub async fn enter(
        addr: SocketAddr,
        account: &str,
        token: u64,
        character: &str,
    ) -> Result<Self> {
        let mut connection = Connection::connect(addr).await?;
        let keys = DhKeyPair::generate();
        connection
            .send_first(ProtocolId::Game, |out| {
                out.add_u16(PROTOCOL_VERSION)?;
                out.add_bytes(&keys.public_key())?;
                out.add_string(account)?;
                out.add_u64(token)?;
                out.add_string(character)
            })
            .await?;

        let mut msg = connection.recv().await?;
        let opcode = msg.get_u8()?;
        match GameReply::from_u8(opcode) {
            Some(GameReply::KeyExchange) => {}
            Some(GameReply::Error) => return Err(read_error(&mut msg)),
            _ => return Err(ClientError::UnexpectedReply(opcode)),
        }
        let server_public = msg.get_array::<DH_KEY_LENGTH>()?;
        let key = keys
            .shared_key(&server_public)
            .ok_or(ClientError::InvalidKey)?;
        connection.enable_encryption(key);
        debug!("Key exchange with {} complete", addr);

        let mut client = Self {
            connection,
            player_id: 0,
            name: String::new(),
            position: (0, 0),
            events: VecDeque::new(),
        };
        loop {
            match client.next_event().await? {
                GameEvent::EnterWorld { id, name, x, y } => {
                    info!("Entered the world as {} ({}) at ({}, {})", name, id, x, y);
                    client.player_id = id;
                    client.name = name;
                    client.position = (x, y);
                    return Ok(client);
                }
                other => debug!("Ignoring {:?} before entering the world", other),
            }
        }
    }

    pub fn player_id(&self) -> u32 {
        self.player_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last position the server confirmed for us.
    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    async fn request<F>(&mut self, opcode: GameRequest, write: F) -> Result<()>
    where
        F: FnOnce(&mut OutputMessage) -> std::result::Result<(), MessageError>,
    {
        self.connection
            .send(|out| {
                out.add_u8(opcode.as_u8())?;
                write(out)
            })
            .await
    }

    pub async fn ping(&mut self, tick: u32) -> Result<()> {
        self.request(GameRequest::Ping, |out| out.add_u32(tick)).await
    }

    pub async fn move_to(&mut self, x: i32, y: i32) -> Result<()> {
        self.request(GameRequest::Move, |out| {
            out.add_i32(x)?;
            out.add_i32(y)
        })
        .await
    }

    pub async fn say(&mut self, text: &str) -> Result<()> {
        self.request(GameRequest::Chat, |out| out.add_string(text)).await
    }

    pub async fn logout(&mut self) -> Result<()> {
        self.request(GameRequest::Logout, |_| Ok(())).await
    }

    /// Seals a payload with the session key without sending it.
    pub fn seal<F>(&self, write: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&mut OutputMessage) -> std::result::Result<(), MessageError>,
    {
        self.connection.seal(write)
    }

    /// Sends bytes as they are, bypassing framing and encryption.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.connection.send_raw(bytes).await
    }

    /// Next event from the server. One frame may carry several.
    pub async fn next_event(&mut self) -> Result<GameEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                if let GameEvent::PlayerMoved { id, x, y } = event {
                    if id == self.player_id {
                        self.position = (x, y);
                    }
                }
                return Ok(event);
            }
            let mut msg = self.connection.recv().await?;
            self.parse_frame(&mut msg)?;
        }
    }

    /// Skips events until one matches `wanted`.
    pub async fn wait_for<F>(&mut self, wanted: F) -> Result<GameEvent>
    where
        F: Fn(&GameEvent) -> bool,
    {
        loop {
            let event = self.next_event().await?;
            if wanted(&event) {
                return Ok(event);
            }
        }
    }

    /// Waits until the server closes the session.
    pub async fn wait_closed(&mut self) -> Result<()> {
        self.connection.wait_closed().await
    }

    fn parse_frame(&mut self, msg: &mut NetworkMessage) -> Result<()> {
        while msg.remaining() > 0 {
            let opcode = msg.get_u8()?;
            let event = match GameReply::from_u8(opcode) {
                Some(GameReply::EnterWorld) => GameEvent::EnterWorld {
                    id: msg.get_u32()?,
                    name: msg.get_string()?,
                    x: msg.get_i32()?,
                    y: msg.get_i32()?,
                },
                Some(GameReply::PlayerJoined) => GameEvent::PlayerJoined {
                    id: msg.get_u32()?,
                    name: msg.get_string()?,
                    x: msg.get_i32()?,
                    y: msg.get_i32()?,
                },
                Some(GameReply::PlayerLeft) => GameEvent::PlayerLeft { id: msg.get_u32()? },
                Some(GameReply::PlayerMoved) => GameEvent::PlayerMoved {
                    id: msg.get_u32()?,
                    x: msg.get_i32()?,
                    y: msg.get_i32()?,
                },
                Some(GameReply::ChatMessage) => GameEvent::Chat {
                    sender: msg.get_string()?,
                    text: msg.get_string()?,
                },
                Some(GameReply::ServerMessage) => GameEvent::ServerMessage(msg.get_string()?),
                Some(GameReply::Pong) => GameEvent::Pong(msg.get_u32()?),
                Some(GameReply::Error) => return Err(read_error(msg)),
                Some(GameReply::KeyExchange) | None => {
                    return Err(ClientError::UnexpectedReply(opcode))
                }
            };
            self.events.push_back(event);
        }
        Ok(())
    }
}
