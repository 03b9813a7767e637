//! Login service requests.

use crate::error::{ClientError, Result};
use crate::network::{read_error, Connection};
use shared::opcodes::{LoginReply, LoginRequest, ProtocolId};
use shared::PROTOCOL_VERSION;
use std::net::SocketAddr;

/// Successful login: where to play and with which characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterList {
    pub token: u64,
    pub game_host: String,
    pub game_port: u16,
    pub characters: Vec<String>,
}

/// Logs in with `version` as the protocol version. Used to test version checks.
pub async fn login_with_version(
    addr: SocketAddr,
    version: u16,
    account: &str,
    password: &str,
) -> Result<CharacterList> {
    let mut connection = Connection::connect(addr).await?;
    connection
        .send_first(ProtocolId::Login, |out| {
            out.add_u16(version)?;
            out.add_u8(LoginRequest::Login.as_u8())?;
            out.add_string(account)?;
            out.add_string(password)
        })
        .await?;

    let mut msg = connection.recv().await?;
    let opcode = msg.get_u8()?;
    match LoginReply::from_u8(opcode) {
        Some(LoginReply::CharacterList) => {
            let token = msg.get_u64()?;
            let game_host = msg.get_string()?;
            let game_port = msg.get_u16()?;
            let count = msg.get_u8()?;
            let characters = (0..count)
                .map(|_| msg.get_string())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(CharacterList {
                token,
                game_host,
                game_port,
                characters,
            })
        }
        Some(LoginReply::Error) => Err(read_error(&mut msg)),
        _ => Err(ClientError::UnexpectedReply(opcode)),
    }
}

/// Logs in and returns the character list and session token.
pub async fn login(addr: SocketAddr, account: &str, password: &str) -> Result<CharacterList> {
    login_with_version(addr, PROTOCOL_VERSION, account, password).await
}

pub async fn create_account(
    addr: SocketAddr,
    account: &str,
    password: &str,
    email: &str,
) -> Result<()> {
    let mut connection = Connection::connect(addr).await?;
    connection
        .send_first(ProtocolId::Login, |out| {
            out.add_u16(PROTOCOL_VERSION)?;
            out.add_u8(LoginRequest::CreateAccount.as_u8())?;
            out.add_string(account)?;
            out.add_string(password)?;
            out.add_string(email)
        })
        .await?;

    let mut msg = connection.recv().await?;
    let opcode = msg.get_u8()?;
    match LoginReply::from_u8(opcode) {
        Some(LoginReply::AccountCreated) => Ok(()),
        Some(LoginReply::Error) => Err(read_error(&mut msg)),
        _ => Err(ClientError::UnexpectedReply(opcode)),
    }
}
