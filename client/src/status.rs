//! Status queries.

use crate::error::{ClientError, Result};
use crate::network::Connection;
use shared::opcodes::{ProtocolId, StatusRequest};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub name: String,
    pub location: String,
    pub online: u32,
    pub max_players: u32,
    pub uptime: Duration,
    pub protocol_version: u16,
}

async fn query(addr: SocketAddr, request: StatusRequest) -> Result<shared::NetworkMessage> {
    let mut connection = Connection::connect(addr).await?;
    connection
        .send_first(ProtocolId::Status, |out| out.add_u8(request.as_u8()))
        .await?;
    let mut msg = connection.recv().await?;
    let opcode = msg.get_u8()?;
    if opcode != request.as_u8() {
        return Err(ClientError::UnexpectedReply(opcode));
    }
    Ok(msg)
}

/// Asks for the server's name, location, population and uptime.
pub async fn query_status(addr: SocketAddr) -> Result<StatusInfo> {
    let mut msg = query(addr, StatusRequest::Info).await?;
    Ok(StatusInfo {
        name: msg.get_string()?,
        location: msg.get_string()?,
        online: msg.get_u32()?,
        max_players: msg.get_u32()?,
        uptime: Duration::from_secs(msg.get_u64()?),
        protocol_version: msg.get_u16()?,
    })
}

/// Names of the players online.
pub async fn query_players(addr: SocketAddr) -> Result<Vec<String>> {
    let mut msg = query(addr, StatusRequest::PlayerList).await?;
    let count = msg.get_u32()?;
    let names = (0..count)
        .map(|_| msg.get_string())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}
