//! Administration session.

use crate::error::{ClientError, Result};
use crate::network::{read_error, Connection};
use shared::opcodes::{AdminReply, AdminRequest, ProtocolId};
use shared::{MessageError, NetworkMessage, OutputMessage, PROTOCOL_VERSION};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    pub online: u32,
    pub max_players: u32,
    pub uptime: Duration,
    pub connections: u32,
}

pub struct AdminClient {
    connection: Connection,
}

impl AdminClient {
    /// Opens a session and authenticates with `password`.
    pub async fn connect(addr: SocketAddr, password: &str) -> Result<Self> {
        let mut connection = Connection::connect(addr).await?;
        connection
            .send_first(ProtocolId::Admin, |out| {
                out.add_u16(PROTOCOL_VERSION)?;
                out.add_string(password)
            })
            .await?;

        let mut client = Self { connection };
        client.expect(AdminReply::Accepted).await?;
        Ok(client)
    }

    async fn command<F>(&mut self, request: AdminRequest, write: F) -> Result<NetworkMessage>
    where
        F: FnOnce(&mut OutputMessage) -> std::result::Result<(), MessageError>,
    {
        self.connection
            .send(|out| {
                out.add_u8(request.as_u8())?;
                write(out)
            })
            .await?;
        self.connection.recv().await
    }

    async fn expect(&mut self, reply: AdminReply) -> Result<NetworkMessage> {
        let msg = self.connection.recv().await?;
        check_reply(msg, reply)
    }

    async fn run<F>(&mut self, request: AdminRequest, write: F) -> Result<()>
    where
        F: FnOnce(&mut OutputMessage) -> std::result::Result<(), MessageError>,
    {
        let msg = self.command(request, write).await?;
        check_reply(msg, AdminReply::Ok).map(|_| ())
    }

    pub async fn ping(&mut self) -> Result<()> {
        let msg = self.command(AdminRequest::Ping, |_| Ok(())).await?;
        check_reply(msg, AdminReply::Pong).map(|_| ())
    }

    /// Sends a server message to every player in the world.
    pub async fn broadcast(&mut self, text: &str) -> Result<()> {
        self.run(AdminRequest::Broadcast, |out| out.add_string(text)).await
    }

    pub async fn kick(&mut self, character: &str) -> Result<()> {
        self.run(AdminRequest::Kick, |out| out.add_string(character)).await
    }

    /// Bans `ip` for `minutes`; zero bans permanently.
    pub async fn ban_ip(&mut self, ip: IpAddr, minutes: u32) -> Result<()> {
        let ip = ip.to_string();
        self.run(AdminRequest::BanIp, |out| {
            out.add_string(&ip)?;
            out.add_u32(minutes)
        })
        .await
    }

    pub async fn unban_ip(&mut self, ip: IpAddr) -> Result<()> {
        let ip = ip.to_string();
        self.run(AdminRequest::UnbanIp, |out| out.add_string(&ip)).await
    }

    pub async fn server_info(&mut self) -> Result<ServerInfo> {
        let msg = self.command(AdminRequest::ServerInfo, |_| Ok(())).await?;
        let mut msg = check_reply(msg, AdminReply::ServerInfo)?;
        Ok(ServerInfo {
            online: msg.get_u32()?,
            max_players: msg.get_u32()?,
            uptime: Duration::from_secs(msg.get_u64()?),
            connections: msg.get_u32()?,
        })
    }

    /// Orders the server to shut down.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.run(AdminRequest::Shutdown, |_| Ok(())).await
    }

    /// Waits until the server closes the session.
    pub async fn wait_closed(&mut self) -> Result<()> {
        self.connection.wait_closed().await
    }
}

fn check_reply(mut msg: NetworkMessage, expected: AdminReply) -> Result<NetworkMessage> {
    let opcode = msg.get_u8()?;
    match AdminReply::from_u8(opcode) {
        Some(reply) if reply == expected => Ok(msg),
        Some(AdminReply::Error) => Err(read_error(&mut msg)),
        _ => Err(ClientError::UnexpectedReply(opcode)),
    }
}
