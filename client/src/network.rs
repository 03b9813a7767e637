//! Framed TCP connection to one server service.

use crate::error::{ClientError, Result};
use log::{debug, trace};
use shared::codec::{self, FramePolicy};
use shared::opcodes::ProtocolId;
use shared::{
    ErrorCode, MessageError, NetworkMessage, OutputMessage, XteaKey, HEADER_LENGTH,
    NETWORKMESSAGE_MAXSIZE,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Connection {
    stream: TcpStream,
    policy: FramePolicy,
    timeout: Duration,
}

impl Connection {
    /// Connects with checksummed framing, which every service accepts.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = timeout(DEFAULT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);
        Ok(Self {
            stream,
            policy: FramePolicy::checksummed(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn policy(&self) -> FramePolicy {
        self.policy
    }

    pub fn set_checksum(&mut self, checksum: bool) {
        self.policy.checksum = checksum;
    }

    pub fn enable_encryption(&mut self, key: XteaKey) {
        self.policy = FramePolicy::encrypted(key);
    }

    /// Seals a payload with the current policy without sending it.
    pub fn seal<F>(&self, write: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&mut OutputMessage) -> std::result::Result<(), MessageError>,
    {
        let mut out = OutputMessage::new();
        write(&mut out)?;
        codec::seal(&mut out, &self.policy)?;
        Ok(out.frame().to_vec())
    }

    /// Writes, seals and sends one message.
    pub async fn send<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut OutputMessage) -> std::result::Result<(), MessageError>,
    {
        let frame = self.seal(write)?;
        self.send_raw(&frame).await
    }

    /// Sends the first message of a session: the identifier byte, then the payload.
    pub async fn send_first<F>(&mut self, protocol: ProtocolId, write: F) -> Result<()>
    where
        F: FnOnce(&mut OutputMessage) -> std::result::Result<(), MessageError>,
    {
        self.send(|out| {
            out.add_u8(protocol.as_u8())?;
            write(out)
        })
        .await
    }

    /// Sends bytes exactly as given.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        timeout(self.timeout, self.stream.write_all(bytes))
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok(())
    }

    /// Receives one frame, verifies its checksum and decrypts it.
    pub async fn recv(&mut self) -> Result<NetworkMessage> {
        let frame = timeout(self.timeout, Self::read_frame(&mut self.stream))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let mut msg = NetworkMessage::from_frame(&frame)?;
        if !codec::open(&mut msg, &self.policy)? {
            return Err(ClientError::BadChecksum);
        }
        trace!("Received {} byte frame", frame.len());
        Ok(msg)
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut header = [0u8; HEADER_LENGTH];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ClientError::Closed)
            }
            Err(e) => return Err(e.into()),
        }
        let size = u16::from_le_bytes(header) as usize;
        if size == 0 || size + HEADER_LENGTH > NETWORKMESSAGE_MAXSIZE {
            return Err(ClientError::BadFrameLength(size));
        }

        let mut frame = vec![0u8; HEADER_LENGTH + size];
        frame[..HEADER_LENGTH].copy_from_slice(&header);
        match stream.read_exact(&mut frame[HEADER_LENGTH..]).await {
            Ok(_) => Ok(frame),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ClientError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Waits for the server to close the connection, discarding anything it sends.
    pub async fn wait_closed(&mut self) -> Result<()> {
        let mut sink = [0u8; 1024];
        loop {
            match timeout(self.timeout, self.stream.read(&mut sink)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return Ok(()),
                Err(_) => return Err(ClientError::Timeout),
            }
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Reads the `[code u8][message]` tail of an error reply.
pub fn read_error(msg: &mut NetworkMessage) -> ClientError {
    let code = msg.get_u8().map(ErrorCode::from_wire).unwrap_or(ErrorCode::Unknown);
    let message = msg.get_string().unwrap_or_default();
    ClientError::Server { code, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A connection to a local listener and the accepted server side.
    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(Connection::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_read_error() {
        let mut out = OutputMessage::new();
        out.add_u8(ErrorCode::ServerFull.as_u8()).unwrap();
        out.add_string("server is full").unwrap();
        codec::seal(&mut out, &FramePolicy::plain()).unwrap();
        let mut msg = NetworkMessage::from_frame(out.frame()).unwrap();

        let error = read_error(&mut msg);
        assert_eq!(error.code(), Some(ErrorCode::ServerFull));
        assert!(error.to_string().contains("server is full"));
    }

    #[test]
    fn test_read_error_with_missing_fields() {
        let mut msg = NetworkMessage::new();
        assert_eq!(read_error(&mut msg).code(), Some(ErrorCode::Unknown));
    }

    #[tokio::test]
    async fn test_recv_checksummed_frame() {
        let (mut client, mut server) = pair().await;

        let mut out = OutputMessage::new();
        out.add_u32(0xDEAD_BEEF).unwrap();
        codec::seal(&mut out, &FramePolicy::checksummed()).unwrap();
        server.write_all(out.frame()).await.unwrap();

        let mut msg = client.recv().await.unwrap();
        assert_eq!(msg.get_u32().unwrap(), 0xDEAD_BEEF);
    }

    #[tokio::test]
    async fn test_recv_rejects_bad_checksum() {
        let (mut client, mut server) = pair().await;

        let mut out = OutputMessage::new();
        out.add_u32(7).unwrap();
        codec::seal(&mut out, &FramePolicy::checksummed()).unwrap();
        let mut frame = out.frame().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        server.write_all(&frame).await.unwrap();

        assert!(matches!(client.recv().await, Err(ClientError::BadChecksum)));
    }

    #[tokio::test]
    async fn test_recv_rejects_empty_frame() {
        let (mut client, mut server) = pair().await;
        server.write_all(&[0, 0]).await.unwrap();

        assert!(matches!(client.recv().await, Err(ClientError::BadFrameLength(0))));
    }

    #[tokio::test]
    async fn test_recv_reports_closed() {
        let (mut client, server) = pair().await;
        drop(server);

        assert!(matches!(client.recv().await, Err(ClientError::Closed)));
    }
}
