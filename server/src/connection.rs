//! Accepted TCP connections.
//!
//! Each connection runs two tasks on the I/O runtime. The read loop reads a
//! header, then a body, then hands the message to its protocol, and only
//! then reads the next header, so messages are processed strictly in
//! arrival order. The write loop drains an outbound queue one frame at a
//! time. Both give up on a timeout and force-close the connection.
//!
//! Closing is idempotent and never waits: the protocol is released on the
//! dispatcher thread, the read loop stops at once and the write loop either
//! stops at once (forced) or after the frames queued before the close.

use crate::context::ServerContext;
use crate::protocol::Protocol;
use crate::service::ServicePort;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use shared::codec::verify_checksum;
use shared::{NetworkMessage, NETWORKMESSAGE_MAXSIZE};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseMode {
    Open,
    Graceful,
    Force,
}

enum Outbound {
    Frame(Vec<u8>),
    Shutdown,
}

enum ReadError {
    Closed,
    TimedOut,
    Io(io::Error),
}

/// Per-connection packet rate limit.
///
/// Packets are counted from the start of a window; the allowance is
/// `max` per whole second elapsed, plus one second of slack. The window
/// restarts once it is older than two seconds.
pub(crate) struct PacketRate {
    max: u32,
    window_start: Instant,
    packets: u32,
}

impl PacketRate {
    pub(crate) fn new(max: u32, now: Instant) -> Self {
        Self {
            max,
            window_start: now,
            packets: 0,
        }
    }

    /// Counts one packet. Returns false when the limit is exceeded.
    pub(crate) fn allow(&mut self, now: Instant) -> bool {
        if self.max == 0 {
            return true;
        }
        let elapsed = now.saturating_duration_since(self.window_start).as_secs() as u32 + 1;
        self.packets += 1;
        if self.packets / elapsed > self.max {
            return false;
        }
        if elapsed > 2 {
            self.window_start = now;
            self.packets = 0;
        }
        true
    }
}

struct ConnectionState {
    status: ConnectionStatus,
    protocol: Option<Arc<Protocol>>,
    received_first: bool,
}

pub struct Connection {
    id: u64,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    port: Arc<ServicePort>,
    state: Mutex<ConnectionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    close_signal: watch::Sender<CloseMode>,
}

impl Connection {
    /// Takes ownership of an accepted socket and starts its tasks.
    ///
    /// Must be called from within the I/O runtime.
    pub fn accept(
        ctx: &Arc<ServerContext>,
        port: &Arc<ServicePort>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Arc<Connection> {
        let (reader, writer) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let (close_signal, closed) = watch::channel(CloseMode::Open);

        let connection = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            ctx: Arc::clone(ctx),
            port: Arc::clone(port),
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Open,
                protocol: None,
                received_first: false,
            }),
            outbound,
            close_signal,
        });
        ctx.connections.register(&connection);
        debug!("Connection {} accepted from {}", connection.id, peer);

        tokio::spawn(Arc::clone(&connection).write_loop(writer, queue, closed.clone()));

        if let Some(kind) = port.sends_first() {
            let protocol = Protocol::new(kind, ctx, &connection);
            connection.state.lock().protocol = Some(Arc::clone(&protocol));
            ctx.dispatcher.add(move || protocol.on_connect());
        }

        tokio::spawn(Arc::clone(&connection).read_loop(reader, closed));
        connection
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == ConnectionStatus::Closed
    }

    /// Queues a sealed frame. Returns false if the connection is closed.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        let state = self.state.lock();
        if state.status == ConnectionStatus::Closed {
            return false;
        }
        self.outbound.send(Outbound::Frame(frame)).is_ok()
    }

    /// Closes the connection. A graceful close still delivers every frame
    /// queued before it; a forced close drops them.
    pub fn close(&self, force: bool) {
        let protocol = {
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Closed {
                return;
            }
            state.status = ConnectionStatus::Closed;
            state.protocol.take()
        };

        trace!("Closing connection {} (force: {})", self.id, force);
        self.ctx.connections.unregister(self.id);
        if let Some(protocol) = protocol {
            self.ctx.dispatcher.add(move || protocol.release());
        }

        if force {
            self.close_signal.send_replace(CloseMode::Force);
        } else {
            self.close_signal.send_replace(CloseMode::Graceful);
            let _ = self.outbound.send(Outbound::Shutdown);
        }
    }

    async fn read_exact(
        reader: &mut OwnedReadHalf,
        buf: &mut [u8],
        limit: Duration,
        closed: &mut watch::Receiver<CloseMode>,
    ) -> Result<(), ReadError> {
        tokio::select! {
            biased;
            _ = closed.wait_for(|mode| *mode != CloseMode::Open) => Err(ReadError::Closed),
            result = timeout(limit, reader.read_exact(buf)) => match result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(ReadError::Io(e)),
                Err(_) => Err(ReadError::TimedOut),
            },
        }
    }

    fn on_read_error(&self, error: ReadError) {
        match error {
            ReadError::Closed => {}
            ReadError::TimedOut => {
                debug!("Connection {} read timed out", self.id);
                self.close(true);
            }
            ReadError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                trace!("Connection {} closed by peer", self.id);
                self.close(true);
            }
            ReadError::Io(e) => {
                debug!("Connection {} read error: {}", self.id, e);
                self.close(true);
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf, mut closed: watch::Receiver<CloseMode>) {
        let network = &self.ctx.config.network;
        let read_timeout = self.ctx.config.read_timeout();
        let mut rate = PacketRate::new(network.max_packets_per_second, Instant::now());
        let mut msg = NetworkMessage::new();

        loop {
            msg.reset();
            if let Err(e) = Self::read_exact(&mut reader, msg.header_mut(), read_timeout, &mut closed).await {
                self.on_read_error(e);
                return;
            }
            if self.is_closed() {
                return;
            }

            let size = msg.decode_header();
            if size == 0 || size >= NETWORKMESSAGE_MAXSIZE - 16 {
                debug!("Connection {} sent invalid body size {}", self.id, size);
                self.close(true);
                return;
            }
            if !rate.allow(Instant::now()) {
                warn!("{} exceeded the packet rate limit, disconnecting", self.peer);
                self.close(true);
                return;
            }

            if let Err(e) = Self::read_exact(&mut reader, msg.body_mut(size), read_timeout, &mut closed).await {
                self.on_read_error(e);
                return;
            }
            if self.is_closed() {
                return;
            }

            self.parse_packet(&mut msg);
        }
    }

    fn parse_packet(self: &Arc<Self>, msg: &mut NetworkMessage) {
        let checksummed = verify_checksum(msg);

        let (protocol, first) = {
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Closed {
                return;
            }
            let first = !state.received_first;
            state.received_first = true;
            (state.protocol.clone(), first)
        };

        if !first {
            match protocol {
                Some(protocol) => protocol.on_recv_message(msg, checksummed),
                None => self.close(true),
            }
            return;
        }

        let protocol = match protocol {
            Some(protocol) => {
                // The identifier byte is still in front of the payload.
                if msg.skip(1).is_err() {
                    self.close(true);
                    return;
                }
                protocol
            }
            None => match self.port.make_protocol(checksummed, msg, &self.ctx, self) {
                Some(protocol) => {
                    let mut state = self.state.lock();
                    if state.status == ConnectionStatus::Closed {
                        return;
                    }
                    state.protocol = Some(Arc::clone(&protocol));
                    protocol
                }
                None => {
                    debug!("Connection {} sent an unknown protocol identifier", self.id);
                    self.close(true);
                    return;
                }
            },
        };
        protocol.on_recv_first_message(msg, checksummed);
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut queue: mpsc::UnboundedReceiver<Outbound>,
        mut closed: watch::Receiver<CloseMode>,
    ) {
        let write_timeout = self.ctx.config.write_timeout();

        loop {
            let next = tokio::select! {
                biased;
                _ = closed.wait_for(|mode| *mode == CloseMode::Force) => break,
                next = queue.recv() => next,
            };
            let frame = match next {
                Some(Outbound::Frame(frame)) => frame,
                Some(Outbound::Shutdown) | None => break,
            };

            let result = tokio::select! {
                biased;
                _ = closed.wait_for(|mode| *mode == CloseMode::Force) => break,
                result = timeout(write_timeout, writer.write_all(&frame)) => result,
            };
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Connection {} write error: {}", self.id, e);
                    self.close(true);
                    break;
                }
                Err(_) => {
                    debug!("Connection {} write timed out", self.id);
                    self.close(true);
                    break;
                }
            }
        }

        let _ = timeout(write_timeout, writer.shutdown()).await;
        trace!("Connection {} writer finished", self.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("Connection {} dropped", self.id);
    }
}

/// Weak registry of live connections, used for bulk shutdown.
#[derive(Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<u64, Weak<Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: &Arc<Connection>) {
        self.connections
            .lock()
            .insert(connection.id(), Arc::downgrade(connection));
    }

    pub fn unregister(&self, id: u64) {
        self.connections.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Force-closes every live connection.
    pub fn close_all(&self) {
        let live = self.live();
        if !live.is_empty() {
            info!("Closing {} connections", live.len());
        }
        for connection in live {
            connection.close(true);
        }
    }

    /// Force-closes every connection from `ip` but `except`. Returns how many were closed.
    pub fn close_ip(&self, ip: IpAddr, except: Option<u64>) -> usize {
        let matching: Vec<_> = self
            .live()
            .into_iter()
            .filter(|connection| connection.ip() == ip && Some(connection.id()) != except)
            .collect();
        for connection in &matching {
            connection.close(true);
        }
        matching.len()
    }
}
