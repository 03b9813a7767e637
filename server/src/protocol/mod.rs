//! Per-connection session protocols.
//!
//! A connection gets its [`Protocol`] from the identifier byte of its first
//! message. The set of protocols is closed ([`ProtocolKind`]); each kind
//! declares its identifier, whether the server speaks first and whether
//! checksums are mandatory, and owns a handler module.
//!
//! Parsing happens on the I/O thread: handlers read the values they need
//! out of the message and queue a dispatcher task that owns those values.
//! The message buffer is reused as soon as parsing returns.

pub mod admin;
pub mod game;
pub mod login;
pub mod status;

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::output_pool::AutoSend;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use shared::codec::{self, FramePolicy};
use shared::opcodes::{AdminReply, GameReply, LoginReply};
use shared::{ErrorCode, MessageError, NetworkMessage, OutputMessage, ProtocolId, XteaKey};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Login,
    Game,
    Admin,
    Status,
}

/// Static description of a protocol kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub id: ProtocolId,
    pub name: &'static str,
    /// The server writes before the client. Such a protocol needs a port of its own.
    pub server_sends_first: bool,
    /// First messages without a valid checksum are not routed to this protocol.
    pub uses_checksum: bool,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 4] = [
        ProtocolKind::Login,
        ProtocolKind::Game,
        ProtocolKind::Admin,
        ProtocolKind::Status,
    ];

    pub const fn info(self) -> ProtocolInfo {
        match self {
            ProtocolKind::Login => ProtocolInfo {
                id: ProtocolId::Login,
                name: "login",
                server_sends_first: false,
                uses_checksum: true,
            },
            ProtocolKind::Game => ProtocolInfo {
                id: ProtocolId::Game,
                name: "game",
                server_sends_first: false,
                uses_checksum: true,
            },
            ProtocolKind::Admin => ProtocolInfo {
                id: ProtocolId::Admin,
                name: "admin",
                server_sends_first: false,
                uses_checksum: false,
            },
            ProtocolKind::Status => ProtocolInfo {
                id: ProtocolId::Status,
                name: "status",
                server_sends_first: false,
                uses_checksum: false,
            },
        }
    }
}

/// Session state specific to each protocol kind.
pub enum Session {
    Login,
    Status,
    Admin(admin::AdminSession),
    Game(game::GameSession),
}

impl Session {
    fn for_kind(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Login => Session::Login,
            ProtocolKind::Status => Session::Status,
            ProtocolKind::Admin => Session::Admin(admin::AdminSession::default()),
            ProtocolKind::Game => Session::Game(game::GameSession::default()),
        }
    }
}

pub struct Protocol {
    kind: ProtocolKind,
    ctx: Arc<ServerContext>,
    connection: Weak<Connection>,
    peer: SocketAddr,
    policy: Mutex<FramePolicy>,
    output: Mutex<Option<OutputMessage>>,
    session: Mutex<Session>,
    released: AtomicBool,
}

impl Protocol {
    pub fn new(kind: ProtocolKind, ctx: &Arc<ServerContext>, connection: &Arc<Connection>) -> Arc<Self> {
        let policy = FramePolicy {
            checksum: kind.info().uses_checksum,
            key: None,
        };
        Arc::new(Protocol {
            kind,
            ctx: Arc::clone(ctx),
            connection: Arc::downgrade(connection),
            peer: connection.peer(),
            policy: Mutex::new(policy),
            output: Mutex::new(None),
            session: Mutex::new(Session::for_kind(kind)),
            released: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn session(&self) -> parking_lot::MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub fn frame_policy(&self) -> FramePolicy {
        *self.policy.lock()
    }

    /// Switches both directions to XTEA with `key`.
    pub fn enable_encryption(&self, key: XteaKey) {
        let mut policy = self.policy.lock();
        policy.key = Some(key);
        policy.checksum = true;
    }

    /// Called right after accept for protocols that speak first.
    pub fn on_connect(self: &Arc<Self>) {
        trace!("{} session opened for {}", self.kind.info().name, self.peer);
    }

    /// Handles the first message; the identifier byte is already consumed.
    pub fn on_recv_first_message(self: &Arc<Self>, msg: &mut NetworkMessage, checksummed: bool) {
        if checksummed {
            self.policy.lock().checksum = true;
        } else if self.kind.info().uses_checksum {
            debug!("{} sent a first message without checksum", self.peer);
            self.close(true);
            return;
        }

        match self.kind {
            ProtocolKind::Login => login::on_first_message(self, msg),
            ProtocolKind::Game => game::on_first_message(self, msg),
            ProtocolKind::Admin => admin::on_first_message(self, msg),
            ProtocolKind::Status => status::on_first_message(self, msg),
        }
    }

    /// Handles every later message: checksum policy, decryption, then the opcode.
    pub fn on_recv_message(self: &Arc<Self>, msg: &mut NetworkMessage, checksummed: bool) {
        let policy = self.frame_policy();
        if policy.checksum && !checksummed {
            debug!("Dropping message with a bad checksum from {}", self.peer);
            return;
        }
        if let Some(key) = &policy.key {
            if let Err(e) = codec::decrypt_message(msg, key) {
                warn!("Dropping undecryptable message from {}: {}", self.peer, e);
                return;
            }
        }

        let opcode = match msg.get_u8() {
            Ok(opcode) => opcode,
            Err(_) => return,
        };
        match self.kind {
            ProtocolKind::Game => game::on_message(self, opcode, msg),
            ProtocolKind::Admin => admin::on_message(self, opcode, msg),
            ProtocolKind::Login | ProtocolKind::Status => {
                trace!("Ignoring opcode {:#04x} after the first message", opcode);
            }
        }
    }

    /// Runs `task` on the dispatcher with a handle to this protocol.
    pub fn dispatch<F>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(&Arc<Protocol>) + Send + 'static,
    {
        let protocol = Arc::clone(self);
        self.ctx.dispatcher.add(move || task(&protocol));
    }

    /// Seals `out` and queues it on the connection right away.
    pub fn send(&self, mut out: OutputMessage) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };
        if let Err(e) = codec::seal(&mut out, &self.frame_policy()) {
            warn!("Failed to seal message for {}: {}", self.peer, e);
            return false;
        }
        connection.send(out.frame().to_vec())
    }

    /// Writes a standalone message and sends it right away.
    pub fn reply<F>(&self, write: F) -> bool
    where
        F: FnOnce(&mut OutputMessage) -> Result<(), MessageError>,
    {
        let mut out = OutputMessage::new();
        if let Err(e) = write(&mut out) {
            warn!("Failed to build reply for {}: {}", self.peer, e);
            return false;
        }
        self.send(out)
    }

    /// Appends to the auto-send buffer, which the output pool flushes on
    /// its next sweep. A full buffer is sent first and the write retried on
    /// a fresh one.
    pub fn output_buffer<F>(self: &Arc<Self>, write: F) -> bool
    where
        F: Fn(&mut OutputMessage) -> Result<(), MessageError>,
    {
        if self.is_released() {
            return false;
        }

        let mut slot = self.output.lock();
        let fresh = slot.is_none();
        let out = slot.get_or_insert_with(OutputMessage::new);
        let before = out.len();
        if write(out).is_err() {
            out.truncate(before);
            if let Some(full) = slot.take() {
                if !full.is_empty() {
                    self.send(full);
                }
            }
            let mut next = OutputMessage::new();
            if let Err(e) = write(&mut next) {
                warn!("Message for {} does not fit in one frame: {}", self.peer, e);
                return false;
            }
            *slot = Some(next);
        }
        drop(slot);

        if fresh {
            let me: Arc<dyn AutoSend> = Arc::clone(self) as Arc<dyn AutoSend>;
            self.ctx.output_pool.add_to_auto_send(me);
        }
        true
    }

    /// Sends whatever is in the auto-send buffer.
    pub fn flush_output(&self) {
        let out = self.output.lock().take();
        if let Some(out) = out {
            if !out.is_empty() {
                self.send(out);
            }
        }
    }

    fn close(&self, force: bool) {
        if let Some(connection) = self.connection() {
            connection.close(force);
        }
    }

    /// Flushes pending output and closes the connection gracefully.
    pub fn disconnect(&self) {
        self.flush_output();
        self.close(false);
    }

    /// Sends an error reply, then disconnects.
    pub fn disconnect_client(&self, code: ErrorCode) {
        let opcode = match self.kind {
            ProtocolKind::Login => LoginReply::Error.as_u8(),
            ProtocolKind::Game => GameReply::Error.as_u8(),
            ProtocolKind::Admin => AdminReply::Error.as_u8(),
            ProtocolKind::Status => {
                self.disconnect();
                return;
            }
        };
        debug!("Disconnecting {}: {}", self.peer, code);

        self.flush_output();
        self.reply(|out| {
            out.add_u8(opcode)?;
            out.add_u8(code.as_u8())?;
            out.add_string(&code.to_string())
        });
        self.close(false);
    }

    /// Tears the session down. Runs on the dispatcher once the connection closed.
    pub fn release(self: &Arc<Self>) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.output_pool.remove_from_auto_send(&**self);
        self.output.lock().take();

        if self.kind == ProtocolKind::Game {
            game::on_release(self);
        }
        trace!("{} session released for {}", self.kind.info().name, self.peer);
    }
}

impl AutoSend for Protocol {
    fn flush_output(&self) {
        Protocol::flush_output(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identifiers_are_unique() {
        let ids: HashSet<u8> = ProtocolKind::ALL
            .iter()
            .map(|kind| kind.info().id.as_u8())
            .collect();
        assert_eq!(ids.len(), ProtocolKind::ALL.len());
    }

    #[test]
    fn test_protocol_metadata() {
        assert_eq!(ProtocolKind::Login.info().id.as_u8(), 0x01);
        assert_eq!(ProtocolKind::Game.info().id.as_u8(), 0x0A);
        assert_eq!(ProtocolKind::Admin.info().id.as_u8(), 0xFE);
        assert_eq!(ProtocolKind::Status.info().id.as_u8(), 0xFF);

        assert!(ProtocolKind::Login.info().uses_checksum);
        assert!(ProtocolKind::Game.info().uses_checksum);
        assert!(!ProtocolKind::Status.info().uses_checksum);
        assert!(ProtocolKind::ALL
            .iter()
            .all(|kind| !kind.info().server_sends_first));
    }
}
