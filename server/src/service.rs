//! TCP listeners and first-message routing.
//!
//! One [`ServicePort`] per listening port. A port may carry several
//! protocols; the identifier byte of a connection's first message picks
//! one. A protocol that speaks first cannot share its port, since the
//! server has to choose it before the client sent anything.

use crate::connection::Connection;
use crate::context::ServerContext;
use crate::error::{Result, ServerError};
use crate::protocol::{Protocol, ProtocolInfo, ProtocolKind};
use crate::scheduler::EventId;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shared::NetworkMessage;
use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;

const LISTEN_BACKLOG: u32 = 1024;
/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Checks whether `new` may join a port already hosting `existing`.
fn check_registration(port: u16, existing: &[ProtocolInfo], new: ProtocolInfo) -> Result<()> {
    if existing.iter().any(|info| info.id == new.id) {
        return Err(ServerError::DuplicateProtocol {
            port,
            protocol: new.id,
        });
    }
    let exclusive = existing.iter().any(|info| info.server_sends_first);
    if exclusive || (new.server_sends_first && !existing.is_empty()) {
        return Err(ServerError::PortConflict {
            port,
            protocol: new.id,
        });
    }
    Ok(())
}

pub struct ServicePort {
    port: u16,
    ip: IpAddr,
    ctx: Arc<ServerContext>,
    services: Mutex<Vec<ProtocolKind>>,
    local_addr: Mutex<Option<SocketAddr>>,
    retry_event: Mutex<Option<EventId>>,
    stop: watch::Sender<bool>,
}

impl ServicePort {
    fn new(ctx: &Arc<ServerContext>, ip: IpAddr, port: u16) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            port,
            ip,
            ctx: Arc::clone(ctx),
            services: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            retry_event: Mutex::new(None),
            stop,
        }
    }

    /// Configured port number. `0` binds an ephemeral port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address the listener is bound to, once it is.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn services(&self) -> Vec<ProtocolKind> {
        self.services.lock().clone()
    }

    fn add_service(&self, kind: ProtocolKind) -> Result<()> {
        let mut services = self.services.lock();
        let existing: Vec<ProtocolInfo> = services.iter().map(|k| k.info()).collect();
        check_registration(self.port, &existing, kind.info())?;
        services.push(kind);
        Ok(())
    }

    /// The protocol to start at accept time, if this port's single service speaks first.
    pub fn sends_first(&self) -> Option<ProtocolKind> {
        self.services
            .lock()
            .first()
            .copied()
            .filter(|kind| kind.info().server_sends_first)
    }

    /// Reads the identifier byte and builds the first registered protocol
    /// it matches whose checksum requirement the message satisfies.
    pub fn make_protocol(
        &self,
        checksummed: bool,
        msg: &mut NetworkMessage,
        ctx: &Arc<ServerContext>,
        connection: &Arc<Connection>,
    ) -> Option<Arc<Protocol>> {
        let id = msg.get_u8().ok()?;
        let kind = self.services.lock().iter().copied().find(|kind| {
            let info = kind.info();
            info.id.as_u8() == id && (checksummed || !info.uses_checksum)
        })?;
        Some(Protocol::new(kind, ctx, connection))
    }

    fn names(&self) -> String {
        self.services
            .lock()
            .iter()
            .map(|kind| kind.info().name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Binds and starts accepting on `handle`'s runtime.
    fn open(self: &Arc<Self>, handle: &Handle) -> Result<SocketAddr> {
        let _guard = handle.enter();
        let addr = SocketAddr::new(self.ip, self.port);
        let listener = Self::listen(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        *self.local_addr.lock() = Some(local);
        handle.spawn(Arc::clone(self).accept_loop(listener, self.stop.subscribe()));
        Ok(local)
    }

    fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)
    }

    /// Binds now, or keeps retrying on the scheduler until it works or the port is stopped.
    fn open_with_retry(self: &Arc<Self>, handle: &Handle) -> bool {
        if self.is_stopped() {
            return false;
        }
        match self.open(handle) {
            Ok(addr) => {
                info!("Listening for {} on {}", self.names(), addr);
                true
            }
            Err(e) => {
                let delay = self.ctx.config.port_retry_delay();
                error!("{}. Retrying in {:?}", e, delay);
                let port = Arc::clone(self);
                let handle = handle.clone();
                let event = self.ctx.scheduler.add(delay, move || {
                    port.retry_event.lock().take();
                    port.open_with_retry(&handle);
                });
                *self.retry_event.lock() = event;
                false
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.on_accept(stream, peer),
                Err(e) => {
                    warn!("Accept failed on port {}: {}", self.port, e);
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            }
        }
        *self.local_addr.lock() = None;
        info!("Stopped listening on port {}", self.port);
    }

    fn on_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ip = peer.ip();
        if self.ctx.bans.is_ip_banned(ip) {
            debug!("Refusing banned address {}", ip);
            return;
        }
        if !self.ctx.bans.accept_connection(ip) {
            debug!("Throttling connections from {}", ip);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        Connection::accept(&self.ctx, self, stream, peer);
    }

    /// Closes the listener and cancels a pending bind retry.
    pub fn stop(&self) {
        self.stop.send_replace(true);
        if let Some(event) = self.retry_event.lock().take() {
            self.ctx.scheduler.stop_event(event);
        }
    }
}

/// Owns every service port of the server.
pub struct ServiceManager {
    ctx: Arc<ServerContext>,
    ports: BTreeMap<u16, Arc<ServicePort>>,
}

impl ServiceManager {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            ports: BTreeMap::new(),
        }
    }

    /// Registers `kind` on `port`, creating the port on first use.
    pub fn add(&mut self, kind: ProtocolKind, port: u16) -> Result<()> {
        let ip = self.ctx.config.bind_ip().ok_or_else(|| {
            crate::error::ConfigError::Invalid(format!(
                "invalid bind ip: {}",
                self.ctx.config.server.ip
            ))
        })?;
        let ctx = &self.ctx;
        let service_port = self
            .ports
            .entry(port)
            .or_insert_with(|| Arc::new(ServicePort::new(ctx, ip, port)));
        service_port.add_service(kind)?;
        debug!("Registered {} on port {}", kind.info().name, port);
        Ok(())
    }

    /// Binds every port. Ports that fail are retried in the background;
    /// fails only when not a single port could be bound.
    pub fn start(&self, handle: &Handle) -> Result<()> {
        let mut bound = 0;
        for port in self.ports.values() {
            if port.open_with_retry(handle) {
                bound += 1;
            }
        }
        if bound == 0 {
            self.stop_listening();
            return Err(ServerError::NoServicesBound);
        }
        Ok(())
    }

    /// Bound address of the port registered as `port`.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.ports.get(&port).and_then(|p| p.local_addr())
    }

    /// Bound address of the port hosting `kind`.
    pub fn addr_of(&self, kind: ProtocolKind) -> Option<SocketAddr> {
        self.ports
            .values()
            .find(|port| port.services().contains(&kind))
            .and_then(|port| port.local_addr())
    }

    pub fn is_running(&self) -> bool {
        self.ports.values().any(|port| port.local_addr().is_some())
    }

    fn stop_listening(&self) {
        for port in self.ports.values() {
            port.stop();
        }
    }

    /// Stops every listener and force-closes live connections.
    pub fn stop(&self) {
        self.stop_listening();
        self.ctx.connections.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use shared::ProtocolId;

    fn info(id: ProtocolId, server_sends_first: bool) -> ProtocolInfo {
        ProtocolInfo {
            id,
            name: "test",
            server_sends_first,
            uses_checksum: false,
        }
    }

    #[test]
    fn test_protocols_share_a_port() {
        let existing = [info(ProtocolId::Login, false)];
        assert!(check_registration(1, &existing, info(ProtocolId::Status, false)).is_ok());
    }

    #[test]
    fn test_duplicate_identifier_is_rejected() {
        let existing = [info(ProtocolId::Login, false)];
        assert!(matches!(
            check_registration(1, &existing, info(ProtocolId::Login, false)),
            Err(ServerError::DuplicateProtocol { port: 1, .. })
        ));
    }

    #[test]
    fn test_sends_first_protocol_needs_its_own_port() {
        assert!(check_registration(1, &[], info(ProtocolId::Game, true)).is_ok());

        let existing = [info(ProtocolId::Login, false)];
        assert!(matches!(
            check_registration(1, &existing, info(ProtocolId::Game, true)),
            Err(ServerError::PortConflict { .. })
        ));

        let existing = [info(ProtocolId::Game, true)];
        assert!(matches!(
            check_registration(1, &existing, info(ProtocolId::Status, false)),
            Err(ServerError::PortConflict { .. })
        ));
    }

    fn context() -> Arc<ServerContext> {
        let mut config = ServerConfig::default();
        config.server.login_port = 0;
        ServerContext::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_start_binds_shared_port() {
        let mut manager = ServiceManager::new(context());
        manager.add(ProtocolKind::Login, 0).unwrap();
        manager.add(ProtocolKind::Status, 0).unwrap();
        assert!(matches!(
            manager.add(ProtocolKind::Status, 0),
            Err(ServerError::DuplicateProtocol { .. })
        ));

        manager.start(&Handle::current()).unwrap();
        let addr = manager.local_addr(0).unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(manager.addr_of(ProtocolKind::Status), Some(addr));
        assert_eq!(manager.addr_of(ProtocolKind::Game), None);
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        manager.stop();
    }

    #[tokio::test]
    async fn test_open_reports_bind_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_addr = taken.local_addr().unwrap();

        let port = Arc::new(ServicePort::new(&context(), taken_addr.ip(), taken_addr.port()));
        match port.open(&Handle::current()) {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, taken_addr),
            other => panic!("expected a bind error, got {:?}", other),
        }
        assert_eq!(port.local_addr(), None);
    }

    #[tokio::test]
    async fn test_start_fails_when_nothing_binds() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut manager = ServiceManager::new(context());
        manager.add(ProtocolKind::Login, port).unwrap();
        assert!(matches!(
            manager.start(&Handle::current()),
            Err(ServerError::NoServicesBound)
        ));
        assert!(!manager.is_running());
    }
}
