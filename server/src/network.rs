//! Server assembly: builds the shared context, registers every service from
//! the configuration and owns their lifetime.

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::error::Result;
use crate::protocol::ProtocolKind;
use crate::service::ServiceManager;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;

/// How often expired bans and stale login attempts are dropped.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Main server: services, worker threads and shared state.
pub struct Server {
    ctx: Arc<ServerContext>,
    services: ServiceManager,
}

impl Server {
    /// Validates `config` and registers the login, game, admin and status services.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let ctx = ServerContext::new(config)?;
        Self::with_context(ctx)
    }

    /// Like [`new`](Self::new) with a prebuilt context, e.g. one with an
    /// external account store.
    pub fn with_context(ctx: Arc<ServerContext>) -> Result<Self> {
        let mut services = ServiceManager::new(Arc::clone(&ctx));
        let config = &ctx.config;
        services.add(ProtocolKind::Login, config.server.login_port)?;
        services.add(ProtocolKind::Game, config.server.game_port)?;
        services.add(ProtocolKind::Admin, config.admin_port())?;
        services.add(ProtocolKind::Status, config.status_port())?;

        Ok(Self { ctx, services })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Binds every service on `handle`'s runtime.
    pub fn start(&self, handle: &Handle) -> Result<()> {
        self.services.start(handle)?;

        if let Some(addr) = self.services.addr_of(ProtocolKind::Game) {
            self.ctx.set_game_port(addr.port());
        }
        schedule_maintenance(Arc::downgrade(&self.ctx));

        let server = &self.ctx.config.server;
        match &server.id {
            Some(id) => info!("{} [{}] ({}) is online", server.name, id, server.location),
            None => info!("{} ({}) is online", server.name, server.location),
        }
        Ok(())
    }

    /// Bound address of the port hosting `kind`.
    pub fn local_addr(&self, kind: ProtocolKind) -> Option<SocketAddr> {
        self.services.addr_of(kind)
    }

    /// Resolves when an administrator orders a shutdown.
    pub async fn run_until_shutdown(&self) {
        self.ctx.wait_for_shutdown().await;
    }

    /// Stops listening, drops every connection and winds down the worker threads.
    pub fn shutdown(&self) {
        info!("Shutting down");
        self.services.stop();
        self.ctx.scheduler.stop();
        self.ctx.scheduler.join();
        self.ctx.dispatcher.stop();
        self.ctx.dispatcher.join();
        info!("Server stopped");
    }
}

fn schedule_maintenance(ctx: Weak<ServerContext>) {
    let Some(strong) = ctx.upgrade() else {
        return;
    };
    strong.scheduler.add(MAINTENANCE_INTERVAL, move || {
        if let Some(ctx) = ctx.upgrade() {
            ctx.bans.purge_expired();
            debug!(
                "{} connections, {} players online",
                ctx.connections.len(),
                ctx.world.lock().len()
            );
        }
        schedule_maintenance(ctx);
    });
}
