//! Services shared by every connection, built once at startup and passed
//! around as an `Arc<ServerContext>`.

use crate::accounts::{AccountStore, MemoryAccountStore};
use crate::bans::{BanManager, LoginThrottle};
use crate::config::ServerConfig;
use crate::connection::ConnectionManager;
use crate::dispatcher::Dispatcher;
use crate::output_pool::OutputMessagePool;
use crate::protocol::status::StatusLimiter;
use crate::scheduler::Scheduler;
use crate::world::World;
use log::info;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub struct ServerContext {
    pub config: ServerConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub output_pool: Arc<OutputMessagePool>,
    pub connections: ConnectionManager,
    pub bans: BanManager,
    pub accounts: Arc<dyn AccountStore>,
    pub world: Mutex<World>,
    pub status_limiter: StatusLimiter,
    started: Instant,
    game_port: AtomicU16,
    shutdown_requested: AtomicBool,
    shutdown: Notify,
}

impl ServerContext {
    /// Starts the worker threads and builds every service from `config`,
    /// with accounts seeded from the config file.
    pub fn new(config: ServerConfig) -> std::io::Result<Arc<Self>> {
        let accounts = Arc::new(MemoryAccountStore::with_accounts(
            Duration::from_secs(config.security.session_token_secs),
            &config.accounts,
        ));
        Self::with_accounts(config, accounts)
    }

    /// Like [`new`](Self::new) with an external account store.
    pub fn with_accounts(
        config: ServerConfig,
        accounts: Arc<dyn AccountStore>,
    ) -> std::io::Result<Arc<Self>> {
        let dispatcher = Arc::new(Dispatcher::new()?);
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&dispatcher))?);
        let output_pool = Arc::new(OutputMessagePool::new(
            Arc::clone(&scheduler),
            config.flush_interval(),
        ));

        let security = &config.security;
        let bans = BanManager::new(
            LoginThrottle {
                tries: security.login_tries,
                retry_timeout: Duration::from_secs(security.retry_timeout_secs),
                login_timeout: Duration::from_secs(security.login_timeout_secs),
            },
            security.throttle_connections,
        );
        let status_limiter =
            StatusLimiter::new(Duration::from_secs(security.status_query_timeout_secs));
        let world = Mutex::new(World::new(config.server.max_players as usize));
        let game_port = AtomicU16::new(config.server.game_port);

        Ok(Arc::new(Self {
            config,
            dispatcher,
            scheduler,
            output_pool,
            connections: ConnectionManager::new(),
            bans,
            accounts,
            world,
            status_limiter,
            started: Instant::now(),
            game_port,
            shutdown_requested: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Port clients are sent to for the game service.
    pub fn game_port(&self) -> u16 {
        self.game_port.load(Ordering::Relaxed)
    }

    /// Records the port the game service actually bound to.
    pub fn set_game_port(&self, port: u16) {
        self.game_port.store(port, Ordering::Relaxed);
    }

    /// Asks the process to shut down. Safe to call from any thread.
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
            self.shutdown.notify_one();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) was called.
    pub async fn wait_for_shutdown(&self) {
        if self.is_shutdown_requested() {
            return;
        }
        self.shutdown.notified().await;
    }
}
