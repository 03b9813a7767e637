//! IP and account bans, connection throttling and login throttling.
//!
//! Consulted from the accept loop and from login handlers. Every check is a
//! map lookup under one lock, so it is safe to call from the I/O thread.
//! Each time dependent operation has an `_at` twin taking the current
//! instant, which the tests use to step through time.

use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Connects tolerated inside `CONNECT_WINDOW` before throttling kicks in.
const CONNECT_BURST: u32 = 5;
const CONNECT_WINDOW: Duration = Duration::from_secs(5);
/// Only a burst whose last connect is this recent gets blocked.
const CONNECT_BURST_GAP: Duration = Duration::from_millis(500);
const CONNECT_BLOCK: Duration = Duration::from_secs(3);
/// Added to a block for every connect attempted while it is active.
const CONNECT_BLOCK_PENALTY: Duration = Duration::from_millis(250);

/// Login throttling limits.
#[derive(Debug, Clone, Copy)]
pub struct LoginThrottle {
    /// Failed attempts allowed before the IP is disabled. `0` disables throttling.
    pub tries: u32,
    /// A failure older than this starts the count again.
    pub retry_timeout: Duration,
    /// How long an IP stays disabled after its last failure.
    pub login_timeout: Duration,
}

impl Default for LoginThrottle {
    fn default() -> Self {
        Self {
            tries: 5,
            retry_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(60),
        }
    }
}

/// Details of an active ban.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanInfo {
    /// `None` for a permanent ban.
    pub expires: Option<Instant>,
    pub reason: String,
}

impl BanInfo {
    fn is_active(&self, now: Instant) -> bool {
        self.expires.map_or(true, |expires| now < expires)
    }
}

struct ConnectBlock {
    last_attempt: Instant,
    count: u32,
    blocked_until: Option<Instant>,
}

struct LoginBlock {
    last_failure: Instant,
    failures: u32,
}

#[derive(Default)]
struct Tables {
    connects: HashMap<IpAddr, ConnectBlock>,
    logins: HashMap<IpAddr, LoginBlock>,
    ip_bans: HashMap<IpAddr, BanInfo>,
    account_bans: HashMap<String, BanInfo>,
}

/// Ban and throttling tables.
pub struct BanManager {
    throttle: LoginThrottle,
    throttle_connections: bool,
    tables: Mutex<Tables>,
}

impl BanManager {
    pub fn new(throttle: LoginThrottle, throttle_connections: bool) -> Self {
        Self {
            throttle,
            throttle_connections,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Decides whether a new connection from `ip` may proceed.
    ///
    /// More than five connects inside five seconds, the last of them within
    /// half a second of the previous one, block the address for three
    /// seconds. Every attempt made while blocked extends the block.
    pub fn accept_connection(&self, ip: IpAddr) -> bool {
        self.accept_connection_at(ip, Instant::now())
    }

    pub fn accept_connection_at(&self, ip: IpAddr, now: Instant) -> bool {
        if ip.is_unspecified() {
            return false;
        }
        if !self.throttle_connections {
            return true;
        }

        let mut tables = self.tables.lock();
        let Some(block) = tables.connects.get_mut(&ip) else {
            tables.connects.insert(
                ip,
                ConnectBlock {
                    last_attempt: now,
                    count: 1,
                    blocked_until: None,
                },
            );
            return true;
        };

        if let Some(until) = block.blocked_until {
            if until > now {
                block.blocked_until = Some(until + CONNECT_BLOCK_PENALTY);
                return false;
            }
        }

        let gap = now.saturating_duration_since(block.last_attempt);
        block.last_attempt = now;
        if gap <= CONNECT_WINDOW {
            block.count += 1;
            if block.count > CONNECT_BURST {
                block.count = 0;
                if gap <= CONNECT_BURST_GAP {
                    block.blocked_until = Some(now + CONNECT_BLOCK);
                    debug!("Throttling connections from {}", ip);
                    return false;
                }
            }
        } else {
            block.count = 1;
        }
        true
    }

    /// Bans `ip` for `duration`, or permanently when `None`.
    pub fn add_ip_ban(&self, ip: IpAddr, duration: Option<Duration>, reason: &str) {
        self.add_ip_ban_at(ip, duration, reason, Instant::now());
    }

    pub fn add_ip_ban_at(&self, ip: IpAddr, duration: Option<Duration>, reason: &str, now: Instant) {
        info!("Banning {} ({:?}): {}", ip, duration, reason);
        self.tables.lock().ip_bans.insert(
            ip,
            BanInfo {
                expires: duration.map(|duration| now + duration),
                reason: reason.to_string(),
            },
        );
    }

    /// Lifts a ban. Returns false if `ip` was not banned.
    pub fn remove_ip_ban(&self, ip: IpAddr) -> bool {
        let removed = self.tables.lock().ip_bans.remove(&ip).is_some();
        if removed {
            info!("Lifted ban on {}", ip);
        }
        removed
    }

    pub fn is_ip_banned(&self, ip: IpAddr) -> bool {
        self.ip_ban_at(ip, Instant::now()).is_some()
    }

    /// The active ban on `ip`, if any. Expired bans are dropped on lookup.
    pub fn ip_ban_at(&self, ip: IpAddr, now: Instant) -> Option<BanInfo> {
        let mut tables = self.tables.lock();
        match tables.ip_bans.get(&ip) {
            Some(ban) if ban.is_active(now) => Some(ban.clone()),
            Some(_) => {
                tables.ip_bans.remove(&ip);
                None
            }
            None => None,
        }
    }

    pub fn add_account_ban(&self, account: &str, duration: Option<Duration>, reason: &str) {
        self.add_account_ban_at(account, duration, reason, Instant::now());
    }

    pub fn add_account_ban_at(
        &self,
        account: &str,
        duration: Option<Duration>,
        reason: &str,
        now: Instant,
    ) {
        info!("Banning account {} ({:?}): {}", account, duration, reason);
        self.tables.lock().account_bans.insert(
            account.to_lowercase(),
            BanInfo {
                expires: duration.map(|duration| now + duration),
                reason: reason.to_string(),
            },
        );
    }

    pub fn is_account_banned(&self, account: &str) -> bool {
        self.is_account_banned_at(account, Instant::now())
    }

    pub fn is_account_banned_at(&self, account: &str, now: Instant) -> bool {
        let key = account.to_lowercase();
        let mut tables = self.tables.lock();
        match tables.account_bans.get(&key) {
            Some(ban) if ban.is_active(now) => true,
            Some(_) => {
                tables.account_bans.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Records a login attempt. Success clears the failure count.
    pub fn add_login_attempt(&self, ip: IpAddr, success: bool) {
        self.add_login_attempt_at(ip, success, Instant::now());
    }

    pub fn add_login_attempt_at(&self, ip: IpAddr, success: bool, now: Instant) {
        let mut tables = self.tables.lock();
        if success {
            tables.logins.remove(&ip);
            return;
        }

        let block = tables.logins.entry(ip).or_insert(LoginBlock {
            last_failure: now,
            failures: 0,
        });
        if now.saturating_duration_since(block.last_failure) > self.throttle.retry_timeout {
            block.failures = 0;
        }
        block.failures += 1;
        block.last_failure = now;
    }

    /// Whether `ip` failed too many logins recently.
    pub fn is_ip_disabled(&self, ip: IpAddr) -> bool {
        self.is_ip_disabled_at(ip, Instant::now())
    }

    pub fn is_ip_disabled_at(&self, ip: IpAddr, now: Instant) -> bool {
        if self.throttle.tries == 0 {
            return false;
        }
        let tables = self.tables.lock();
        tables.logins.get(&ip).map_or(false, |block| {
            block.failures >= self.throttle.tries
                && now.saturating_duration_since(block.last_failure) < self.throttle.login_timeout
        })
    }

    /// Drops expired bans and stale throttling entries.
    pub fn purge_expired(&self) {
        self.purge_expired_at(Instant::now());
    }

    pub fn purge_expired_at(&self, now: Instant) {
        let login_timeout = self.throttle.login_timeout;
        let mut tables = self.tables.lock();
        tables.ip_bans.retain(|_, ban| ban.is_active(now));
        tables.account_bans.retain(|_, ban| ban.is_active(now));
        tables
            .logins
            .retain(|_, block| now.saturating_duration_since(block.last_failure) < login_timeout);
        tables.connects.retain(|_, block| {
            block.blocked_until.map_or(false, |until| until > now)
                || now.saturating_duration_since(block.last_attempt) <= CONNECT_WINDOW
        });
    }
}

impl Default for BanManager {
    fn default() -> Self {
        Self::new(LoginThrottle::default(), true)
    }
}
