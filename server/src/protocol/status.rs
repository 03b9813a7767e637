//! Status queries from server lists and launchers.
//!
//! A query is a single `[request u8]` after the identifier byte. The reply
//! starts with the same request byte and the connection is closed right
//! after it. Queries from one address are rate limited.

use super::Protocol;
use log::debug;
use parking_lot::Mutex;
use shared::opcodes::StatusRequest;
use shared::{NetworkMessage, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Above this many tracked addresses, stale entries are swept on insert.
const SWEEP_THRESHOLD: usize = 1024;

/// Remembers when each address last queried the status service.
pub struct StatusLimiter {
    timeout: Duration,
    last_query: Mutex<HashMap<IpAddr, Instant>>,
}

impl StatusLimiter {
    /// A zero `timeout` lets every query through.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_query: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    pub fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        if self.timeout.is_zero() {
            return true;
        }

        let mut last_query = self.last_query.lock();
        if let Some(last) = last_query.get(&ip) {
            if now.saturating_duration_since(*last) < self.timeout {
                return false;
            }
        }
        if last_query.len() >= SWEEP_THRESHOLD {
            let timeout = self.timeout;
            last_query.retain(|_, last| now.saturating_duration_since(*last) < timeout);
        }
        last_query.insert(ip, now);
        true
    }
}

pub(super) fn on_first_message(protocol: &Arc<Protocol>, msg: &mut NetworkMessage) {
    if !protocol.context().status_limiter.allow(protocol.ip()) {
        debug!("Status query from {} throttled", protocol.ip());
        protocol.disconnect();
        return;
    }

    match msg.get_u8().ok().and_then(StatusRequest::from_u8) {
        Some(StatusRequest::Info) => protocol.dispatch(send_info),
        Some(StatusRequest::PlayerList) => protocol.dispatch(send_player_list),
        None => protocol.disconnect(),
    }
}

fn send_info(protocol: &Arc<Protocol>) {
    let ctx = protocol.context();
    let (online, max) = {
        let world = ctx.world.lock();
        (world.len() as u32, world.max_players() as u32)
    };
    let server = &ctx.config.server;
    let uptime = ctx.uptime().as_secs();

    protocol.reply(|out| {
        out.add_u8(StatusRequest::Info.as_u8())?;
        out.add_string(&server.name)?;
        out.add_string(&server.location)?;
        out.add_u32(online)?;
        out.add_u32(max)?;
        out.add_u64(uptime)?;
        out.add_u16(PROTOCOL_VERSION)
    });
    protocol.disconnect();
}

fn send_player_list(protocol: &Arc<Protocol>) {
    let names = protocol.context().world.lock().names();

    protocol.reply(|out| {
        out.add_u8(StatusRequest::PlayerList.as_u8())?;
        // Whatever does not fit in one frame is left out.
        let mut used = 4;
        let fitting = names
            .iter()
            .take_while(|name| {
                used += name.len() + 2;
                out.can_add(used)
            })
            .count();
        out.add_u32(fitting as u32)?;
        for name in &names[..fitting] {
            out.add_string(name)?;
        }
        Ok(())
    });
    protocol.disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_second_query_within_timeout_is_rejected() {
        let limiter = StatusLimiter::new(Duration::from_secs(5));
        let now = Instant::now();
        assert!(limiter.allow_at(ip(1), now));
        assert!(!limiter.allow_at(ip(1), now + Duration::from_secs(4)));
        assert!(limiter.allow_at(ip(2), now + Duration::from_secs(4)));
        assert!(limiter.allow_at(ip(1), now + Duration::from_secs(5)));
    }

    #[test]
    fn test_zero_timeout_disables_limit() {
        let limiter = StatusLimiter::new(Duration::ZERO);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.allow_at(ip(1), now));
        }
    }

    #[test]
    fn test_stale_entries_are_swept() {
        let limiter = StatusLimiter::new(Duration::from_secs(1));
        let now = Instant::now();
        for i in 0..SWEEP_THRESHOLD as u32 {
            assert!(limiter.allow_at(IpAddr::from(i.to_be_bytes()), now));
        }
        assert!(limiter.allow_at(ip(1), now + Duration::from_secs(2)));
        assert_eq!(limiter.last_query.lock().len(), 1);
    }
}
