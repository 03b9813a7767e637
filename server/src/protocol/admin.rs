//! Remote administration.
//!
//! Disabled unless a password is configured, and by default only reachable
//! from loopback. The first message is `[version u16][password]`; once
//! accepted the connection stays open for commands, each answered with
//! `Ok`, `Error` or a command-specific reply.

use super::{Protocol, Session};
use log::{info, warn};
use shared::opcodes::{AdminReply, AdminRequest, GameReply};
use shared::{ErrorCode, MessageError, NetworkMessage, OutputMessage, PROTOCOL_VERSION};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct AdminSession {
    pub authenticated: bool,
}

fn is_authenticated(protocol: &Protocol) -> bool {
    matches!(&*protocol.session(), Session::Admin(session) if session.authenticated)
}

fn write_error(out: &mut OutputMessage, code: ErrorCode) -> Result<(), MessageError> {
    out.add_u8(AdminReply::Error.as_u8())?;
    out.add_u8(code.as_u8())?;
    out.add_string(&code.to_string())
}

fn reply_ok(protocol: &Arc<Protocol>) {
    protocol.output_buffer(|out| out.add_u8(AdminReply::Ok.as_u8()));
}

fn reply_error(protocol: &Arc<Protocol>, code: ErrorCode) {
    protocol.output_buffer(|out| write_error(out, code));
}

pub(super) fn on_first_message(protocol: &Arc<Protocol>, msg: &mut NetworkMessage) {
    let ctx = protocol.context();
    let ip = protocol.ip();
    let security = &ctx.config.security;

    let Some(expected) = security.admin_password.clone() else {
        protocol.disconnect_client(ErrorCode::NotAuthorized);
        return;
    };
    if security.admin_local_only && !ip.is_loopback() {
        warn!("Rejected admin connection from {}", ip);
        protocol.disconnect_client(ErrorCode::NotAuthorized);
        return;
    }
    if ctx.bans.is_ip_disabled(ip) {
        protocol.disconnect_client(ErrorCode::TooManyConnectionsFromThisIP);
        return;
    }

    let (Ok(version), Ok(password)) = (msg.get_u16(), msg.get_string()) else {
        protocol.disconnect_client(ErrorCode::MalformedRequest);
        return;
    };
    if version != PROTOCOL_VERSION {
        protocol.disconnect_client(ErrorCode::WrongProtocolVersion);
        return;
    }

    protocol.dispatch(move |protocol| {
        let bans = &protocol.context().bans;
        if password != expected {
            bans.add_login_attempt(protocol.ip(), false);
            warn!("Wrong admin password from {}", protocol.ip());
            protocol.disconnect_client(ErrorCode::InvalidCredentials);
            return;
        }
        bans.add_login_attempt(protocol.ip(), true);
        if let Session::Admin(session) = &mut *protocol.session() {
            session.authenticated = true;
        }
        info!("Admin session opened from {}", protocol.ip());
        protocol.output_buffer(|out| out.add_u8(AdminReply::Accepted.as_u8()));
    });
}

pub(super) fn on_message(protocol: &Arc<Protocol>, opcode: u8, msg: &mut NetworkMessage) {
    let Some(request) = AdminRequest::from_u8(opcode) else {
        protocol.dispatch(|protocol| reply_error(protocol, ErrorCode::MalformedRequest));
        return;
    };

    match request {
        AdminRequest::Ping => {
            admin_task(protocol, |protocol| {
                protocol.output_buffer(|out| out.add_u8(AdminReply::Pong.as_u8()));
            });
        }
        AdminRequest::Broadcast => {
            let Ok(text) = msg.get_string() else { return };
            admin_task(protocol, move |protocol| broadcast(protocol, &text));
        }
        AdminRequest::Kick => {
            let Ok(name) = msg.get_string() else { return };
            admin_task(protocol, move |protocol| kick(protocol, &name));
        }
        AdminRequest::BanIp => {
            let (Ok(ip), Ok(minutes)) = (msg.get_string(), msg.get_u32()) else { return };
            admin_task(protocol, move |protocol| ban_ip(protocol, &ip, minutes));
        }
        AdminRequest::UnbanIp => {
            let Ok(ip) = msg.get_string() else { return };
            admin_task(protocol, move |protocol| unban_ip(protocol, &ip));
        }
        AdminRequest::ServerInfo => admin_task(protocol, server_info),
        AdminRequest::Shutdown => {
            admin_task(protocol, |protocol| {
                info!("Shutdown ordered by admin at {}", protocol.ip());
                reply_ok(protocol);
                protocol.flush_output();
                protocol.context().request_shutdown();
            });
        }
    }
}

/// Queues a command that only runs for an authenticated session.
fn admin_task<F>(protocol: &Arc<Protocol>, task: F)
where
    F: FnOnce(&Arc<Protocol>) + Send + 'static,
{
    protocol.dispatch(move |protocol| {
        if is_authenticated(protocol) {
            task(protocol);
        } else {
            protocol.disconnect_client(ErrorCode::NotAuthorized);
        }
    });
}

fn broadcast(protocol: &Arc<Protocol>, text: &str) {
    let sessions = protocol.context().world.lock().sessions(None);
    info!("Broadcasting to {} players: {}", sessions.len(), text);
    for session in &sessions {
        session.output_buffer(|out| {
            out.add_u8(GameReply::ServerMessage.as_u8())?;
            out.add_string(text)
        });
    }
    reply_ok(protocol);
}

fn kick(protocol: &Arc<Protocol>, name: &str) {
    let target = protocol
        .context()
        .world
        .lock()
        .find_by_name(name)
        .and_then(|player| player.protocol());
    match target {
        Some(session) => {
            info!("Kicking {}", name);
            session.disconnect();
            reply_ok(protocol);
        }
        None => reply_error(protocol, ErrorCode::CharacterNotFound),
    }
}

fn ban_ip(protocol: &Arc<Protocol>, ip: &str, minutes: u32) {
    let Ok(ip) = ip.parse::<IpAddr>() else {
        reply_error(protocol, ErrorCode::MalformedRequest);
        return;
    };
    let ctx = protocol.context();
    let duration = (minutes > 0).then(|| Duration::from_secs(u64::from(minutes) * 60));
    ctx.bans.add_ip_ban(ip, duration, "banned by administrator");

    reply_ok(protocol);
    let own = protocol.connection().map(|connection| connection.id());
    let closed = ctx.connections.close_ip(ip, own);
    info!("Banned {} and closed {} connections", ip, closed);
    if protocol.ip() == ip {
        protocol.disconnect();
    }
}

fn unban_ip(protocol: &Arc<Protocol>, ip: &str) {
    let removed = ip
        .parse::<IpAddr>()
        .map(|ip| protocol.context().bans.remove_ip_ban(ip))
        .unwrap_or(false);
    if removed {
        reply_ok(protocol);
    } else {
        reply_error(protocol, ErrorCode::MalformedRequest);
    }
}

fn server_info(protocol: &Arc<Protocol>) {
    let ctx = protocol.context();
    let (online, max) = {
        let world = ctx.world.lock();
        (world.len() as u32, world.max_players() as u32)
    };
    let uptime = ctx.uptime().as_secs();
    let connections = ctx.connections.len() as u32;

    protocol.output_buffer(|out| {
        out.add_u8(AdminReply::ServerInfo.as_u8())?;
        out.add_u32(online)?;
        out.add_u32(max)?;
        out.add_u64(uptime)?;
        out.add_u32(connections)
    });
}
