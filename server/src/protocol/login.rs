//! Login service: one request per connection, answered with either the
//! character list and a session token or an error.
//!
//! Request layout after the identifier byte:
//! `[version u16][request u8]` followed by
//! `[account][password]` for a login or `[account][password][email]` to
//! create an account.

use super::Protocol;
use log::{info, warn};
use shared::opcodes::{LoginReply, LoginRequest};
use shared::{ErrorCode, NetworkMessage, PROTOCOL_VERSION};
use std::sync::Arc;

/// Character names are sent with a one-byte count.
const MAX_LISTED_CHARACTERS: usize = u8::MAX as usize;

pub(super) fn on_first_message(protocol: &Arc<Protocol>, msg: &mut NetworkMessage) {
    let ctx = protocol.context();
    let ip = protocol.ip();

    if ctx.bans.is_ip_banned(ip) {
        protocol.disconnect_client(ErrorCode::IpBanned);
        return;
    }
    if ctx.bans.is_ip_disabled(ip) {
        protocol.disconnect_client(ErrorCode::TooManyConnectionsFromThisIP);
        return;
    }

    match msg.get_u16() {
        Ok(PROTOCOL_VERSION) => {}
        Ok(version) => {
            info!("{} uses protocol version {}", ip, version);
            protocol.disconnect_client(ErrorCode::WrongProtocolVersion);
            return;
        }
        Err(_) => {
            protocol.disconnect_client(ErrorCode::MalformedRequest);
            return;
        }
    }

    match msg.get_u8().ok().and_then(LoginRequest::from_u8) {
        Some(LoginRequest::Login) => {
            let (Ok(account), Ok(password)) = (msg.get_string(), msg.get_string()) else {
                protocol.disconnect_client(ErrorCode::MalformedRequest);
                return;
            };
            protocol.dispatch(move |protocol| login(protocol, &account, &password));
        }
        Some(LoginRequest::CreateAccount) => {
            let (Ok(account), Ok(password), Ok(email)) =
                (msg.get_string(), msg.get_string(), msg.get_string())
            else {
                protocol.disconnect_client(ErrorCode::MalformedRequest);
                return;
            };
            protocol.dispatch(move |protocol| create_account(protocol, &account, &password, &email));
        }
        None => protocol.disconnect_client(ErrorCode::MalformedRequest),
    }
}

fn login(protocol: &Arc<Protocol>, account: &str, password: &str) {
    let ctx = protocol.context();
    let ip = protocol.ip();

    if account.is_empty() || !ctx.accounts.authenticate(account, password) {
        ctx.bans.add_login_attempt(ip, false);
        warn!("Failed login for '{}' from {}", account, ip);
        protocol.disconnect_client(ErrorCode::InvalidCredentials);
        return;
    }
    if ctx.bans.is_account_banned(account) {
        protocol.disconnect_client(ErrorCode::AccountBanned);
        return;
    }
    ctx.bans.add_login_attempt(ip, true);

    let token = ctx.accounts.issue_token(account);
    let characters = ctx.accounts.characters(account);
    let host = ctx.config.game_host().to_string();
    let port = ctx.game_port();
    let listed = characters.len().min(MAX_LISTED_CHARACTERS);

    protocol.reply(|out| {
        out.add_u8(LoginReply::CharacterList.as_u8())?;
        out.add_u64(token)?;
        out.add_string(&host)?;
        out.add_u16(port)?;
        out.add_u8(listed as u8)?;
        for name in &characters[..listed] {
            out.add_string(name)?;
        }
        Ok(())
    });
    info!("{} logged in from {}", account, ip);
    protocol.disconnect();
}

fn create_account(protocol: &Arc<Protocol>, account: &str, password: &str, email: &str) {
    match protocol.context().accounts.create_account(account, password, email) {
        Ok(()) => {
            protocol.reply(|out| out.add_u8(LoginReply::AccountCreated.as_u8()));
            protocol.disconnect();
        }
        Err(code) => protocol.disconnect_client(code),
    }
}
