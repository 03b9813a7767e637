//! Game service.
//!
//! The first message carries the client's half of a Diffie-Hellman
//! exchange along with the session token issued by the login service:
//! `[version u16][public key 16][account][token u64][character]`.
//! The server answers with its own public key in the clear and every
//! later frame in both directions is XTEA encrypted and checksummed.

use super::{Protocol, Session};
use log::{debug, info};
use shared::opcodes::{GameReply, GameRequest};
use shared::{
    DhKeyPair, ErrorCode, MessageError, NetworkMessage, OutputMessage, DH_KEY_LENGTH,
    PROTOCOL_VERSION,
};
use std::sync::Arc;

pub const MAX_CHAT_LENGTH: usize = 255;

#[derive(Debug, Default)]
pub struct GameSession {
    pub player_id: Option<u32>,
    pub account: String,
    pub character: String,
}

fn player_id(protocol: &Protocol) -> Option<u32> {
    match &*protocol.session() {
        Session::Game(session) => session.player_id,
        _ => None,
    }
}

pub(super) fn on_first_message(protocol: &Arc<Protocol>, msg: &mut NetworkMessage) {
    let ctx = protocol.context();
    if ctx.bans.is_ip_banned(protocol.ip()) {
        protocol.disconnect_client(ErrorCode::IpBanned);
        return;
    }

    match msg.get_u16() {
        Ok(PROTOCOL_VERSION) => {}
        Ok(_) => {
            protocol.disconnect_client(ErrorCode::WrongProtocolVersion);
            return;
        }
        Err(_) => {
            protocol.disconnect_client(ErrorCode::MalformedRequest);
            return;
        }
    }

    let (Ok(public), Ok(account), Ok(token), Ok(character)) = (
        msg.get_array::<DH_KEY_LENGTH>(),
        msg.get_string(),
        msg.get_u64(),
        msg.get_string(),
    ) else {
        protocol.disconnect_client(ErrorCode::MalformedRequest);
        return;
    };

    let keys = DhKeyPair::generate();
    let Some(key) = keys.shared_key(&public) else {
        protocol.disconnect_client(ErrorCode::InvalidKey);
        return;
    };

    protocol.reply(|out| {
        out.add_u8(GameReply::KeyExchange.as_u8())?;
        out.add_bytes(&keys.public_key())
    });
    protocol.enable_encryption(key);

    if let Session::Game(session) = &mut *protocol.session() {
        session.account = account.clone();
        session.character = character.clone();
    }
    protocol.dispatch(move |protocol| enter_world(protocol, &account, token, &character));
}

fn enter_world(protocol: &Arc<Protocol>, account: &str, token: u64, character: &str) {
    let ctx = protocol.context();
    if protocol.is_released() {
        return;
    }

    if !ctx.accounts.validate_token(account, token) {
        ctx.bans.add_login_attempt(protocol.ip(), false);
        protocol.disconnect_client(ErrorCode::InvalidToken);
        return;
    }
    if ctx.bans.is_account_banned(account) {
        protocol.disconnect_client(ErrorCode::AccountBanned);
        return;
    }
    let Some(name) = ctx
        .accounts
        .characters(account)
        .into_iter()
        .find(|name| name.eq_ignore_ascii_case(character))
    else {
        protocol.disconnect_client(ErrorCode::CharacterNotFound);
        return;
    };

    let (player, others) = {
        let mut world = ctx.world.lock();
        match world.enter(&name, account, Arc::downgrade(protocol)) {
            Ok(player) => {
                let others: Vec<_> = world
                    .players()
                    .filter(|other| other.id != player.id)
                    .filter_map(|other| {
                        let session = other.protocol()?;
                        Some((session, other.id, other.name.clone(), other.x, other.y))
                    })
                    .collect();
                (player, others)
            }
            Err(code) => {
                drop(world);
                protocol.disconnect_client(code);
                return;
            }
        }
    };

    if let Session::Game(session) = &mut *protocol.session() {
        session.player_id = Some(player.id);
        session.character = player.name.clone();
    }

    protocol.output_buffer(|out| {
        out.add_u8(GameReply::EnterWorld.as_u8())?;
        out.add_u32(player.id)?;
        out.add_string(&player.name)?;
        out.add_i32(player.x)?;
        out.add_i32(player.y)
    });
    for (session, id, name, x, y) in &others {
        protocol.output_buffer(|out| write_player_joined(out, *id, name, *x, *y));
        session.output_buffer(|out| write_player_joined(out, player.id, &player.name, player.x, player.y));
    }
}

fn write_player_joined(
    out: &mut OutputMessage,
    id: u32,
    name: &str,
    x: i32,
    y: i32,
) -> Result<(), MessageError> {
    out.add_u8(GameReply::PlayerJoined.as_u8())?;
    out.add_u32(id)?;
    out.add_string(name)?;
    out.add_i32(x)?;
    out.add_i32(y)
}

pub(super) fn on_message(protocol: &Arc<Protocol>, opcode: u8, msg: &mut NetworkMessage) {
    match GameRequest::from_u8(opcode) {
        Some(GameRequest::Ping) => {
            let Ok(tick) = msg.get_u32() else { return };
            protocol.dispatch(move |protocol| {
                protocol.output_buffer(|out| {
                    out.add_u8(GameReply::Pong.as_u8())?;
                    out.add_u32(tick)
                });
            });
        }
        Some(GameRequest::Move) => {
            let (Ok(x), Ok(y)) = (msg.get_i32(), msg.get_i32()) else { return };
            protocol.dispatch(move |protocol| move_player(protocol, x, y));
        }
        Some(GameRequest::Chat) => {
            let Ok(text) = msg.get_string() else { return };
            if text.is_empty() || text.len() > MAX_CHAT_LENGTH {
                debug!("Dropping chat message of {} bytes from {}", text.len(), protocol.peer());
                return;
            }
            protocol.dispatch(move |protocol| chat(protocol, &text));
        }
        Some(GameRequest::Logout) => protocol.dispatch(|protocol| protocol.disconnect()),
        None => debug!("Unknown game opcode {:#04x} from {}", opcode, protocol.peer()),
    }
}

fn move_player(protocol: &Arc<Protocol>, x: i32, y: i32) {
    let Some(id) = player_id(protocol) else { return };
    let (position, sessions) = {
        let mut world = protocol.context().world.lock();
        (world.move_player(id, x, y), world.sessions(None))
    };
    let Some((x, y)) = position else { return };

    for session in sessions {
        session.output_buffer(|out| {
            out.add_u8(GameReply::PlayerMoved.as_u8())?;
            out.add_u32(id)?;
            out.add_i32(x)?;
            out.add_i32(y)
        });
    }
}

fn chat(protocol: &Arc<Protocol>, text: &str) {
    let Some(id) = player_id(protocol) else { return };
    let (sender, sessions) = {
        let world = protocol.context().world.lock();
        let Some(player) = world.get(id) else { return };
        (player.name.clone(), world.sessions(None))
    };
    info!("[chat] {}: {}", sender, text);

    for session in sessions {
        session.output_buffer(|out| {
            out.add_u8(GameReply::ChatMessage.as_u8())?;
            out.add_string(&sender)?;
            out.add_string(text)
        });
    }
}

/// Removes the player from the world and tells everyone else.
pub(super) fn on_release(protocol: &Arc<Protocol>) {
    let Some(id) = player_id(protocol) else { return };
    let sessions = {
        let mut world = protocol.context().world.lock();
        if world.leave(id).is_none() {
            return;
        }
        world.sessions(None)
    };

    for session in sessions {
        session.output_buffer(|out| {
            out.add_u8(GameReply::PlayerLeft.as_u8())?;
            out.add_u32(id)
        });
    }
}
