//! Minimal world state: who is online and where they stand.
//!
//! Only touched from dispatcher tasks. The game simulation proper sits on
//! top of this registry and is not part of this server.

use crate::protocol::Protocol;
use log::info;
use shared::ErrorCode;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub const WORLD_WIDTH: i32 = 1000;
pub const WORLD_HEIGHT: i32 = 1000;
const SPAWN_Y: i32 = WORLD_HEIGHT / 2;

/// A character that has entered the world.
#[derive(Debug, Clone)]
pub struct Player {
    pub id: u32,
    pub name: String,
    pub account: String,
    pub x: i32,
    pub y: i32,
    protocol: Weak<Protocol>,
}

impl Player {
    /// The session this player is connected through, while it is alive.
    pub fn protocol(&self) -> Option<Arc<Protocol>> {
        self.protocol.upgrade()
    }
}

pub struct World {
    players: HashMap<u32, Player>,
    next_player_id: u32,
    max_players: usize,
}

/// Spreads spawns across the map so new players do not stack.
fn spawn_x(id: u32) -> i32 {
    let span = (WORLD_WIDTH - 200) as u32;
    100 + (id.wrapping_mul(60) % span) as i32
}

impl World {
    pub fn new(max_players: usize) -> Self {
        Self {
            players: HashMap::new(),
            next_player_id: 1,
            max_players,
        }
    }

    /// Adds a character to the world and returns its spawned state.
    pub fn enter(
        &mut self,
        name: &str,
        account: &str,
        protocol: Weak<Protocol>,
    ) -> Result<Player, ErrorCode> {
        if self.find_by_name(name).is_some() {
            return Err(ErrorCode::AlreadyOnline);
        }
        if self.players.len() >= self.max_players {
            return Err(ErrorCode::ServerFull);
        }

        let id = self.next_player_id;
        self.next_player_id = self.next_player_id.wrapping_add(1).max(1);

        let player = Player {
            id,
            name: name.to_string(),
            account: account.to_string(),
            x: spawn_x(id),
            y: SPAWN_Y,
            protocol,
        };
        info!("{} entered the world as player {} at ({}, {})", name, id, player.x, player.y);
        self.players.insert(id, player.clone());
        Ok(player)
    }

    pub fn leave(&mut self, id: u32) -> Option<Player> {
        let player = self.players.remove(&id)?;
        info!("{} left the world", player.name);
        Some(player)
    }

    pub fn get(&self, id: u32) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Player> {
        self.players
            .values()
            .find(|player| player.name.eq_ignore_ascii_case(name))
    }

    /// Moves a player, clamping to the world bounds. Returns the new position.
    pub fn move_player(&mut self, id: u32, x: i32, y: i32) -> Option<(i32, i32)> {
        let player = self.players.get_mut(&id)?;
        player.x = x.clamp(0, WORLD_WIDTH - 1);
        player.y = y.clamp(0, WORLD_HEIGHT - 1);
        Some((player.x, player.y))
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Names of everyone online, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.players.values().map(|p| p.name.clone()).collect();
        names.sort();
        names
    }

    /// Live sessions of every player except `except`.
    pub fn sessions(&self, except: Option<u32>) -> Vec<Arc<Protocol>> {
        self.players
            .values()
            .filter(|player| Some(player.id) != except)
            .filter_map(Player::protocol)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_assigns_ids_and_spawn_points() {
        let mut world = World::new(10);
        let a = world.enter("Alice", "alice", Weak::new()).unwrap();
        let b = world.enter("Bob", "bob", Weak::new()).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_ne!(a.x, b.x);
        assert_eq!(world.len(), 2);
        assert!(world.get(1).is_some());
    }

    #[test]
    fn test_spawn_points_stay_on_the_map_for_large_ids() {
        let mut world = World::new(10);
        world.next_player_id = 40_000_000;
        let player = world.enter("Alice", "alice", Weak::new()).unwrap();
        assert_eq!(player.id, 40_000_000);
        assert!((100..WORLD_WIDTH - 100).contains(&player.x));

        for id in [u32::MAX, u32::MAX / 60, 35_791_395, 35_791_396] {
            assert!((100..WORLD_WIDTH - 100).contains(&spawn_x(id)), "id {}", id);
        }
    }

    #[test]
    fn test_same_character_cannot_enter_twice() {
        let mut world = World::new(10);
        world.enter("Alice", "alice", Weak::new()).unwrap();
        assert_eq!(
            world.enter("alice", "alice", Weak::new()).unwrap_err(),
            ErrorCode::AlreadyOnline
        );
    }

    #[test]
    fn test_capacity_limit() {
        let mut world = World::new(1);
        world.enter("Alice", "alice", Weak::new()).unwrap();
        assert_eq!(
            world.enter("Bob", "bob", Weak::new()).unwrap_err(),
            ErrorCode::ServerFull
        );
    }

    #[test]
    fn test_leave() {
        let mut world = World::new(10);
        let player = world.enter("Alice", "alice", Weak::new()).unwrap();
        assert_eq!(world.leave(player.id).unwrap().name, "Alice");
        assert!(world.leave(player.id).is_none());
        assert!(world.is_empty());
    }

    #[test]
    fn test_move_is_clamped() {
        let mut world = World::new(10);
        let player = world.enter("Alice", "alice", Weak::new()).unwrap();
        assert_eq!(world.move_player(player.id, 50, 60), Some((50, 60)));
        assert_eq!(
            world.move_player(player.id, -5, WORLD_HEIGHT + 10),
            Some((0, WORLD_HEIGHT - 1))
        );
        assert_eq!(world.move_player(999, 1, 1), None);
    }

    #[test]
    fn test_names_and_sessions() {
        let mut world = World::new(10);
        world.enter("Bob", "bob", Weak::new()).unwrap();
        world.enter("Alice", "alice", Weak::new()).unwrap();
        assert_eq!(world.names(), vec!["Alice", "Bob"]);
        assert_eq!(world.find_by_name("bob").unwrap().account, "bob");
        // Dead sessions are skipped.
        assert!(world.sessions(None).is_empty());
    }
}
