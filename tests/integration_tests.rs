//! Integration tests for the gatehouse services
//!
//! Each test boots a full server on an ephemeral port and drives it with the
//! headless client over real TCP connections.

use client::admin::AdminClient;
use client::game::{GameClient, GameEvent};
use client::network::Connection;
use client::{login, status, ClientError};
use server::config::AccountSeed;
use server::protocol::ProtocolKind;
use server::{Server, ServerConfig};
use shared::opcodes::{GameRequest, LoginRequest, ProtocolId};
use shared::{ErrorCode, PROTOCOL_VERSION};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn seed(name: &str, character: &str) -> AccountSeed {
    AccountSeed {
        name: name.to_string(),
        password: "secret".to_string(),
        characters: vec![character.to_string()],
    }
}

/// Every service on one ephemeral port, without the limits that get in the
/// way of fast repeated connections from loopback.
fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.name = "Test World".to_string();
    config.server.location = "Nowhere".to_string();
    config.server.login_port = 0;
    config.server.game_port = 0;
    config.network.max_packets_per_second = 0;
    config.security.throttle_connections = false;
    config.security.status_query_timeout_secs = 0;
    config.security.admin_password = Some("admin".to_string());
    config.accounts = vec![seed("alice", "Alice"), seed("bob", "Bob")];
    config
}

/// A running server that shuts down when dropped.
struct TestServer {
    server: Server,
    addr: SocketAddr,
}

impl TestServer {
    fn start(config: ServerConfig) -> Self {
        let server = Server::new(config).expect("valid config");
        server.start(&Handle::current()).expect("services bind");
        let addr = server
            .local_addr(ProtocolKind::Login)
            .expect("login service is bound");
        Self { server, addr }
    }

    fn with_defaults() -> Self {
        Self::start(test_config())
    }

    async fn enter(&self, account: &str) -> GameClient {
        let list = login::login(self.addr, account, "secret").await.expect("login");
        let game_addr = SocketAddr::new(LOCALHOST, list.game_port);
        GameClient::enter(game_addr, account, list.token, &list.characters[0])
            .await
            .expect("enter world")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn server_code(result: Result<impl std::fmt::Debug, ClientError>) -> Option<ErrorCode> {
    match result {
        Err(e) => e.code(),
        Ok(value) => panic!("expected an error reply, got {:?}", value),
    }
}

/// LOGIN PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// A client speaking another protocol version gets an error and a closed socket
    #[tokio::test]
    async fn wrong_protocol_version_is_rejected() {
        let server = TestServer::with_defaults();

        let result = login::login_with_version(server.addr, PROTOCOL_VERSION + 1, "alice", "secret").await;
        assert_eq!(server_code(result), Some(ErrorCode::WrongProtocolVersion));
    }

    #[tokio::test]
    async fn login_returns_characters_and_game_endpoint() {
        let server = TestServer::with_defaults();

        let list = assert_ok!(login::login(server.addr, "alice", "secret").await);
        assert_eq!(list.characters, vec!["Alice".to_string()]);
        assert_eq!(list.game_host, "127.0.0.1");
        assert_eq!(list.game_port, server.addr.port());
        assert_ne!(list.token, 0);
    }

    #[tokio::test]
    async fn login_connection_is_closed_after_reply() {
        let server = TestServer::with_defaults();

        let mut connection = Connection::connect(server.addr).await.unwrap();
        connection
            .send_first(ProtocolId::Login, |out| {
                out.add_u16(PROTOCOL_VERSION)?;
                out.add_u8(LoginRequest::Login.as_u8())?;
                out.add_string("alice")?;
                out.add_string("secret")
            })
            .await
            .unwrap();

        assert_ok!(connection.recv().await);
        assert_ok!(connection.wait_closed().await);
    }

    #[tokio::test]
    async fn invalid_credentials_are_rejected() {
        let server = TestServer::with_defaults();

        let result = login::login(server.addr, "alice", "wrong").await;
        assert_eq!(server_code(result), Some(ErrorCode::InvalidCredentials));

        let result = login::login(server.addr, "nobody", "secret").await;
        assert_eq!(server_code(result), Some(ErrorCode::InvalidCredentials));
    }

    #[tokio::test]
    async fn created_account_can_log_in() {
        let server = TestServer::with_defaults();

        assert_ok!(login::create_account(server.addr, "carol", "hunter22", "carol@example.com").await);
        let list = assert_ok!(login::login(server.addr, "carol", "hunter22").await);
        assert_eq!(list.characters, vec!["Carol".to_string()]);

        let duplicate = login::create_account(server.addr, "carol", "other", "").await;
        assert_eq!(server_code(duplicate), Some(ErrorCode::AccountExists));
    }

    #[tokio::test]
    async fn banned_account_cannot_log_in() {
        let server = TestServer::with_defaults();
        server
            .server
            .context()
            .bans
            .add_account_ban("bob", None, "cheating");

        let result = login::login(server.addr, "bob", "secret").await;
        assert_eq!(server_code(result), Some(ErrorCode::AccountBanned));
    }

    /// Repeated failures disable the address until the login timeout passes
    #[tokio::test]
    async fn failed_logins_disable_the_address() {
        let server = TestServer::with_defaults();

        for _ in 0..5 {
            let result = login::login(server.addr, "alice", "wrong").await;
            assert_eq!(server_code(result), Some(ErrorCode::InvalidCredentials));
        }

        let result = login::login(server.addr, "alice", "secret").await;
        assert_eq!(server_code(result), Some(ErrorCode::TooManyConnectionsFromThisIP));
    }
}

/// GAME PROTOCOL TESTS
mod game_tests {
    use super::*;

    #[tokio::test]
    async fn enter_ping_move_and_chat() {
        let server = TestServer::with_defaults();
        let mut alice = server.enter("alice").await;
        assert_eq!(alice.name(), "Alice");
        assert_ne!(alice.player_id(), 0);

        alice.ping(7).await.unwrap();
        assert_eq!(
            alice.wait_for(|e| matches!(e, GameEvent::Pong(_))).await.unwrap(),
            GameEvent::Pong(7)
        );

        alice.move_to(120, 340).await.unwrap();
        let moved = alice
            .wait_for(|e| matches!(e, GameEvent::PlayerMoved { .. }))
            .await
            .unwrap();
        assert_eq!(
            moved,
            GameEvent::PlayerMoved {
                id: alice.player_id(),
                x: 120,
                y: 340
            }
        );
        assert_eq!(alice.position(), (120, 340));

        alice.say("hello world").await.unwrap();
        let chat = alice
            .wait_for(|e| matches!(e, GameEvent::Chat { .. }))
            .await
            .unwrap();
        assert_eq!(
            chat,
            GameEvent::Chat {
                sender: "Alice".to_string(),
                text: "hello world".to_string()
            }
        );
    }

    #[tokio::test]
    async fn moves_are_clamped_to_the_world() {
        let server = TestServer::with_defaults();
        let mut alice = server.enter("alice").await;

        alice.move_to(-50, 5000).await.unwrap();
        alice
            .wait_for(|e| matches!(e, GameEvent::PlayerMoved { .. }))
            .await
            .unwrap();
        assert_eq!(alice.position(), (0, 999));
    }

    /// A frame whose checksum does not match is dropped without closing the session
    #[tokio::test]
    async fn tampered_frame_is_dropped() {
        let server = TestServer::with_defaults();
        let mut alice = server.enter("alice").await;

        let mut frame = alice
            .seal(|out| {
                out.add_u8(GameRequest::Ping.as_u8())?;
                out.add_u32(1)
            })
            .unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        alice.send_raw(&frame).await.unwrap();

        alice.ping(2).await.unwrap();
        assert_eq!(
            alice.wait_for(|e| matches!(e, GameEvent::Pong(_))).await.unwrap(),
            GameEvent::Pong(2)
        );
    }

    #[tokio::test]
    async fn players_see_each_other() {
        let server = TestServer::with_defaults();
        let mut alice = server.enter("alice").await;
        let mut bob = server.enter("bob").await;

        let joined = alice
            .wait_for(|e| matches!(e, GameEvent::PlayerJoined { .. }))
            .await
            .unwrap();
        assert!(matches!(joined, GameEvent::PlayerJoined { id, ref name, .. }
            if id == bob.player_id() && name == "Bob"));

        // Bob learns about Alice when entering.
        let existing = bob
            .wait_for(|e| matches!(e, GameEvent::PlayerJoined { .. }))
            .await
            .unwrap();
        assert!(matches!(existing, GameEvent::PlayerJoined { id, .. } if id == alice.player_id()));

        bob.say("hi alice").await.unwrap();
        let chat = alice
            .wait_for(|e| matches!(e, GameEvent::Chat { .. }))
            .await
            .unwrap();
        assert_eq!(
            chat,
            GameEvent::Chat {
                sender: "Bob".to_string(),
                text: "hi alice".to_string()
            }
        );

        let bob_id = bob.player_id();
        bob.logout().await.unwrap();
        assert_ok!(bob.wait_closed().await);
        assert_eq!(
            alice
                .wait_for(|e| matches!(e, GameEvent::PlayerLeft { .. }))
                .await
                .unwrap(),
            GameEvent::PlayerLeft { id: bob_id }
        );
    }

    #[tokio::test]
    async fn invalid_token_is_rejected() {
        let server = TestServer::with_defaults();

        let result = GameClient::enter(server.addr, "alice", 12345, "Alice").await;
        assert_eq!(server_code(result.map(|_| ())), Some(ErrorCode::InvalidToken));
    }

    #[tokio::test]
    async fn unknown_character_is_rejected() {
        let server = TestServer::with_defaults();
        let list = login::login(server.addr, "alice", "secret").await.unwrap();

        let result = GameClient::enter(server.addr, "alice", list.token, "Bob").await;
        assert_eq!(server_code(result.map(|_| ())), Some(ErrorCode::CharacterNotFound));
    }

    #[tokio::test]
    async fn character_cannot_enter_twice() {
        let server = TestServer::with_defaults();
        let _alice = server.enter("alice").await;

        let list = login::login(server.addr, "alice", "secret").await.unwrap();
        let result = GameClient::enter(server.addr, "alice", list.token, "Alice").await;
        assert_eq!(server_code(result.map(|_| ())), Some(ErrorCode::AlreadyOnline));
    }

    #[tokio::test]
    async fn full_server_rejects_new_players() {
        let mut config = test_config();
        config.server.max_players = 1;
        let server = TestServer::start(config);
        let _alice = server.enter("alice").await;

        let list = login::login(server.addr, "bob", "secret").await.unwrap();
        let result = GameClient::enter(server.addr, "bob", list.token, "Bob").await;
        assert_eq!(server_code(result.map(|_| ())), Some(ErrorCode::ServerFull));
    }
}

/// ADMIN PROTOCOL TESTS
mod admin_tests {
    use super::*;

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let server = TestServer::with_defaults();

        let result = AdminClient::connect(server.addr, "guess").await;
        assert_eq!(server_code(result.map(|_| ())), Some(ErrorCode::InvalidCredentials));
    }

    #[tokio::test]
    async fn admin_is_refused_without_a_password() {
        let mut config = test_config();
        config.security.admin_password = None;
        let server = TestServer::start(config);

        let result = AdminClient::connect(server.addr, "admin").await;
        assert_eq!(server_code(result.map(|_| ())), Some(ErrorCode::NotAuthorized));
    }

    #[tokio::test]
    async fn admin_commands() {
        let server = TestServer::with_defaults();
        let mut alice = server.enter("alice").await;
        let mut admin = AdminClient::connect(server.addr, "admin").await.unwrap();

        assert_ok!(admin.ping().await);

        let info = admin.server_info().await.unwrap();
        assert_eq!(info.online, 1);
        assert_eq!(info.max_players, 500);
        assert!(info.connections >= 2);

        assert_ok!(admin.broadcast("maintenance soon").await);
        assert_eq!(
            alice
                .wait_for(|e| matches!(e, GameEvent::ServerMessage(_)))
                .await
                .unwrap(),
            GameEvent::ServerMessage("maintenance soon".to_string())
        );

        let missing = admin.kick("Nobody").await;
        assert_eq!(server_code(missing), Some(ErrorCode::CharacterNotFound));

        assert_ok!(admin.kick("alice").await);
        assert_ok!(alice.wait_closed().await);
    }

    #[tokio::test]
    async fn ban_closes_connections_and_refuses_new_ones() {
        let server = TestServer::with_defaults();
        let mut alice = server.enter("alice").await;
        let mut admin = AdminClient::connect(server.addr, "admin").await.unwrap();

        assert_ok!(admin.ban_ip(LOCALHOST, 0).await);
        assert_ok!(alice.wait_closed().await);
        assert_ok!(admin.wait_closed().await);
        assert!(server.server.context().bans.is_ip_banned(LOCALHOST));

        assert_err!(status::query_status(server.addr).await);

        assert!(server.server.context().bans.remove_ip_ban(LOCALHOST));
        assert_ok!(status::query_status(server.addr).await);
    }

    #[tokio::test]
    async fn shutdown_command_stops_the_server() {
        let server = TestServer::with_defaults();
        let mut admin = AdminClient::connect(server.addr, "admin").await.unwrap();

        assert_ok!(admin.shutdown().await);
        let stopped = timeout(Duration::from_secs(2), server.server.run_until_shutdown()).await;
        assert!(stopped.is_ok());
        assert!(server.server.context().is_shutdown_requested());
    }
}

/// STATUS PROTOCOL TESTS
mod status_tests {
    use super::*;

    #[tokio::test]
    async fn status_reports_server_info() {
        let server = TestServer::with_defaults();
        let _alice = server.enter("alice").await;

        let info = status::query_status(server.addr).await.unwrap();
        assert_eq!(info.name, "Test World");
        assert_eq!(info.location, "Nowhere");
        assert_eq!(info.online, 1);
        assert_eq!(info.max_players, 500);
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn status_lists_players() {
        let server = TestServer::with_defaults();
        let _alice = server.enter("alice").await;
        let _bob = server.enter("bob").await;

        let mut names = status::query_players(server.addr).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["Alice".to_string(), "Bob".to_string()]);
    }

    #[tokio::test]
    async fn repeated_queries_are_throttled() {
        let mut config = test_config();
        config.security.status_query_timeout_secs = 60;
        let server = TestServer::start(config);

        assert_ok!(status::query_status(server.addr).await);
        assert_err!(status::query_status(server.addr).await);
    }
}

/// HOSTILE INPUT TESTS
mod hostile_tests {
    use super::*;

    async fn connect(server: &TestServer) -> Connection {
        let mut connection = Connection::connect(server.addr).await.unwrap();
        connection.set_timeout(Duration::from_secs(3));
        connection
    }

    #[tokio::test]
    async fn zero_length_frame_closes_connection() {
        let server = TestServer::with_defaults();
        let mut connection = connect(&server).await;

        connection.send_raw(&[0, 0]).await.unwrap();
        assert_ok!(connection.wait_closed().await);
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let server = TestServer::with_defaults();
        let mut connection = connect(&server).await;

        connection.send_raw(&[0xFF, 0xFF]).await.unwrap();
        assert_ok!(connection.wait_closed().await);
    }

    #[tokio::test]
    async fn unknown_protocol_is_closed_without_reply() {
        let server = TestServer::with_defaults();
        let mut connection = connect(&server).await;

        connection.send(|out| out.add_u8(0x42)).await.unwrap();
        assert!(matches!(
            connection.recv().await,
            Err(ClientError::Closed) | Err(ClientError::Io(_))
        ));
    }

    #[tokio::test]
    async fn login_without_checksum_is_closed() {
        let server = TestServer::with_defaults();
        let mut connection = connect(&server).await;
        connection.set_checksum(false);

        connection
            .send_first(ProtocolId::Login, |out| {
                out.add_u16(PROTOCOL_VERSION)?;
                out.add_u8(LoginRequest::Login.as_u8())?;
                out.add_string("alice")?;
                out.add_string("secret")
            })
            .await
            .unwrap();
        assert!(matches!(
            connection.recv().await,
            Err(ClientError::Closed) | Err(ClientError::Io(_))
        ));
    }

    #[tokio::test]
    async fn packet_flood_closes_connection() {
        let mut config = test_config();
        config.network.max_packets_per_second = 5;
        let server = TestServer::start(config);
        let mut alice = server.enter("alice").await;

        let mut burst = Vec::new();
        for tick in 0..20u32 {
            let frame = alice
                .seal(|out| {
                    out.add_u8(GameRequest::Ping.as_u8())?;
                    out.add_u32(tick)
                })
                .unwrap();
            burst.extend_from_slice(&frame);
        }
        alice.send_raw(&burst).await.unwrap();
        assert_ok!(alice.wait_closed().await);
    }

    #[tokio::test]
    async fn idle_connection_times_out() {
        let mut config = test_config();
        config.network.read_timeout_secs = 1;
        let server = TestServer::start(config);
        let mut connection = connect(&server).await;

        let started = std::time::Instant::now();
        assert_ok!(connection.wait_closed().await);
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn missing_body_times_out() {
        let mut config = test_config();
        config.network.read_timeout_secs = 1;
        let server = TestServer::start(config);
        let mut connection = connect(&server).await;

        connection.send_raw(&[10, 0]).await.unwrap();
        assert_ok!(connection.wait_closed().await);
    }

    /// A client that stops reading is dropped once writes stall
    #[tokio::test]
    async fn stalled_reader_times_out() {
        let mut config = test_config();
        config.network.write_timeout_secs = 1;
        let server = TestServer::start(config);
        let _alice = server.enter("alice").await;
        let mut admin = AdminClient::connect(server.addr, "admin").await.unwrap();

        let text = "x".repeat(15_000);
        let mut dropped = false;
        for _ in 0..2_000 {
            assert_ok!(admin.broadcast(&text).await);
            if server.server.context().world.lock().is_empty() {
                dropped = true;
                break;
            }
        }
        if !dropped {
            tokio::time::sleep(Duration::from_secs(2)).await;
            dropped = server.server.context().world.lock().is_empty();
        }
        assert!(dropped);
    }

    /// Replies leave in the order requests arrived
    #[tokio::test]
    async fn pongs_arrive_in_order() {
        let server = TestServer::with_defaults();
        let mut alice = server.enter("alice").await;

        for tick in 0..50 {
            alice.ping(tick).await.unwrap();
        }
        for tick in 0..50 {
            let event = alice
                .wait_for(|e| matches!(e, GameEvent::Pong(_)))
                .await
                .unwrap();
            assert_eq!(event, GameEvent::Pong(tick));
        }
    }
}
