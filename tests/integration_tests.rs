//! Integration tests for the state-sync protocol
//!
//! These tests run the protocol across crate boundaries: lossy links between
//! update managers, chunk transfer and login over in-memory transports, and a
//! real server with real clients over loopback UDP.

use assert_approx_eq::assert_approx_eq;
use client::events::ClientEvent;
use client::network::{Client, Connection};
use protocol::error::HandshakeError;
use protocol::handshake::{
    decode_message, encode_message, AddonInfo, LoginRequest, LoginResponse, NetworkAddon,
    PROTOCOL_VERSION,
};
use protocol::item::downcast;
use protocol::items::{ChatMessage, DisconnectReason, GameSettings, PlayerInfo, Team};
use protocol::secure::MemoryTransport;
use protocol::{
    AddonRegistry, ChunkChannel, ChunkConfig, ClientBoundField, ItemBatch, NetConfig,
    ServerBoundField, UpdateManager, Vector2,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use server::network::{Server, ServerHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;

/// RELIABILITY TESTS
mod reliability_tests {
    use super::*;

    type ClientSide = UpdateManager<ServerBoundField, ClientBoundField>;
    type ServerSide = UpdateManager<ClientBoundField, ServerBoundField>;

    fn chat_lines(packet: &protocol::UpdatePacket<ServerBoundField>) -> Vec<String> {
        packet
            .merged_items()
            .get(&ServerBoundField::ChatMessage)
            .and_then(|item| downcast::<ItemBatch<ChatMessage>>(item.as_ref()))
            .map(|batch| batch.entries().iter().map(|chat| chat.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Reliable chat crosses a link that drops 30% of packets in both
    /// directions, and every line arrives exactly once
    #[test]
    fn reliable_chat_survives_lossy_link() {
        let config = NetConfig::default();
        let registry = Arc::new(AddonRegistry::new());
        let client = ClientSide::new(&config, Arc::clone(&registry)).unwrap();
        let server = ServerSide::new(&config, registry).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let sent: Vec<String> = (0..5).map(|i| format!("line {}", i)).collect();
        let mut received = Vec::new();

        for tick in 0..300 {
            if let Some(line) = sent.get(tick) {
                client.update(|packet| {
                    packet.push_entry(ServerBoundField::ChatMessage, ChatMessage::new(line.as_str()))
                });
            }

            let upstream = client.flush().unwrap();
            if !rng.gen_bool(0.3) {
                if let Some(packet) = server.receive(&upstream).unwrap() {
                    received.extend(chat_lines(&packet));
                }
            }

            let downstream = server.flush().unwrap();
            if !rng.gen_bool(0.3) {
                client.receive(&downstream).unwrap();
            }
        }

        received.sort();
        assert_eq!(received, sent);
    }

    /// Unreliable pose updates of lost packets are never resent
    #[test]
    fn unreliable_updates_are_not_resent() {
        let config = NetConfig::default();
        let registry = Arc::new(AddonRegistry::new());
        let client = ClientSide::new(&config, Arc::clone(&registry)).unwrap();
        let server = ServerSide::new(&config, registry).unwrap();

        client.update(|packet| {
            packet.push_entry(
                ServerBoundField::PlayerUpdate,
                protocol::items::PlayerUpdate {
                    id: 1,
                    position: Some(Vector2 { x: 1.0, y: 2.0 }),
                    ..Default::default()
                },
            )
        });
        // The first packet is lost
        let _ = client.flush().unwrap();

        for _ in 0..30 {
            let upstream = client.flush().unwrap();
            let packet = server.receive(&upstream).unwrap().unwrap();
            assert!(packet.resend_items().is_empty());
            assert!(!packet.contains(ServerBoundField::PlayerUpdate));
            client.receive(&server.flush().unwrap()).unwrap();
        }
    }
}

/// HANDSHAKE TESTS
mod handshake_tests {
    use super::*;

    fn test_config() -> ChunkConfig {
        ChunkConfig {
            retransmit_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn lossy_pair(config: &ChunkConfig, seed: u64) -> (MemoryTransport, MemoryTransport) {
        let (a, b) = MemoryTransport::pair(config.transport_datagram_size());
        let mut rng_a = StdRng::seed_from_u64(seed);
        let mut rng_b = StdRng::seed_from_u64(seed + 1);
        (
            a.with_drop_filter(move |_| rng_a.gen_bool(0.2)),
            b.with_drop_filter(move |_| rng_b.gen_bool(0.2)),
        )
    }

    /// A payload spanning many slices arrives intact over a lossy link
    #[tokio::test]
    async fn chunk_transfer_over_lossy_link() {
        let config = test_config();
        let (a, b) = lossy_pair(&config, 11);
        let mut sender = ChunkChannel::new(a, &config).unwrap();
        let mut receiver = ChunkChannel::new(b, &config).unwrap();

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let receive_task = tokio::spawn(async move {
            let message = receiver.recv().await;
            let _ = receiver.linger(Duration::from_millis(500)).await;
            message
        });

        assert_ok!(sender.send(payload.clone()).await);
        let received = receive_task.await.unwrap().unwrap();
        assert_eq!(received, payload);
    }

    fn server_side(
        mut channel: ChunkChannel<MemoryTransport>,
        server_addons: Vec<AddonInfo>,
    ) -> JoinHandle<Result<(), HandshakeError>> {
        tokio::spawn(async move {
            let request = server::login::receive_request(&mut channel).await?;
            let response = match server::login::validate_request(&request, &server_addons) {
                Ok(addon_ids) => LoginResponse::Accepted {
                    player_id: 1,
                    addon_ids,
                    players: vec![PlayerInfo {
                        id: 2,
                        username: "Quirrel".to_string(),
                    }],
                    settings: GameSettings::default(),
                },
                Err(reason) => LoginResponse::Rejected { reason },
            };
            server::login::send_response(&mut channel, &response).await?;
            channel.linger(Duration::from_millis(300)).await
        })
    }

    async fn login(
        channel: &mut ChunkChannel<MemoryTransport>,
        addons: Vec<AddonInfo>,
    ) -> Result<LoginResponse, HandshakeError> {
        let request = LoginRequest {
            protocol_version: PROTOCOL_VERSION,
            username: "Hornet".to_string(),
            addons,
        };
        channel.send(encode_message(&request)?).await?;
        decode_message(&channel.recv().await?)
    }

    /// Login completes over a lossy in-memory link and negotiates addon ids
    #[tokio::test]
    async fn login_over_lossy_transport() {
        let config = test_config();
        let (client_end, server_end) = lossy_pair(&config, 3);
        let addons = vec![
            AddonInfo::new("skins", "1.0"),
            AddonInfo::new("emotes", "2.1"),
        ];

        let server_task = server_side(
            ChunkChannel::new(server_end, &config).unwrap(),
            addons.clone(),
        );
        let mut channel = ChunkChannel::new(client_end, &config).unwrap();
        let response = login(&mut channel, addons.into_iter().rev().collect())
            .await
            .unwrap();
        let _ = channel.linger(Duration::from_millis(500)).await;

        match response {
            LoginResponse::Accepted {
                player_id,
                addon_ids,
                players,
                ..
            } => {
                assert_eq!(player_id, 1);
                assert_eq!(addon_ids, vec![1, 0]);
                assert_eq!(players.len(), 1);
            }
            LoginResponse::Rejected { reason } => panic!("login rejected: {}", reason),
        }
        assert_ok!(server_task.await.unwrap());
    }

    /// A client missing one of the server's addons is turned away
    #[tokio::test]
    async fn mismatched_addons_are_rejected() {
        let config = test_config();
        let (client_end, server_end) =
            MemoryTransport::pair(config.transport_datagram_size());

        let server_task = server_side(
            ChunkChannel::new(server_end, &config).unwrap(),
            vec![AddonInfo::new("skins", "1.0")],
        );
        let mut channel = ChunkChannel::new(client_end, &config).unwrap();
        let response = login(&mut channel, vec![AddonInfo::new("skins", "0.9")])
            .await
            .unwrap();

        assert!(matches!(response, LoginResponse::Rejected { .. }));
        let _ = channel.linger(Duration::from_millis(100)).await;
        assert_ok!(server_task.await.unwrap());
    }
}

/// CLIENT-SERVER TESTS
mod client_server_tests {
    use super::*;

    fn fast_config() -> NetConfig {
        let mut config = NetConfig {
            tick_interval: Duration::from_millis(20),
            connection_timeout: Duration::from_secs(2),
            timeout_check_interval: Duration::from_millis(50),
            ..Default::default()
        };
        config.chunk.retransmit_interval = Duration::from_millis(20);
        config
    }

    async fn start_server(
        config: NetConfig,
        addons: Vec<NetworkAddon>,
    ) -> (SocketAddr, ServerHandle, JoinHandle<()>) {
        let server = Server::new("127.0.0.1:0", config, 8).await.unwrap();
        let mut server = server.with_addons(addons).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, handle, task)
    }

    async fn connect(addr: SocketAddr, username: &str, config: NetConfig) -> Connection {
        Client::new(&addr.to_string(), username, config)
            .await
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    /// Ticks `active` connections until `done` holds for the events gathered
    /// by `watcher`, or the rounds run out.
    async fn pump_until(
        watcher: &mut Connection,
        active: &[&Connection],
        rounds: usize,
        done: impl Fn(&[ClientEvent]) -> bool,
    ) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        for _ in 0..rounds {
            watcher.send_tick().await.unwrap();
            for connection in active {
                connection.send_tick().await.unwrap();
            }
            events.extend(
                watcher
                    .receive_events(Duration::from_millis(20))
                    .await
                    .unwrap(),
            );
            if done(&events) {
                break;
            }
        }
        events
    }

    /// Two clients log in, see each other and exchange chat through the
    /// server
    #[tokio::test]
    async fn clients_chat_through_server() {
        let config = fast_config();
        let (addr, handle, server_task) = start_server(config.clone(), Vec::new()).await;

        let mut quirrel = connect(addr, "Quirrel", config.clone()).await;
        let hornet = connect(addr, "Hornet", config.clone()).await;
        assert_ne!(quirrel.player_id(), hornet.player_id());
        assert_eq!(hornet.roster().username(quirrel.player_id()), Some("Quirrel"));

        let events = pump_until(&mut quirrel, &[&hornet], 100, |events| {
            events
                .iter()
                .any(|event| matches!(event, ClientEvent::PlayerConnected(_)))
        })
        .await;
        assert!(events.iter().any(|event| matches!(
            event,
            ClientEvent::PlayerConnected(player) if player.username == "Hornet"
        )));
        assert_eq!(quirrel.roster().username(hornet.player_id()), Some("Hornet"));

        hornet.send_chat("  hello there ");
        let events = pump_until(&mut quirrel, &[&hornet], 100, |events| {
            events
                .iter()
                .any(|event| matches!(event, ClientEvent::Chat(_)))
        })
        .await;
        assert!(events.contains(&ClientEvent::Chat("Hornet: hello there".to_string())));

        handle.shutdown();
        let events = pump_until(&mut quirrel, &[&hornet], 100, |events| {
            events
                .iter()
                .any(|event| matches!(event, ClientEvent::Disconnected(_)))
        })
        .await;
        assert!(events.contains(&ClientEvent::Disconnected(DisconnectReason::Shutdown)));
        server_task.await.unwrap();
    }

    /// A chat burst too large for one datagram is sliced on the way to the
    /// server and again on the way to the other client, and every line
    /// arrives
    #[tokio::test]
    async fn oversized_update_reaches_other_client() {
        let config = fast_config();
        let (addr, handle, server_task) = start_server(config.clone(), Vec::new()).await;

        let mut quirrel = connect(addr, "Quirrel", config.clone()).await;
        let hornet = connect(addr, "Hornet", config.clone()).await;

        let lines: Vec<String> = (0..40)
            .map(|i| format!("{:02} {}", i, "x".repeat(57)))
            .collect();
        for line in &lines {
            hornet.send_chat(line);
        }
        let burst = hornet.updates().update(|packet| packet.clone()).encode(
            NetConfig::default().reliability.ack_width().unwrap(),
        );
        assert!(burst.unwrap().len() > config.chunk.max_datagram_size);

        let events = pump_until(&mut quirrel, &[&hornet], 200, |events| {
            events
                .iter()
                .filter(|event| matches!(event, ClientEvent::Chat(_)))
                .count()
                >= lines.len()
        })
        .await;
        let mut received: Vec<String> = events
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Chat(line) => Some(line),
                _ => None,
            })
            .collect();
        received.sort();
        let expected: Vec<String> = lines.iter().map(|line| format!("Hornet: {}", line)).collect();
        assert_eq!(received, expected);

        handle.shutdown();
        server_task.await.unwrap();
    }

    /// Players in the same scene are introduced to each other and a leaving
    /// player is announced
    #[tokio::test]
    async fn scene_entry_and_disconnect_are_relayed() {
        let config = fast_config();
        let (addr, handle, server_task) = start_server(config.clone(), Vec::new()).await;

        let mut quirrel = connect(addr, "Quirrel", config.clone()).await;
        let hornet = connect(addr, "Hornet", config.clone()).await;
        let hornet_id = hornet.player_id();

        quirrel.enter_scene("Crossroads", Vector2::default());
        hornet.enter_scene("Crossroads", Vector2 { x: 4.0, y: 0.0 });
        let events = pump_until(&mut quirrel, &[&hornet], 100, |events| {
            events
                .iter()
                .any(|event| matches!(event, ClientEvent::PlayerEnteredScene(_)))
        })
        .await;
        let entry = events
            .iter()
            .find_map(|event| match event {
                ClientEvent::PlayerEnteredScene(entry) if entry.id == hornet_id => Some(entry),
                _ => None,
            })
            .expect("hornet was introduced");
        assert_eq!(entry.scene, "Crossroads");
        assert_eq!(entry.team, Team::None);
        assert_approx_eq!(entry.position.x, 4.0);

        hornet.disconnect().await;
        let events = pump_until(&mut quirrel, &[], 100, |events| {
            events
                .iter()
                .any(|event| matches!(event, ClientEvent::PlayerDisconnected(_)))
        })
        .await;
        assert!(events.iter().any(|event| matches!(
            event,
            ClientEvent::PlayerDisconnected(player) if player.id == hornet_id && !player.timed_out
        )));
        assert!(events.contains(&ClientEvent::PlayerLeftScene(hornet_id)));
        assert_eq!(quirrel.roster().username(hornet_id), None);

        handle.shutdown();
        server_task.await.unwrap();
    }

    /// A client that goes silent is dropped and announced as timed out
    #[tokio::test]
    async fn silent_client_times_out() {
        let mut config = fast_config();
        config.connection_timeout = Duration::from_millis(300);
        let (addr, handle, server_task) = start_server(config.clone(), Vec::new()).await;

        let mut quirrel = connect(addr, "Quirrel", config.clone()).await;
        let silent = connect(addr, "Zote", config.clone()).await;
        let silent_id = silent.player_id();

        let events = pump_until(&mut quirrel, &[], 100, |events| {
            events
                .iter()
                .any(|event| matches!(event, ClientEvent::PlayerDisconnected(_)))
        })
        .await;
        assert!(events.iter().any(|event| matches!(
            event,
            ClientEvent::PlayerDisconnected(player) if player.id == silent_id && player.timed_out
        )));

        handle.shutdown();
        server_task.await.unwrap();
    }

    /// Logins with a mismatched addon list are refused
    #[tokio::test]
    async fn login_with_wrong_addons_is_rejected() {
        let config = fast_config();
        let skins = || {
            NetworkAddon::new(AddonInfo::new("skins", "1.0"), 2, |_| {
                Some(Box::new(ItemBatch::<ChatMessage>::reliable()) as Box<dyn protocol::PayloadItem>)
            })
        };
        let (addr, handle, server_task) = start_server(config.clone(), vec![skins()]).await;

        let result = Client::new(&addr.to_string(), "Hornet", config.clone())
            .await
            .unwrap()
            .connect()
            .await;
        assert!(matches!(result, Err(HandshakeError::Rejected(_))));

        let accepted = Client::new(&addr.to_string(), "Quirrel", config.clone())
            .await
            .unwrap()
            .with_addons(vec![skins()])
            .connect()
            .await;
        let accepted = assert_ok!(accepted);
        assert!(accepted.updates().registry().contains(0));

        handle.shutdown();
        server_task.await.unwrap();
    }
}
