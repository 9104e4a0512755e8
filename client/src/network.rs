//! Client network layer: login, socket routing and the update loop

use crate::events::{collect_events, ClientEvent, Roster};
use log::{debug, error, info, warn};
use protocol::error::{ConnectionError, HandshakeError};
use protocol::framing::{split_channel, split_frames, Channel};
use protocol::handshake::{
    build_registry, decode_message, encode_message, LoginRequest, LoginResponse, NetworkAddon,
    PROTOCOL_VERSION,
};
use protocol::items::{ChatMessage, GameSettings, PlayerInfo, SceneEntry, Signal, Team};
use protocol::secure::{handoff_queue, DatagramPeer, HandoffSender};
use protocol::{
    ChunkChannel, ClientBoundField, NetConfig, PacketSlicer, ServerBoundField, UpdateManager,
    UpdatePacket, Vector2,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Update manager of the client's connection to the server.
pub type ServerUpdates = UpdateManager<ServerBoundField, ClientBoundField>;

const HANDOFF_CAPACITY: usize = 64;

const RECEIVE_BUFFER_SIZE: usize = 65_536;

/// Update or slice datagram payload from the server.
type Incoming = (Channel, Vec<u8>);

/// A client that has not logged in yet
#[derive(Debug)]
pub struct Client {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    username: String,
    config: NetConfig,
    addons: Vec<NetworkAddon>,
}

impl Client {
    /// Validates `config` and binds a UDP socket for talking to
    /// `server_addr`.
    ///
    /// The socket binds to an ephemeral port of the same address family as
    /// the server. No datagram is sent until [`Client::connect`].
    pub async fn new(
        server_addr: &str,
        username: &str,
        config: NetConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;
        let server_addr: SocketAddr = server_addr.parse()?;
        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        Ok(Client {
            socket,
            server_addr,
            username: username.to_string(),
            config,
            addons: Vec::new(),
        })
    }

    /// Network addons to advertise. They must match the server's exactly.
    pub fn with_addons(mut self, addons: Vec<NetworkAddon>) -> Self {
        self.addons = addons;
        self
    }

    /// Logs in and returns the live connection.
    ///
    /// The login request travels through the chunked handshake channel. A
    /// rejection, a transfer timeout or an addon list the local registry
    /// cannot honour all end in an error, and the socket receive task is
    /// stopped again.
    pub async fn connect(self) -> Result<Connection, HandshakeError> {
        info!("Connecting to {} as {}...", self.server_addr, self.username);

        let (handshake_tx, handshake_rx, cancel) = handoff_queue(HANDOFF_CAPACITY);
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let receive_task = spawn_socket_receiver(
            Arc::clone(&self.socket),
            self.server_addr,
            handshake_tx,
            update_tx,
        );

        let peer = DatagramPeer::new(
            Arc::clone(&self.socket),
            self.server_addr,
            handshake_rx,
            self.config.chunk.transport_datagram_size(),
        );
        let login = match self.login(peer).await {
            Ok(login) => login,
            Err(e) => {
                receive_task.abort();
                return Err(e);
            }
        };
        let Login {
            mut channel,
            player_id,
            players,
            settings,
            updates,
        } = login;

        // Answer retransmitted response slices in case our final ack was lost
        let linger = self.config.chunk.retransmit_interval * 10;
        tokio::spawn(async move {
            if let Err(e) = channel.linger(linger).await {
                debug!("Handshake linger ended: {}", e);
            }
            drop(cancel);
        });

        info!(
            "Logged in as player {} with {} other players online",
            player_id,
            players.len()
        );

        Ok(Connection {
            socket: self.socket,
            server_addr: self.server_addr,
            player_id,
            updates,
            slicer: PacketSlicer::new(&self.config.chunk),
            incoming: update_rx,
            roster: Roster::new(players, settings),
            config: self.config,
            receive_task,
        })
    }

    async fn login(&self, peer: DatagramPeer) -> Result<Login, HandshakeError> {
        let mut channel = ChunkChannel::new(peer, &self.config.chunk)?;

        let request = LoginRequest {
            protocol_version: PROTOCOL_VERSION,
            username: self.username.clone(),
            addons: self.addons.iter().map(|addon| addon.info.clone()).collect(),
        };
        channel.send(encode_message(&request)?).await?;
        let response: LoginResponse = decode_message(&channel.recv().await?)?;

        match response {
            LoginResponse::Accepted {
                player_id,
                addon_ids,
                players,
                settings,
            } => {
                let registry = Arc::new(build_registry(&self.addons, &addon_ids)?);
                let updates = ServerUpdates::new(&self.config, registry)
                    .map_err(|e| HandshakeError::Rejected(e.to_string()))?;
                Ok(Login {
                    channel,
                    player_id,
                    players,
                    settings,
                    updates: Arc::new(updates),
                })
            }
            LoginResponse::Rejected { reason } => Err(HandshakeError::Rejected(reason)),
        }
    }
}

struct Login {
    channel: ChunkChannel<DatagramPeer>,
    player_id: u16,
    players: Vec<PlayerInfo>,
    settings: GameSettings,
    updates: Arc<ServerUpdates>,
}

/// Routes datagrams from the server by channel until the socket fails
fn spawn_socket_receiver(
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    handshake: HandoffSender,
    updates: mpsc::UnboundedSender<Incoming>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];

        loop {
            let (len, addr) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };
            if addr != server_addr {
                debug!("Ignoring datagram from {}", addr);
                continue;
            }

            match split_channel(&buffer[..len]) {
                Ok((Channel::Handshake, payload)) => {
                    if handshake.push(payload.to_vec()).is_err() {
                        debug!("Handshake finished, ignoring late datagram");
                    }
                }
                Ok((channel, payload)) => {
                    if updates.send((channel, payload.to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => debug!("Ignoring datagram: {}", e),
            }
        }
    })
}

/// A logged-in connection to the server
pub struct Connection {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    player_id: u16,
    updates: Arc<ServerUpdates>,
    slicer: PacketSlicer,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    roster: Roster,
    config: NetConfig,
    receive_task: JoinHandle<()>,
}

impl Connection {
    /// Player ID the server assigned at login.
    pub fn player_id(&self) -> u16 {
        self.player_id
    }

    /// Players and settings as last reported by the server.
    ///
    /// Kept current by every datagram handled through this connection.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The update manager behind this connection, shared with nothing else.
    pub fn updates(&self) -> &Arc<ServerUpdates> {
        &self.updates
    }

    /// Adds data to the packet sent on the next tick.
    pub fn update<R>(&self, f: impl FnOnce(&mut UpdatePacket<ServerBoundField>) -> R) -> R {
        self.updates.update(f)
    }

    /// Queues a reliable chat line for the next tick.
    ///
    /// The server trims it and prefixes the username before relaying it to
    /// every other client.
    pub fn send_chat(&self, message: &str) {
        self.updates
            .update(|packet| packet.push_entry(ServerBoundField::ChatMessage, ChatMessage::new(message)));
    }

    /// Announces that this player is now in `scene`.
    pub fn enter_scene(&self, scene: &str, position: Vector2) {
        let entry = SceneEntry {
            id: self.player_id,
            scene: scene.to_string(),
            position,
            scale: false,
            animation: 0,
            team: Team::None,
        };
        self.updates
            .update(|packet| packet.push_entry(ServerBoundField::PlayerEnterScene, entry));
    }

    /// Flushes the current packet to the server.
    ///
    /// A packet too large for one datagram is sliced; slices the server has
    /// not acked yet are retransmitted by later ticks.
    pub async fn send_tick(&self) -> Result<(), Box<dyn std::error::Error>> {
        let bytes = self.updates.flush()?;
        for datagram in self.slicer.outgoing(&bytes, Instant::now())? {
            self.socket.send_to(&datagram, self.server_addr).await?;
        }
        Ok(())
    }

    /// Decodes one datagram from the server into events.
    ///
    /// Update datagrams are split into their frames. Slice datagrams are
    /// acked and produce events once their packet is complete.
    pub async fn handle_datagram(&mut self, channel: Channel, payload: &[u8]) -> Vec<ClientEvent> {
        let packets: Vec<Vec<u8>> = match channel {
            Channel::Update => match split_frames(payload) {
                Ok(frames) => frames.into_iter().map(<[u8]>::to_vec).collect(),
                Err(e) => {
                    warn!("Malformed update datagram: {}", e);
                    return Vec::new();
                }
            },
            Channel::Slice => self.handle_slice(payload).await.into_iter().collect(),
            Channel::Handshake => {
                debug!("Ignoring handshake datagram after login");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        for packet in packets {
            match self.updates.receive(&packet) {
                Ok(Some(packet)) => events.extend(collect_events(&packet)),
                Ok(None) => debug!("Duplicate packet"),
                Err(e) => warn!("Dropping packet: {}", e),
            }
        }
        for event in &events {
            self.roster.apply(event);
        }
        events
    }

    /// Acks one slice and returns the reassembled packet once complete.
    async fn handle_slice(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let input = match self.slicer.incoming(payload) {
            Ok(input) => input,
            Err(e) => {
                warn!("Malformed slice datagram: {}", e);
                return None;
            }
        };
        if let Some(reply) = input.reply {
            if let Err(e) = self.socket.send_to(&reply, self.server_addr).await {
                error!("Failed to ack slice: {}", e);
            }
        }
        input.packet
    }

    /// Waits up to `wait` for the next update datagram and returns its events,
    /// together with those of any datagrams already queued.
    pub async fn receive_events(&mut self, wait: Duration) -> Result<Vec<ClientEvent>, ConnectionError> {
        let mut events = Vec::new();
        if let Ok(Some((channel, payload))) = tokio::time::timeout(wait, self.incoming.recv()).await {
            events.extend(self.handle_datagram(channel, &payload).await);
            while let Ok((channel, payload)) = self.incoming.try_recv() {
                events.extend(self.handle_datagram(channel, &payload).await);
            }
        }
        self.updates.check_timeout()?;
        Ok(events)
    }

    /// Tells the server we are leaving and sends it right away.
    pub async fn disconnect(&self) {
        self.updates
            .update(|packet| packet.set_item(ServerBoundField::PlayerDisconnect, Signal));
        if let Err(e) = self.send_tick().await {
            warn!("Failed to send disconnect: {}", e);
        }
        info!("Disconnected");
    }

    /// Main client loop: sends ticks, logs received events and turns stdin
    /// lines into chat. `/quit` leaves.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut tick_interval = interval(self.config.tick_interval);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut timeout_interval = interval(self.config.timeout_check_interval);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        loop {
            tokio::select! {
                datagram = self.incoming.recv() => {
                    let Some((channel, payload)) = datagram else {
                        error!("Socket receiver stopped");
                        break;
                    };
                    for event in self.handle_datagram(channel, &payload).await {
                        self.roster.log_event(&event);
                        if let ClientEvent::Disconnected(reason) = event {
                            warn!("Server ended the connection: {:?}", reason);
                            return Ok(());
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    if let Err(e) = self.send_tick().await {
                        error!("Error sending update: {}", e);
                    }
                },

                _ = timeout_interval.tick() => {
                    if let Err(e) = self.updates.check_timeout() {
                        warn!("Lost connection to server: {}", e);
                        return Err(e.into());
                    }
                },

                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) if line.trim() == "/quit" => {
                            self.disconnect().await;
                            break;
                        }
                        Ok(Some(line)) => {
                            if !line.trim().is_empty() {
                                self.send_chat(line.trim());
                            }
                        }
                        Ok(None) => stdin_open = false,
                        Err(e) => {
                            error!("Error reading stdin: {}", e);
                            stdin_open = false;
                        }
                    }
                },
            }
        }

        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}
