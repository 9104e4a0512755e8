//! Server network layer: socket routing, logins, send ticks and dispatch

use crate::client_manager::{ClientManager, ClientUpdates};
use crate::login::{receive_request, send_response, validate_request};
use crate::relay;
use log::{debug, error, info, warn};
use protocol::error::{HandshakeError, TransportError};
use protocol::framing::{split_channel, split_frames, Channel};
use protocol::handshake::{build_registry, AddonInfo, LoginResponse, NetworkAddon};
use protocol::items::{DisconnectReason, GameSettings, PlayerInfo, ServerClientDisconnect};
use protocol::secure::{handoff_queue, CancelHandle, DatagramPeer, HandoffReceiver, HandoffSender};
use protocol::{
    AddonRegistry, ChunkChannel, ClientBoundField, NetConfig, PacketSlicer, ServerBoundField,
    UpdatePacket,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Datagrams buffered per login before the hand-off queue starts dropping.
const HANDOFF_CAPACITY: usize = 64;

const RECEIVE_BUFFER_SIZE: usize = 65_536;

/// Messages sent from network tasks to the dispatch loop
#[derive(Debug)]
pub enum ServerMessage {
    /// A login passed validation and needs a player slot
    LoginRequested {
        addr: SocketAddr,
        username: String,
        addon_ids: Vec<u8>,
        reply: oneshot::Sender<LoginResponse>,
    },
    PacketReceived {
        client_id: u16,
        packet: UpdatePacket<ServerBoundField>,
    },
    ClientTimeout {
        client_id: u16,
        username: String,
        scene: Option<String>,
    },
    UpdateSettings(GameSettings),
    Shutdown,
}

/// A login in progress, keyed by the client's address
#[derive(Debug)]
struct PendingLogin {
    incoming: HandoffSender,
    cancel: CancelHandle,
}

type PendingLogins = Arc<RwLock<HashMap<SocketAddr, PendingLogin>>>;

/// State shared by the socket receive task and login tasks
#[derive(Clone)]
struct Routing {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    logins: PendingLogins,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    config: Arc<NetConfig>,
    addons: Arc<[AddonInfo]>,
}

/// Cloneable handle for controlling a running server
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    /// Asks the dispatch loop to stop.
    ///
    /// Every client is told the server is shutting down before
    /// [`Server::run`] returns.
    pub fn shutdown(&self) {
        if self.tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Server already stopped");
        }
    }

    /// Replaces the game settings and pushes them to every client.
    pub fn set_settings(&self, settings: GameSettings) {
        if self.tx.send(ServerMessage::UpdateSettings(settings)).is_err() {
            debug!("Server already stopped");
        }
    }
}

/// Relay server owning the UDP socket and every client connection
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    logins: PendingLogins,
    config: Arc<NetConfig>,
    addons: Vec<NetworkAddon>,
    registry: Arc<AddonRegistry>,
    settings: GameSettings,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    /// Binds the UDP socket and prepares an empty server.
    ///
    /// The configuration is validated first. Nothing is received until
    /// [`Server::run`] is called, and the advertised game settings start
    /// out with `max_clients` as the player cap.
    pub async fn new(
        addr: &str,
        config: NetConfig,
        max_clients: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::with_chunk_config(
                max_clients,
                config.chunk.clone(),
            ))),
            logins: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            addons: Vec::new(),
            registry: Arc::new(AddonRegistry::new()),
            settings: GameSettings {
                max_players: u16::try_from(max_clients).unwrap_or(u16::MAX),
                ..Default::default()
            },
            server_tx,
            server_rx,
        })
    }

    /// Installs the network addons clients must match. Addon ids follow the
    /// order of `addons`.
    pub fn with_addons(mut self, addons: Vec<NetworkAddon>) -> Result<Self, HandshakeError> {
        let ids = (0..addons.len())
            .map(|index| {
                u8::try_from(index).map_err(|_| {
                    HandshakeError::Rejected(format!("{} addons exceed the id space", addons.len()))
                })
            })
            .collect::<Result<Vec<u8>, _>>()?;
        self.registry = Arc::new(build_registry(&addons, &ids)?);
        self.addons = addons;
        Ok(self)
    }

    /// Game settings handed to every client at login.
    pub fn with_settings(mut self, settings: GameSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Address the socket is bound to, with the real port when bound to 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// A handle other tasks can use to control the running server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.server_tx.clone(),
        }
    }

    fn routing(&self) -> Routing {
        Routing {
            socket: Arc::clone(&self.socket),
            clients: Arc::clone(&self.clients),
            logins: Arc::clone(&self.logins),
            server_tx: self.server_tx.clone(),
            config: Arc::clone(&self.config),
            addons: self.addons.iter().map(|addon| addon.info.clone()).collect(),
        }
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self) -> JoinHandle<()> {
        let routing = self.routing();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];

            loop {
                match routing.socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if !route_datagram(&routing, &buffer[..len], addr).await {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(&self) -> JoinHandle<()> {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let period = self.config.timeout_check_interval;

        tokio::spawn(async move {
            let mut interval = interval(period);

            loop {
                interval.tick().await;

                let timed_out = clients.write().await.check_timeouts();

                for client in timed_out {
                    let message = ServerMessage::ClientTimeout {
                        client_id: client.id,
                        username: client.username.clone(),
                        scene: client.scene.clone(),
                    };
                    if let Err(e) = server_tx.send(message) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        })
    }

    /// Spawns the send-tick task of one client
    ///
    /// Every tick the client's packet is flushed. Packets too large for one
    /// datagram go out as slices, which are also retransmitted from here.
    fn spawn_send_task(
        &self,
        client_id: u16,
        addr: SocketAddr,
        updates: Arc<ClientUpdates>,
        slicer: Arc<PacketSlicer>,
    ) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let tick = self.config.tick_interval;

        tokio::spawn(async move {
            let mut interval = interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let bytes = match updates.flush() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Failed to build update for client {}: {}", client_id, e);
                        continue;
                    }
                };
                let datagrams = match slicer.outgoing(&bytes, Instant::now()) {
                    Ok(datagrams) => datagrams,
                    Err(e) => {
                        error!("Failed to frame update for client {}: {}", client_id, e);
                        continue;
                    }
                };
                for datagram in datagrams {
                    if let Err(e) = socket.send_to(&datagram, addr).await {
                        error!("Failed to send update to client {}: {}", client_id, e);
                    }
                }
            }
        })
    }

    /// Gives a validated login a player slot and builds its response
    async fn admit(
        &mut self,
        addr: SocketAddr,
        username: String,
        addon_ids: Vec<u8>,
        reply: oneshot::Sender<LoginResponse>,
    ) {
        let updates = match ClientUpdates::new(&self.config, Arc::clone(&self.registry)) {
            Ok(updates) => Arc::new(updates),
            Err(e) => {
                error!("Cannot create connection state: {}", e);
                let rejected = LoginResponse::Rejected {
                    reason: "server misconfigured".to_string(),
                };
                if reply.send(rejected).is_err() {
                    debug!("Login task for {} ended before rejection", addr);
                }
                return;
            }
        };

        let response = {
            let mut clients = self.clients.write().await;
            let players = clients.roster();

            match clients.add_client(addr, username.clone(), updates) {
                None => LoginResponse::Rejected {
                    reason: "server is full".to_string(),
                },
                Some(player_id) => {
                    if let Some(client) = clients.get_mut(player_id) {
                        let handle = self.spawn_send_task(
                            player_id,
                            addr,
                            Arc::clone(&client.updates),
                            Arc::clone(&client.slicer),
                        );
                        client.set_send_task(handle);
                    }
                    relay::announce_connect(
                        &clients,
                        &PlayerInfo {
                            id: player_id,
                            username,
                        },
                    );
                    LoginResponse::Accepted {
                        player_id,
                        addon_ids,
                        players,
                        settings: self.settings.clone(),
                    }
                }
            }
        };

        if let Err(LoginResponse::Accepted { player_id, .. }) = reply.send(response) {
            warn!("Login task for {} ended before admission", addr);
            self.drop_client(player_id, false).await;
        }
    }

    async fn drop_client(&self, client_id: u16, timed_out: bool) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.remove_client(client_id) {
            relay::announce_departure(
                &clients,
                client.id,
                &client.username,
                client.scene.as_deref(),
                timed_out,
            );
        }
    }

    async fn handle_packet(&mut self, client_id: u16, packet: UpdatePacket<ServerBoundField>) {
        let disconnect = {
            let mut clients = self.clients.write().await;
            relay::apply_packet(&mut clients, client_id, &packet, &self.settings)
        };
        if disconnect {
            info!("Client {} left", client_id);
            self.drop_client(client_id, false).await;
        }
    }

    async fn update_settings(&mut self, settings: GameSettings) {
        info!("Game settings changed: {:?}", settings);
        self.settings = settings;
        let clients = self.clients.read().await;
        for client in clients.iter() {
            client.updates.update(|packet| {
                packet.set_item(ClientBoundField::GameSettings, self.settings.clone())
            });
        }
    }

    /// Tells every client the server is going away and gives the send tasks
    /// a couple of ticks to deliver it.
    async fn shutdown(&mut self) {
        {
            let clients = self.clients.read().await;
            for client in clients.iter() {
                client.updates.update(|packet| {
                    packet.set_item(
                        ClientBoundField::ServerClientDisconnect,
                        ServerClientDisconnect {
                            reason: DisconnectReason::Shutdown,
                        },
                    )
                });
            }
        }
        for login in self.logins.read().await.values() {
            login.cancel.cancel();
        }
        tokio::time::sleep(self.config.tick_interval * 2).await;
    }

    /// Main server loop dispatching network events
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let receiver = self.spawn_network_receiver();
        let timeout_checker = self.spawn_timeout_checker();

        info!("Server started successfully");

        while let Some(message) = self.server_rx.recv().await {
            match message {
                ServerMessage::LoginRequested {
                    addr,
                    username,
                    addon_ids,
                    reply,
                } => {
                    self.admit(addr, username, addon_ids, reply).await;
                }
                ServerMessage::PacketReceived { client_id, packet } => {
                    self.handle_packet(client_id, packet).await;
                }
                ServerMessage::ClientTimeout {
                    client_id,
                    username,
                    scene,
                } => {
                    warn!("Client {} ({}) timed out", client_id, username);
                    let clients = self.clients.read().await;
                    relay::announce_departure(&clients, client_id, &username, scene.as_deref(), true);
                }
                ServerMessage::UpdateSettings(settings) => {
                    self.update_settings(settings).await;
                }
                ServerMessage::Shutdown => {
                    info!("Server shutting down");
                    self.shutdown().await;
                    break;
                }
            }
        }

        receiver.abort();
        timeout_checker.abort();
        self.clients.write().await.clear();
        Ok(())
    }
}

/// Routes one datagram by channel. Returns `false` once the dispatch loop is
/// gone.
async fn route_datagram(routing: &Routing, datagram: &[u8], addr: SocketAddr) -> bool {
    let (channel, payload) = match split_channel(datagram) {
        Ok(split) => split,
        Err(e) => {
            debug!("Ignoring datagram from {}: {}", addr, e);
            return true;
        }
    };

    match channel {
        Channel::Update => route_update(routing, payload, addr).await,
        Channel::Slice => route_slice(routing, payload, addr).await,
        Channel::Handshake => {
            route_handshake(routing, payload, addr).await;
            true
        }
    }
}

/// Connection state of the client at `addr`
struct ClientLink {
    client_id: u16,
    updates: Arc<ClientUpdates>,
    slicer: Arc<PacketSlicer>,
}

async fn find_link(routing: &Routing, addr: SocketAddr) -> Option<ClientLink> {
    let clients = routing.clients.read().await;
    clients.find_client_by_addr(addr).map(|client| ClientLink {
        client_id: client.id,
        updates: Arc::clone(&client.updates),
        slicer: Arc::clone(&client.slicer),
    })
}

/// Feeds one encoded packet to the client's update manager and forwards it
/// to the dispatch loop. Returns `false` once the dispatch loop is gone.
fn deliver_packet(routing: &Routing, link: &ClientLink, bytes: &[u8]) -> bool {
    let client_id = link.client_id;
    match link.updates.receive(bytes) {
        Ok(Some(packet)) => {
            if routing
                .server_tx
                .send(ServerMessage::PacketReceived { client_id, packet })
                .is_err()
            {
                error!("Dispatch loop stopped, closing receiver");
                return false;
            }
        }
        Ok(None) => debug!("Duplicate packet from client {}", client_id),
        Err(e) => warn!("Dropping packet from client {}: {}", client_id, e),
    }
    true
}

async fn route_update(routing: &Routing, payload: &[u8], addr: SocketAddr) -> bool {
    let Some(link) = find_link(routing, addr).await else {
        debug!("Update datagram from unknown address {}", addr);
        return true;
    };
    let client_id = link.client_id;

    let frames = match split_frames(payload) {
        Ok(frames) => frames,
        Err(e) => {
            warn!("Malformed update datagram from client {}: {}", client_id, e);
            return true;
        }
    };

    frames
        .into_iter()
        .all(|frame| deliver_packet(routing, &link, frame))
}

/// Acks a slice of an oversized packet and delivers the packet once it is
/// complete.
async fn route_slice(routing: &Routing, payload: &[u8], addr: SocketAddr) -> bool {
    let Some(link) = find_link(routing, addr).await else {
        debug!("Slice datagram from unknown address {}", addr);
        return true;
    };

    let input = match link.slicer.incoming(payload) {
        Ok(input) => input,
        Err(e) => {
            warn!("Malformed slice datagram from client {}: {}", link.client_id, e);
            return true;
        }
    };
    if let Some(reply) = input.reply {
        if let Err(e) = routing.socket.send_to(&reply, addr).await {
            error!("Failed to ack slice from client {}: {}", link.client_id, e);
        }
    }
    match input.packet {
        Some(packet) => deliver_packet(routing, &link, &packet),
        None => true,
    }
}

async fn route_handshake(routing: &Routing, payload: &[u8], addr: SocketAddr) {
    {
        let logins = routing.logins.read().await;
        if let Some(login) = logins.get(&addr) {
            if let Err(e) = login.incoming.push(payload.to_vec()) {
                debug!("Login from {} already finished: {}", addr, e);
            }
            return;
        }
    }

    if routing.clients.read().await.find_client_by_addr(addr).is_some() {
        debug!("Ignoring handshake datagram from connected client {}", addr);
        return;
    }

    let (incoming, receiver, cancel) = handoff_queue(HANDOFF_CAPACITY);
    if let Err(e) = incoming.push(payload.to_vec()) {
        error!("Failed to queue login datagram from {}: {}", addr, e);
        return;
    }
    routing
        .logins
        .write()
        .await
        .insert(addr, PendingLogin { incoming, cancel });
    debug!("Starting login for {}", addr);

    let routing = routing.clone();
    tokio::spawn(async move {
        let result = run_login(&routing, addr, receiver).await;
        routing.logins.write().await.remove(&addr);
        if let Err(e) = result {
            warn!("Login from {} failed: {}", addr, e);
        }
    });
}

async fn run_login(
    routing: &Routing,
    addr: SocketAddr,
    incoming: HandoffReceiver,
) -> Result<(), HandshakeError> {
    let peer = DatagramPeer::new(
        Arc::clone(&routing.socket),
        addr,
        incoming,
        routing.config.chunk.transport_datagram_size(),
    );
    let mut channel = ChunkChannel::new(peer, &routing.config.chunk)?;

    let request = receive_request(&mut channel).await?;
    let response = match validate_request(&request, &routing.addons) {
        Err(reason) => LoginResponse::Rejected { reason },
        Ok(addon_ids) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            routing
                .server_tx
                .send(ServerMessage::LoginRequested {
                    addr,
                    username: request.username.trim().to_string(),
                    addon_ids,
                    reply: reply_tx,
                })
                .map_err(|_| TransportError::Closed)?;
            reply_rx.await.map_err(|_| TransportError::Closed)?
        }
    };

    send_response(&mut channel, &response).await
}
