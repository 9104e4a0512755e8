//! Connected client roster for the relay server
//!
//! This module tracks every client that completed the login handshake:
//! - Player ID assignment and capacity limits
//! - The per-client update manager that owns its reliability state, and the
//!   slicer that carries its oversized packets
//! - The last known scene, pose and team, used to introduce players to
//!   each other when they meet in a scene
//! - Timeout detection through each connection's receive clock
//!
//! The manager itself performs no I/O. The network layer reads it to route
//! incoming datagrams and the dispatch loop mutates it.

use log::info;
use protocol::items::{PlayerInfo, SceneEntry, Team};
use protocol::{ChunkConfig, ClientBoundField, PacketSlicer, ServerBoundField, UpdateManager, Vector2};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Update manager of one server-side connection.
pub type ClientUpdates = UpdateManager<ClientBoundField, ServerBoundField>;

/// A logged-in client and what the server knows about its player
#[derive(Debug)]
pub struct Client {
    /// Player ID assigned at login
    pub id: u16,
    /// Network address updates are sent to
    pub addr: SocketAddr,
    pub username: String,
    /// Reliability state and the packet being built for the next tick
    pub updates: Arc<ClientUpdates>,
    /// Chunk transfer of update packets too large for one datagram
    pub slicer: Arc<PacketSlicer>,
    /// Scene the player is in, if any
    pub scene: Option<String>,
    pub position: Vector2,
    pub scale: bool,
    pub animation: u16,
    pub team: Team,
    send_task: Option<JoinHandle<()>>,
}

impl Client {
    /// Creates a client that has not entered any scene yet.
    ///
    /// The player starts at the origin with no team. The send-tick task is
    /// attached afterwards with [`Client::set_send_task`].
    pub fn new(
        id: u16,
        addr: SocketAddr,
        username: String,
        updates: Arc<ClientUpdates>,
        slicer: Arc<PacketSlicer>,
    ) -> Self {
        Self {
            id,
            addr,
            username,
            updates,
            slicer,
            scene: None,
            position: Vector2::default(),
            scale: false,
            animation: 0,
            team: Team::None,
            send_task: None,
        }
    }

    /// The roster entry other clients know this player by.
    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id,
            username: self.username.clone(),
        }
    }

    /// The entry that introduces this player to others in its scene.
    pub fn scene_entry(&self) -> Option<SceneEntry> {
        self.scene.as_ref().map(|scene| SceneEntry {
            id: self.id,
            scene: scene.clone(),
            position: self.position,
            scale: self.scale,
            animation: self.animation,
            team: self.team,
        })
    }

    /// Whether the player was last seen in `scene`.
    ///
    /// Scene names compare exactly; a player outside every scene is in
    /// none of them.
    pub fn in_scene(&self, scene: &str) -> bool {
        self.scene.as_deref() == Some(scene)
    }

    /// Ties the client's send-tick task to its lifetime.
    pub fn set_send_task(&mut self, handle: JoinHandle<()>) {
        if let Some(previous) = self.send_task.replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.send_task.take() {
            handle.abort();
        }
    }
}

/// Manages all logged-in clients
///
/// Player IDs start at 1 and skip IDs that are still in use when the
/// counter wraps.
pub struct ClientManager {
    clients: HashMap<u16, Client>,
    next_client_id: u16,
    max_clients: usize,
    chunk: ChunkConfig,
}

impl ClientManager {
    /// Creates an empty manager for at most `max_clients` clients, slicing
    /// oversized packets with the default chunk settings.
    pub fn new(max_clients: usize) -> Self {
        Self::with_chunk_config(max_clients, ChunkConfig::default())
    }

    /// Creates an empty manager whose clients slice oversized packets
    /// according to `chunk`.
    pub fn with_chunk_config(max_clients: usize, chunk: ChunkConfig) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            chunk,
        }
    }

    /// Whether another login would exceed the capacity.
    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    /// Adds a client and returns its player ID, or `None` when the server is
    /// at capacity.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        username: String,
        updates: Arc<ClientUpdates>,
    ) -> Option<u16> {
        if self.is_full() {
            return None;
        }

        let client_id = self.allocate_id()?;
        info!("Client {} ({}) connected from {}", client_id, username, addr);
        let slicer = Arc::new(PacketSlicer::new(&self.chunk));
        self.clients.insert(
            client_id,
            Client::new(client_id, addr, username, updates, slicer),
        );
        Some(client_id)
    }

    fn allocate_id(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX {
            let candidate = self.next_client_id;
            self.next_client_id = self.next_client_id.wrapping_add(1).max(1);
            if candidate != 0 && !self.clients.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Removes a client. Dropping the returned value stops its send task.
    pub fn remove_client(&mut self, client_id: u16) -> Option<Client> {
        let client = self.clients.remove(&client_id)?;
        info!("Client {} ({}) disconnected", client.id, client.username);
        Some(client)
    }

    /// Looks up a client by player ID.
    pub fn get(&self, client_id: u16) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    /// Looks up a client by player ID for mutation, as the dispatch loop
    /// does when a packet changes the player's scene or pose.
    pub fn get_mut(&mut self, client_id: u16) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// Finds the client sending from `addr`.
    ///
    /// Used by the receive task to route update and slice datagrams.
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<&Client> {
        self.clients.values().find(|client| client.addr == addr)
    }

    /// Every connected client, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// Every client except `exclude`.
    pub fn others(&self, exclude: u16) -> impl Iterator<Item = &Client> {
        self.clients.values().filter(move |client| client.id != exclude)
    }

    /// Clients other than `exclude` whose player is in `scene`.
    pub fn others_in_scene<'a>(
        &'a self,
        exclude: u16,
        scene: &'a str,
    ) -> impl Iterator<Item = &'a Client> {
        self.others(exclude).filter(move |client| client.in_scene(scene))
    }

    /// Player list sent to a newly logged-in client, ordered by ID.
    pub fn roster(&self) -> Vec<PlayerInfo> {
        let mut players: Vec<PlayerInfo> = self.clients.values().map(Client::info).collect();
        players.sort_by_key(|player| player.id);
        players
    }

    /// Removes and returns the clients whose connection went silent.
    pub fn check_timeouts(&mut self) -> Vec<Client> {
        let timed_out: Vec<u16> = self
            .clients
            .values()
            .filter(|client| client.updates.check_timeout().is_err())
            .map(|client| client.id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|client_id| self.clients.remove(&client_id))
            .inspect(|client| info!("Client {} ({}) timed out", client.id, client.username))
            .collect()
    }

    /// Drops every client, stopping their send tasks.
    pub fn clear(&mut self) {
        self.clients.clear();
    }

    /// Number of connected clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is connected.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
