//! Login handshake
//!
//! Login messages are serialized with bincode and carried by a
//! [`ChunkChannel`], which runs chunk transfer over a [`SecureTransport`] so
//! a large roster still gets through a transport with small datagrams.

use crate::addon::{AddonFactory, AddonRegistry};
use crate::chunk::{ChunkDatagram, ChunkReceiver, ChunkSender};
use crate::config::ChunkConfig;
use crate::error::{ChunkError, HandshakeError, TransportError};
use crate::item::PayloadItem;
use crate::items::{GameSettings, PlayerInfo};
use crate::secure::SecureTransport;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bumped whenever the update packet layout changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// A network-enabled addon as advertised during login.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddonInfo {
    pub name: String,
    pub version: String,
}

impl AddonInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// An addon's networking half: what it advertises and how its items decode.
#[derive(Clone)]
pub struct NetworkAddon {
    pub info: AddonInfo,
    pub field_space_size: u8,
    pub factory: AddonFactory,
}

impl NetworkAddon {
    pub fn new<F>(info: AddonInfo, field_space_size: u8, factory: F) -> Self
    where
        F: Fn(u8) -> Option<Box<dyn PayloadItem>> + Send + Sync + 'static,
    {
        Self {
            info,
            field_space_size,
            factory: Arc::new(factory),
        }
    }
}

impl fmt::Debug for NetworkAddon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkAddon")
            .field("info", &self.info)
            .field("field_space_size", &self.field_space_size)
            .finish_non_exhaustive()
    }
}

/// Builds the registry for a connection from negotiated addon ids, one per
/// entry of `addons`.
pub fn build_registry(addons: &[NetworkAddon], ids: &[u8]) -> Result<AddonRegistry, HandshakeError> {
    if addons.len() != ids.len() {
        return Err(HandshakeError::Rejected(format!(
            "got {} addon ids for {} addons",
            ids.len(),
            addons.len()
        )));
    }
    let mut registry = AddonRegistry::new();
    for (addon, &id) in addons.iter().zip(ids) {
        let factory = Arc::clone(&addon.factory);
        registry.register(id, addon.field_space_size, move |field_id| factory(field_id))?;
    }
    Ok(registry)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub protocol_version: u16,
    pub username: String,
    pub addons: Vec<AddonInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginResponse {
    Accepted {
        player_id: u16,
        /// Addon id for each entry of the request's addon list
        addon_ids: Vec<u8>,
        /// Players already on the server
        players: Vec<PlayerInfo>,
        settings: GameSettings,
    },
    Rejected {
        reason: String,
    },
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, HandshakeError> {
    Ok(bincode::serialize(message)?)
}

pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, HandshakeError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Matches the client's addons against the server's by name and version.
///
/// Both sides must run exactly the same set. Addon ids are the positions in
/// the server's list; the result gives the id of each client addon in the
/// client's order.
pub fn negotiate_addons(server: &[AddonInfo], client: &[AddonInfo]) -> Result<Vec<u8>, String> {
    let mut ids = Vec::with_capacity(client.len());
    for addon in client {
        let position = server
            .iter()
            .position(|known| known == addon)
            .ok_or_else(|| format!("addon {} {} is not on the server", addon.name, addon.version))?;
        let id = u8::try_from(position)
            .map_err(|_| format!("addon {} has no free network id", addon.name))?;
        if ids.contains(&id) {
            return Err(format!("addon {} listed twice", addon.name));
        }
        ids.push(id);
    }
    if let Some(missing) = server.iter().find(|known| !client.contains(known)) {
        return Err(format!(
            "server requires addon {} {}",
            missing.name, missing.version
        ));
    }
    Ok(ids)
}

/// Reliable message channel built from chunk transfer over a secure
/// transport. Messages are delivered whole and in order.
pub struct ChunkChannel<T: SecureTransport> {
    transport: T,
    sender: ChunkSender,
    receiver: ChunkReceiver,
    delivered: VecDeque<Vec<u8>>,
    slice_size: usize,
    retransmit_interval: Duration,
    transfer_timeout: Duration,
}

impl<T: SecureTransport> ChunkChannel<T> {
    pub fn new(transport: T, config: &ChunkConfig) -> Result<Self, ChunkError> {
        let max = crate::chunk::max_slice_size(transport.max_datagram_size());
        if config.slice_size == 0 || config.slice_size > max {
            return Err(ChunkError::SliceTooLarge {
                slice_size: config.slice_size,
                overhead: crate::chunk::SLICE_OVERHEAD,
                max: transport.max_datagram_size(),
            });
        }
        Ok(Self {
            sender: ChunkSender::new(config.slice_size, config.retransmit_interval),
            receiver: ChunkReceiver::new(config.slice_size),
            delivered: VecDeque::new(),
            slice_size: config.slice_size,
            retransmit_interval: config.retransmit_interval,
            transfer_timeout: config.transfer_timeout,
            transport,
        })
    }

    /// Sends one message and waits until every slice is acknowledged.
    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), HandshakeError> {
        self.sender.enqueue(data)?;
        let deadline = Instant::now() + self.transfer_timeout;

        while !self.sender.is_idle() {
            for datagram in self.sender.poll(Instant::now()) {
                self.transport.send(&datagram.encode()).await?;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HandshakeError::TimedOut(self.transfer_timeout));
            }
            let wait = self.retransmit_interval.min(deadline - now);
            if let Some(datagram) = self.transport.receive(wait).await? {
                self.handle_datagram(&datagram).await?;
            }
        }
        Ok(())
    }

    /// Waits for the next whole message.
    pub async fn recv(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let deadline = Instant::now() + self.transfer_timeout;
        loop {
            if let Some(message) = self.delivered.pop_front() {
                return Ok(message);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HandshakeError::TimedOut(self.transfer_timeout));
            }
            if let Some(datagram) = self.transport.receive(deadline - now).await? {
                self.handle_datagram(&datagram).await?;
            }
        }
    }

    /// Keeps answering retransmitted slices for a while, so the peer sees
    /// the final ack even if the first copy was lost.
    pub async fn linger(&mut self, duration: Duration) -> Result<(), HandshakeError> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            match self.transport.receive(deadline - now).await {
                Ok(Some(datagram)) => self.handle_datagram(&datagram).await?,
                Ok(None) => return Ok(()),
                Err(TransportError::Closed | TransportError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn handle_datagram(&mut self, bytes: &[u8]) -> Result<(), HandshakeError> {
        let datagram = match ChunkDatagram::decode(bytes, self.slice_size) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("Ignoring malformed chunk datagram: {}", e);
                return Ok(());
            }
        };

        match datagram {
            ChunkDatagram::Slice(slice) => match self.receiver.handle_slice(slice) {
                Ok(outcome) => {
                    let ack = ChunkDatagram::Ack(outcome.ack).encode();
                    self.transport.send(&ack).await?;
                    if let Some(message) = outcome.completed {
                        debug!("Received {} byte handshake message", message.len());
                        self.delivered.push_back(message);
                    }
                }
                Err(e) => warn!("Ignoring slice: {}", e),
            },
            ChunkDatagram::Ack(ack) => {
                self.sender.handle_ack(&ack);
            }
        }
        Ok(())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::MemoryTransport;

    fn config() -> ChunkConfig {
        ChunkConfig {
            max_datagram_size: 64,
            slice_size: 32,
            retransmit_interval: Duration::from_millis(10),
            transfer_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_login_messages_roundtrip() {
        let request = LoginRequest {
            protocol_version: PROTOCOL_VERSION,
            username: "Hornet".to_string(),
            addons: vec![AddonInfo::new("Emotes", "1.2")],
        };
        let bytes = encode_message(&request).unwrap();
        assert_eq!(decode_message::<LoginRequest>(&bytes).unwrap(), request);

        assert!(decode_message::<LoginResponse>(&[0xFF; 3]).is_err());
    }

    #[test]
    fn test_addon_negotiation() {
        let server = vec![AddonInfo::new("Emotes", "1.2"), AddonInfo::new("Tag", "0.3")];

        let client = vec![AddonInfo::new("Tag", "0.3"), AddonInfo::new("Emotes", "1.2")];
        assert_eq!(negotiate_addons(&server, &client), Ok(vec![1, 0]));

        let wrong_version = vec![AddonInfo::new("Tag", "0.4"), AddonInfo::new("Emotes", "1.2")];
        assert!(negotiate_addons(&server, &wrong_version).is_err());

        let missing = vec![AddonInfo::new("Emotes", "1.2")];
        assert!(negotiate_addons(&server, &missing).is_err());

        assert_eq!(negotiate_addons(&[], &[]), Ok(vec![]));
    }

    #[test]
    fn test_registry_from_negotiated_ids() {
        use crate::item::ItemBatch;
        use crate::items::ChatMessage;

        let addons = vec![
            NetworkAddon::new(AddonInfo::new("Emotes", "1.2"), 2, |field| match field {
                0 | 1 => Some(Box::new(ItemBatch::<ChatMessage>::reliable()) as Box<dyn PayloadItem>),
                _ => None,
            }),
            NetworkAddon::new(AddonInfo::new("Tag", "0.3"), 1, |field| match field {
                0 => Some(Box::new(ItemBatch::<ChatMessage>::reliable()) as Box<dyn PayloadItem>),
                _ => None,
            }),
        ];

        let registry = build_registry(&addons, &[1, 0]).unwrap();
        assert_eq!(registry.info(1).unwrap().field_space_size(), 2);
        assert_eq!(registry.info(0).unwrap().field_space_size(), 1);

        assert!(matches!(
            build_registry(&addons, &[0]),
            Err(HandshakeError::Rejected(_))
        ));
    }

    #[test]
    fn test_slice_must_fit_transport() {
        let (transport, _) = MemoryTransport::pair(16);
        assert!(matches!(
            ChunkChannel::new(transport, &config()),
            Err(ChunkError::SliceTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_large_message_over_small_datagrams() {
        let (a, b) = MemoryTransport::pair(40);
        let mut a = ChunkChannel::new(a, &config()).unwrap();
        let mut b = ChunkChannel::new(b, &config()).unwrap();

        let message: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let expected = message.clone();

        let receiver = tokio::spawn(async move {
            let received = b.recv().await.unwrap();
            b.linger(Duration::from_millis(50)).await.unwrap();
            received
        });
        a.send(message).await.unwrap();
        assert_eq!(receiver.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let (a, _b) = MemoryTransport::pair(64);
        let mut channel = ChunkChannel::new(
            a,
            &ChunkConfig {
                transfer_timeout: Duration::from_millis(30),
                ..config()
            },
        )
        .unwrap();
        assert!(matches!(
            channel.recv().await,
            Err(HandshakeError::TimedOut(_))
        ));
    }
}
