//! # Netsync Protocol Library
//!
//! This library contains everything the server and client share: the binary
//! codec, the reliable update packet and its reliability engine, the addon
//! registry and the chunked handshake channel. Both sides link the same code
//! so that the wire format can never drift between them.
//!
//! ## Wire Format
//!
//! ### Primitive Codec (`codec`, `value`)
//! All integers and floats are little-endian. Strings are a `u16` character
//! count followed by UTF-8. Vectors are consecutive `f32` components. Reads past the
//! end of a buffer fail instead of returning garbage.
//!
//! ### Field Sets (`flags`)
//! A packet announces which of its fields are present with a bit-flag header
//! whose width (0, 1, 2, 4 or 8 bytes) is the smallest that fits the size of
//! the field space.
//!
//! ### Update Packets (`packet`)
//! Every update packet carries:
//! - A header with its sequence number, the latest received sequence and an
//!   ack bitfield covering the sequences before it
//! - The normal payload for this tick
//! - A resend section that re-delivers reliable data from lost packets,
//!   keyed by the sequence the data was first sent in
//! - Length-delimited addon blocks, each isolated from the others
//!
//! ## Reliability (`reliability`, `connection`)
//!
//! Packets are sent unreliably. Reliable items of a packet that is not acked
//! within the loss threshold are copied into the next outgoing packet, and the
//! receiving side drops resent data it already has. The [`UpdateManager`]
//! wraps the engine together with the packet being built for the next tick,
//! so any task can add data while a tick task flushes it.
//!
//! ## Addons (`addon`)
//!
//! Addons register a field-space size and an item factory under a one-byte
//! id. An addon block that fails to decode is dropped on its own; the core
//! payload and other addons are still delivered.
//!
//! ## Handshake (`handshake`, `chunk`, `secure`, `framing`)
//!
//! Login messages can exceed a single datagram, so they are split into
//! slices and transferred with per-slice acknowledgement over a
//! [`SecureTransport`]. Each datagram on the shared socket starts with a
//! channel byte telling handshake traffic apart from update packets.
//!
//! ## Oversized Updates (`slicing`)
//!
//! An update packet that would not fit one datagram is sent with the same
//! chunk transfer on its own channel and handed to the update manager once
//! reassembled.
//!
//! ## Usage Example
//!
//! ```rust
//! use protocol::items::ChatMessage;
//! use protocol::{AddonRegistry, ClientBoundField, NetConfig, ServerBoundField, UpdateManager};
//! use std::sync::Arc;
//!
//! let config = NetConfig::default();
//! let registry = Arc::new(AddonRegistry::new());
//!
//! let server: UpdateManager<ClientBoundField, ServerBoundField> =
//!     UpdateManager::new(&config, Arc::clone(&registry)).unwrap();
//! let client: UpdateManager<ServerBoundField, ClientBoundField> =
//!     UpdateManager::new(&config, registry).unwrap();
//!
//! // Queue a reliable chat line and send it on the next tick
//! server.update(|packet| packet.push_entry(ClientBoundField::ChatMessage, ChatMessage::new("hi")));
//! let bytes = server.flush().unwrap();
//!
//! let packet = client.receive(&bytes).unwrap().expect("not a duplicate");
//! assert!(packet.contains(ClientBoundField::ChatMessage));
//! ```

pub mod addon;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod fields;
pub mod flags;
pub mod framing;
pub mod handshake;
pub mod item;
pub mod items;
pub mod packet;
pub mod reliability;
pub mod secure;
pub mod slicing;
pub mod value;

pub use addon::{AddonPacketData, AddonRegistry};
pub use codec::{PacketReader, PacketWriter, Vector2, Vector3};
pub use config::{ChunkConfig, NetConfig, ReliabilityConfig};
pub use connection::UpdateManager;
pub use fields::{ClientBoundField, ServerBoundField};
pub use flags::{FieldId, FieldSpace};
pub use handshake::{ChunkChannel, NetworkAddon};
pub use item::{ItemBatch, ItemRef, PayloadItem};
pub use packet::UpdatePacket;
pub use reliability::ReliabilityEngine;
pub use secure::SecureTransport;
pub use slicing::PacketSlicer;
pub use value::Value;
