//! # Relay Server Library
//!
//! This library provides the server endpoint of the state-sync protocol. It
//! accepts logins, keeps one reliable update connection per client and relays
//! what each client reports to the clients that need it.
//!
//! ## Core Responsibilities
//!
//! ### Login
//! New addresses start with the handshake channel. The login request is
//! reassembled from chunk slices, checked against the server's protocol
//! version and network addons, and answered with the player ID, the addon
//! IDs to use, the current roster and the game settings.
//!
//! ### Connection Management
//! Every logged-in client owns an update manager holding its reliability
//! state and the packet being built for its next send tick. Clients that stay
//! silent past the connection timeout are removed and announced as timed out.
//!
//! ### Relay
//! Player poses, entity updates and deaths go to the players in the same
//! scene. Team changes, chat, connects and disconnects go to everyone.
//!
//! ## Architecture Design
//!
//! ### Task Layout
//! - **Network Receiver**: reads the UDP socket and routes each datagram by
//!   its channel byte, either to a login task or to the sender's update
//!   manager
//! - **Login Tasks**: one per address in the middle of a handshake
//! - **Send Ticks**: one per client, flushing its update manager every tick
//! - **Timeout Checker**: removes silent clients on a fixed interval
//! - **Dispatch Loop**: owns the relay logic and all roster mutation
//!
//! ### Reliability
//! Update packets are sent unreliably. Reliable items of packets that are not
//! acknowledged in time are resent inside later packets, so relayed chat and
//! scene changes arrive even on a lossy link.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Player ID assignment, capacity limits, per-client scene and pose, timeout
//! detection.
//!
//! ### Login Module (`login`)
//! Request validation and the message exchange over the chunk channel.
//!
//! ### Relay Module (`relay`)
//! Applies an incoming packet to the roster and queues the resulting items
//! for other clients.
//!
//! ### Network Module (`network`)
//! Socket routing, task spawning and the dispatch loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use protocol::NetConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Bind with default timing and room for 32 players
//!     let mut server = Server::new("127.0.0.1:8080", NetConfig::default(), 32).await?;
//!
//!     // Runs until a shutdown is requested through `server.handle()`
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod login;
pub mod network;
pub mod relay;
