//! # Client Library
//!
//! Client endpoint of the state-sync protocol. A [`network::Client`] logs in
//! over the handshake channel and turns into a [`network::Connection`] that
//! exchanges update packets with the server every tick.
//!
//! ## Connection Flow
//!
//! 1. Bind a local UDP socket and start the socket receiver, which splits
//!    incoming datagrams into handshake and update traffic by channel byte
//! 2. Send the login request through a chunk channel and wait for the answer
//! 3. Build the addon registry from the addon IDs the server assigned
//! 4. Run the update loop: flush the outgoing packet every tick, decode
//!    incoming packets into [`events::ClientEvent`]s and watch for timeouts
//!
//! Update datagrams that arrive while the login is still finishing are
//! queued and processed once the connection exists.
//!
//! ## Module Organization
//!
//! ### Events Module (`events`)
//! Reads received packets through their merged view and keeps the roster of
//! other players.
//!
//! ### Network Module (`network`)
//! Login, socket routing and the client's main loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use protocol::NetConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new("127.0.0.1:8080", "Hornet", NetConfig::default()).await?;
//!     let connection = client.connect().await?;
//!     connection.send_chat("hello");
//!
//!     // Runs until the server disconnects us or `/quit` is typed
//!     connection.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod network;
