//! Chunk transfer for oversized update packets
//!
//! An encoded update packet normally travels framed in one update datagram.
//! When the framed datagram would exceed the configured maximum, the packet is
//! queued on a [`ChunkSender`] instead and its slices go out on
//! [`Channel::Slice`]. The remote [`PacketSlicer`] acks the slices, reassembles
//! the packet and hands the bytes back for [`UpdateManager::receive`] as if
//! they had arrived in a single datagram.
//!
//! Slices are retransmitted from [`PacketSlicer::outgoing`], so the sender
//! must call it every tick even when nothing new was flushed.
//!
//! [`UpdateManager::receive`]: crate::connection::UpdateManager::receive

use crate::chunk::{ChunkDatagram, ChunkReceiver, ChunkSender};
use crate::config::ChunkConfig;
use crate::error::ConnectionError;
use crate::framing::{channel_datagram, update_datagram, Channel, CHANNEL_HEADER_SIZE, LENGTH_PREFIX_SIZE};
use log::{debug, warn};
use parking_lot::Mutex;
use std::time::Instant;

/// Chunks queued behind the active one before a warning is logged.
const BACKLOG_WARNING: usize = 8;

/// What one incoming slice-channel datagram produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SliceInput {
    /// Datagram to send back to the peer, an ack for a received slice
    pub reply: Option<Vec<u8>>,
    /// A fully reassembled update packet
    pub packet: Option<Vec<u8>>,
}

#[derive(Debug)]
struct SlicerState {
    sender: ChunkSender,
    receiver: ChunkReceiver,
}

/// Per-connection slicing of update packets that do not fit one datagram.
///
/// Shared between the send-tick task and the receive task of a connection.
#[derive(Debug)]
pub struct PacketSlicer {
    max_datagram_size: usize,
    slice_size: usize,
    state: Mutex<SlicerState>,
}

impl PacketSlicer {
    /// Creates a slicer sized by `config`, which must already be validated
    /// so that a slice plus its framing fits one datagram.
    pub fn new(config: &ChunkConfig) -> Self {
        Self {
            max_datagram_size: config.max_datagram_size,
            slice_size: config.slice_size,
            state: Mutex::new(SlicerState {
                sender: ChunkSender::new(config.slice_size, config.retransmit_interval),
                receiver: ChunkReceiver::new(config.slice_size),
            }),
        }
    }

    /// Whether an encoded packet fits one update datagram.
    pub fn fits(&self, packet: &[u8]) -> bool {
        CHANNEL_HEADER_SIZE + LENGTH_PREFIX_SIZE + packet.len() <= self.max_datagram_size
    }

    /// Returns the datagrams to send this tick.
    ///
    /// A packet that fits becomes one update datagram. A larger one is queued
    /// for chunk transfer. Either way the slices due at `now` are appended,
    /// which covers retransmission of earlier oversized packets.
    pub fn outgoing(&self, packet: &[u8], now: Instant) -> Result<Vec<Vec<u8>>, ConnectionError> {
        let mut datagrams = Vec::new();
        let mut state = self.state.lock();

        if self.fits(packet) {
            datagrams.push(update_datagram(std::iter::once(packet))?);
        } else {
            let chunk_id = state.sender.enqueue(packet.to_vec())?;
            debug!(
                "Update packet of {} bytes exceeds {} bytes, slicing as chunk {}",
                packet.len(),
                self.max_datagram_size,
                chunk_id
            );
            if state.sender.pending() > BACKLOG_WARNING {
                warn!(
                    "{} oversized update packets waiting for chunk transfer",
                    state.sender.pending()
                );
            }
        }

        datagrams.extend(
            state
                .sender
                .poll(now)
                .iter()
                .map(|datagram| channel_datagram(Channel::Slice, &datagram.encode())),
        );
        Ok(datagrams)
    }

    /// Handles the payload of a slice-channel datagram.
    pub fn incoming(&self, payload: &[u8]) -> Result<SliceInput, ConnectionError> {
        let datagram = ChunkDatagram::decode(payload, self.slice_size)?;
        let mut state = self.state.lock();

        match datagram {
            ChunkDatagram::Slice(slice) => {
                let outcome = state.receiver.handle_slice(slice)?;
                Ok(SliceInput {
                    reply: Some(channel_datagram(
                        Channel::Slice,
                        &ChunkDatagram::Ack(outcome.ack).encode(),
                    )),
                    packet: outcome.completed,
                })
            }
            ChunkDatagram::Ack(ack) => {
                if let Some(chunk_id) = state.sender.handle_ack(&ack) {
                    debug!("Sliced update packet {} delivered", chunk_id);
                }
                Ok(SliceInput::default())
            }
        }
    }

    /// Oversized packets queued or in flight.
    pub fn pending(&self) -> usize {
        self.state.lock().sender.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::split_channel;
    use std::time::Duration;

    fn config() -> ChunkConfig {
        ChunkConfig {
            retransmit_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    /// Feeds slice datagrams into `to`, and its acks back into `from`.
    fn deliver(from: &PacketSlicer, to: &PacketSlicer, datagrams: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        for datagram in datagrams {
            let (channel, payload) = split_channel(&datagram).unwrap();
            assert_eq!(channel, Channel::Slice);
            assert!(datagram.len() <= to.max_datagram_size);

            let input = to.incoming(payload).unwrap();
            packets.extend(input.packet);
            if let Some(reply) = input.reply {
                let (_, ack) = split_channel(&reply).unwrap();
                assert_eq!(from.incoming(ack).unwrap(), SliceInput::default());
            }
        }
        packets
    }

    #[test]
    fn test_small_packet_is_one_update_datagram() {
        let slicer = PacketSlicer::new(&config());
        let packet = payload(100);

        let datagrams = slicer.outgoing(&packet, Instant::now()).unwrap();
        assert_eq!(datagrams.len(), 1);
        let (channel, body) = split_channel(&datagrams[0]).unwrap();
        assert_eq!(channel, Channel::Update);
        assert_eq!(&body[LENGTH_PREFIX_SIZE..], packet.as_slice());
        assert_eq!(slicer.pending(), 0);
    }

    #[test]
    fn test_fit_boundary() {
        let slicer = PacketSlicer::new(&config());
        let largest = 1200 - CHANNEL_HEADER_SIZE - LENGTH_PREFIX_SIZE;
        assert!(slicer.fits(&payload(largest)));
        assert!(!slicer.fits(&payload(largest + 1)));
    }

    #[test]
    fn test_oversized_packet_is_sliced_and_reassembled() {
        let sender = PacketSlicer::new(&config());
        let receiver = PacketSlicer::new(&config());
        let packet = payload(2500);

        let datagrams = sender.outgoing(&packet, Instant::now()).unwrap();
        assert_eq!(datagrams.len(), 3);

        let packets = deliver(&sender, &receiver, datagrams);
        assert_eq!(packets, vec![packet]);
        assert_eq!(sender.pending(), 0);
    }

    #[test]
    fn test_lost_slice_is_retransmitted_on_a_later_tick() {
        let sender = PacketSlicer::new(&config());
        let receiver = PacketSlicer::new(&config());
        let packet = payload(2500);
        let start = Instant::now();

        let mut datagrams = sender.outgoing(&packet, start).unwrap();
        datagrams.remove(1);
        assert!(deliver(&sender, &receiver, datagrams).is_empty());
        assert_eq!(sender.pending(), 1);

        // Next tick, before the retransmit interval: only the small packet
        let tick = sender.outgoing(&payload(10), start).unwrap();
        assert_eq!(tick.len(), 1);

        let later = start + Duration::from_millis(20);
        let retry = sender.outgoing(&payload(10), later).unwrap();
        let slices: Vec<Vec<u8>> = retry
            .into_iter()
            .filter(|datagram| datagram[0] == Channel::Slice as u8)
            .collect();
        assert_eq!(slices.len(), 1);
        assert_eq!(deliver(&sender, &receiver, slices), vec![packet]);
        assert_eq!(sender.pending(), 0);
    }

    #[test]
    fn test_garbage_slice_payload_is_an_error() {
        let slicer = PacketSlicer::new(&config());
        assert!(matches!(
            slicer.incoming(&[7, 0, 0]),
            Err(ConnectionError::Chunk(_))
        ));
    }
}
