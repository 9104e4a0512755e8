//! Chunk transfer
//!
//! Payloads too large for one datagram are split into fixed-size slices.
//! The receiver acknowledges with a bitmap of the slices it holds and the
//! sender retransmits only the missing ones on a fixed interval, one chunk
//! at a time.
//!
//! Slice datagram: `u8 tag(0), u8 chunk_id, u8 slice_id, u8 total - 1,
//! [u16 length if final slice], data`. Ack datagram: `u8 tag(1), u8 chunk_id,
//! u8 total - 1, bitmap` with slice `i` at bit `i % 8` of byte `i / 8`.

use crate::codec::{PacketReader, PacketWriter};
use crate::error::ChunkError;
use log::{debug, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Slices per chunk; the count travels as `total - 1` in one byte.
pub const MAX_SLICES: usize = 256;

/// Framing bytes of a slice datagram, final-slice length included.
pub const SLICE_OVERHEAD: usize = 4 + 2;

/// Completed chunks remembered so late duplicates are acked, not delivered.
const COMPLETED_HISTORY: usize = 16;

const SLICE_TAG: u8 = 0;
const ACK_TAG: u8 = 1;

/// Largest slice that fits in a datagram of the given size.
pub fn max_slice_size(datagram_size: usize) -> usize {
    datagram_size.saturating_sub(SLICE_OVERHEAD)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub chunk_id: u8,
    pub slice_id: u8,
    pub total: u16,
    pub data: Vec<u8>,
}

impl Slice {
    pub fn is_final(&self) -> bool {
        u16::from(self.slice_id) + 1 == self.total
    }
}

/// Bitmap of the slices a receiver holds for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceAck {
    pub chunk_id: u8,
    pub total: u16,
    bitmap: Vec<u8>,
}

impl SliceAck {
    pub fn empty(chunk_id: u8, total: u16) -> Self {
        Self {
            chunk_id,
            total,
            bitmap: vec![0; bitmap_len(total)],
        }
    }

    /// Ack covering every slice of a chunk.
    pub fn full(chunk_id: u8, total: u16) -> Self {
        let mut ack = Self::empty(chunk_id, total);
        for slice_id in 0..total {
            ack.set(slice_id);
        }
        ack
    }

    pub fn set(&mut self, slice_id: u16) {
        if slice_id < self.total {
            self.bitmap[usize::from(slice_id / 8)] |= 1 << (slice_id % 8);
        }
    }

    pub fn is_acked(&self, slice_id: u16) -> bool {
        slice_id < self.total && self.bitmap[usize::from(slice_id / 8)] & (1 << (slice_id % 8)) != 0
    }

    pub fn acked_count(&self) -> usize {
        (0..self.total).filter(|slice_id| self.is_acked(*slice_id)).count()
    }

    pub fn is_complete(&self) -> bool {
        self.acked_count() == usize::from(self.total)
    }
}

fn bitmap_len(total: u16) -> usize {
    usize::from(total).div_ceil(8)
}

fn encode_total(total: u16) -> u8 {
    (total - 1) as u8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkDatagram {
    Slice(Slice),
    Ack(SliceAck),
}

impl ChunkDatagram {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        match self {
            ChunkDatagram::Slice(slice) => {
                writer.write_u8(SLICE_TAG);
                writer.write_u8(slice.chunk_id);
                writer.write_u8(slice.slice_id);
                writer.write_u8(encode_total(slice.total));
                if slice.is_final() {
                    writer.write_u16(slice.data.len() as u16);
                }
                writer.write_bytes(&slice.data);
            }
            ChunkDatagram::Ack(ack) => {
                writer.write_u8(ACK_TAG);
                writer.write_u8(ack.chunk_id);
                writer.write_u8(encode_total(ack.total));
                writer.write_bytes(&ack.bitmap);
            }
        }
        writer.into_bytes()
    }

    /// Decodes a datagram. Non-final slices are exactly `slice_size` long.
    pub fn decode(bytes: &[u8], slice_size: usize) -> Result<Self, ChunkError> {
        let mut reader = PacketReader::new(bytes);
        match reader.read_u8()? {
            SLICE_TAG => {
                let chunk_id = reader.read_u8()?;
                let slice_id = reader.read_u8()?;
                let total = u16::from(reader.read_u8()?) + 1;
                let length = if u16::from(slice_id) + 1 == total {
                    let length = usize::from(reader.read_u16()?);
                    if length == 0 || length > slice_size {
                        return Err(ChunkError::InvalidSliceLength { length, slice_size });
                    }
                    length
                } else {
                    slice_size
                };
                let data = reader.read_bytes(length)?;
                Ok(ChunkDatagram::Slice(Slice {
                    chunk_id,
                    slice_id,
                    total,
                    data,
                }))
            }
            ACK_TAG => {
                let chunk_id = reader.read_u8()?;
                let total = u16::from(reader.read_u8()?) + 1;
                let bitmap = reader.read_bytes(bitmap_len(total))?;
                Ok(ChunkDatagram::Ack(SliceAck {
                    chunk_id,
                    total,
                    bitmap,
                }))
            }
            other => Err(ChunkError::UnknownTag(other)),
        }
    }
}

#[derive(Debug)]
struct OutgoingChunk {
    chunk_id: u8,
    slices: Vec<Vec<u8>>,
    acked: Vec<bool>,
    last_sent: Option<Instant>,
}

impl OutgoingChunk {
    fn total(&self) -> u16 {
        self.slices.len() as u16
    }

    fn unacked(&self) -> Vec<ChunkDatagram> {
        let total = self.total();
        self.slices
            .iter()
            .enumerate()
            .filter(|(slice_id, _)| !self.acked[*slice_id])
            .map(|(slice_id, data)| {
                ChunkDatagram::Slice(Slice {
                    chunk_id: self.chunk_id,
                    slice_id: slice_id as u8,
                    total,
                    data: data.clone(),
                })
            })
            .collect()
    }
}

/// Sending half of a chunk transfer.
#[derive(Debug)]
pub struct ChunkSender {
    slice_size: usize,
    retransmit_interval: Duration,
    next_chunk_id: u8,
    queue: VecDeque<(u8, Vec<u8>)>,
    active: Option<OutgoingChunk>,
}

impl ChunkSender {
    pub fn new(slice_size: usize, retransmit_interval: Duration) -> Self {
        Self {
            slice_size,
            retransmit_interval,
            next_chunk_id: 0,
            queue: VecDeque::new(),
            active: None,
        }
    }

    /// Queues a payload and returns its chunk id.
    pub fn enqueue(&mut self, data: Vec<u8>) -> Result<u8, ChunkError> {
        if data.is_empty() {
            return Err(ChunkError::EmptyPayload);
        }
        let max = self.slice_size * MAX_SLICES;
        if data.len() > max {
            return Err(ChunkError::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }
        let chunk_id = self.next_chunk_id;
        self.next_chunk_id = self.next_chunk_id.wrapping_add(1);
        self.queue.push_back((chunk_id, data));
        Ok(chunk_id)
    }

    /// Slices due at `now`: all of them when a chunk starts, then the
    /// unacknowledged ones once per retransmit interval.
    pub fn poll(&mut self, now: Instant) -> Vec<ChunkDatagram> {
        if self.active.is_none() {
            let Some((chunk_id, data)) = self.queue.pop_front() else {
                return Vec::new();
            };
            let slices: Vec<Vec<u8>> = data.chunks(self.slice_size).map(<[u8]>::to_vec).collect();
            debug!("Sending chunk {} in {} slices", chunk_id, slices.len());
            self.active = Some(OutgoingChunk {
                chunk_id,
                acked: vec![false; slices.len()],
                slices,
                last_sent: None,
            });
        }

        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let due = match active.last_sent {
            None => true,
            Some(last) => now.duration_since(last) >= self.retransmit_interval,
        };
        if !due {
            return Vec::new();
        }
        active.last_sent = Some(now);
        active.unacked()
    }

    /// Applies an ack. Returns the chunk id once its last slice is acked.
    pub fn handle_ack(&mut self, ack: &SliceAck) -> Option<u8> {
        let active = self.active.as_mut()?;
        if active.chunk_id != ack.chunk_id {
            debug!("Ignoring ack for inactive chunk {}", ack.chunk_id);
            return None;
        }
        if active.total() != ack.total {
            warn!(
                "Ack for chunk {} reports {} slices, sent {}",
                ack.chunk_id,
                ack.total,
                active.total()
            );
            return None;
        }

        for (slice_id, acked) in active.acked.iter_mut().enumerate() {
            if ack.is_acked(slice_id as u16) {
                *acked = true;
            }
        }
        if active.acked.iter().all(|acked| *acked) {
            let chunk_id = active.chunk_id;
            self.active = None;
            debug!("Chunk {} fully acknowledged", chunk_id);
            return Some(chunk_id);
        }
        None
    }

    /// When the next retransmission is due, if a chunk is in flight.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.active {
            Some(active) => active.last_sent.map(|last| last + self.retransmit_interval),
            None if !self.queue.is_empty() => Some(Instant::now()),
            None => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// Chunks queued or in flight.
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }
}

#[derive(Debug)]
struct IncomingChunk {
    chunk_id: u8,
    slices: Vec<Option<Vec<u8>>>,
}

impl IncomingChunk {
    fn total(&self) -> u16 {
        self.slices.len() as u16
    }

    fn ack(&self) -> SliceAck {
        let mut ack = SliceAck::empty(self.chunk_id, self.total());
        for (slice_id, slice) in self.slices.iter().enumerate() {
            if slice.is_some() {
                ack.set(slice_id as u16);
            }
        }
        ack
    }
}

/// Result of handing one slice to a [`ChunkReceiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceOutcome {
    /// Ack to send back
    pub ack: SliceAck,
    /// The reassembled payload, the first time the chunk completes
    pub completed: Option<Vec<u8>>,
}

/// Receiving half of a chunk transfer.
#[derive(Debug)]
pub struct ChunkReceiver {
    slice_size: usize,
    current: Option<IncomingChunk>,
    completed: VecDeque<(u8, u16)>,
}

impl ChunkReceiver {
    pub fn new(slice_size: usize) -> Self {
        Self {
            slice_size,
            current: None,
            completed: VecDeque::with_capacity(COMPLETED_HISTORY),
        }
    }

    pub fn handle_slice(&mut self, slice: Slice) -> Result<SliceOutcome, ChunkError> {
        if slice.total == 0
            || usize::from(slice.total) > MAX_SLICES
            || u16::from(slice.slice_id) >= slice.total
        {
            return Err(ChunkError::SliceOutOfRange {
                chunk_id: slice.chunk_id,
                slice_id: slice.slice_id,
                total: slice.total,
            });
        }
        if !slice.is_final() && slice.data.len() != self.slice_size {
            return Err(ChunkError::InvalidSliceLength {
                length: slice.data.len(),
                slice_size: self.slice_size,
            });
        }

        if let Some(&(chunk_id, total)) = self
            .completed
            .iter()
            .find(|(chunk_id, _)| *chunk_id == slice.chunk_id)
        {
            let in_progress = self
                .current
                .as_ref()
                .is_some_and(|current| current.chunk_id == chunk_id);
            if !in_progress {
                return Ok(SliceOutcome {
                    ack: SliceAck::full(chunk_id, total),
                    completed: None,
                });
            }
        }

        let current = match self.current.take() {
            Some(current) if current.chunk_id == slice.chunk_id => {
                if current.total() != slice.total {
                    let expected = current.total();
                    self.current = Some(current);
                    return Err(ChunkError::TotalMismatch {
                        chunk_id: slice.chunk_id,
                        expected,
                        actual: slice.total,
                    });
                }
                current
            }
            previous => {
                if let Some(previous) = previous {
                    debug!(
                        "Abandoning incomplete chunk {} for chunk {}",
                        previous.chunk_id, slice.chunk_id
                    );
                }
                IncomingChunk {
                    chunk_id: slice.chunk_id,
                    slices: vec![None; usize::from(slice.total)],
                }
            }
        };
        let mut current = current;
        current.slices[usize::from(slice.slice_id)] = Some(slice.data);

        if current.slices.iter().all(Option::is_some) {
            let payload: Vec<u8> = current.slices.into_iter().flatten().flatten().collect();
            if self.completed.len() == COMPLETED_HISTORY {
                self.completed.pop_front();
            }
            self.completed.push_back((slice.chunk_id, slice.total));
            debug!("Chunk {} reassembled ({} bytes)", slice.chunk_id, payload.len());
            return Ok(SliceOutcome {
                ack: SliceAck::full(slice.chunk_id, slice.total),
                completed: Some(payload),
            });
        }

        let ack = current.ack();
        self.current = Some(current);
        Ok(SliceOutcome {
            ack,
            completed: None,
        })
    }
}
