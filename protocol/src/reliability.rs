//! Reliability engine
//!
//! Tracks sequence numbers and acknowledgements for one remote endpoint and
//! decides which reliable items of presumed-lost packets go back into the
//! current outgoing packet.
//!
//! A sent packet counts as lost once the remote end has acknowledged a
//! sequence at least `loss_threshold` newer without acknowledging it.

use crate::config::ReliabilityConfig;
use crate::error::ConfigError;
use crate::flags::{FieldId, FlagWidth};
use crate::packet::{PacketHeader, UpdatePacket};
use log::{debug, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Whether `a` is newer than `b`, allowing for wrap-around.
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    const HALF: u16 = u16::MAX / 2 + 1;
    (a > b && a - b <= HALF) || (a < b && b - a > HALF)
}

/// Exponential moving average of round trip times.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed: f64,
    alpha: f64,
    samples: u64,
}

impl RttEstimator {
    pub fn new(initial: Duration, alpha: f64) -> Self {
        Self {
            smoothed: initial.as_secs_f64(),
            alpha,
            samples: 0,
        }
    }

    pub fn add_sample(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64();
        if self.samples == 0 {
            self.smoothed = sample;
        } else {
            self.smoothed += self.alpha * (sample - self.smoothed);
        }
        self.samples += 1;
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_secs_f64(self.smoothed.max(0.0))
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[derive(Debug)]
struct SentPacket<F: FieldId> {
    sequence: u16,
    sent_at: Instant,
    reliable: UpdatePacket<F>,
}

/// What processing one incoming packet did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveReport {
    pub sequence: u16,
    /// The packet was already received; its contents must be ignored
    pub duplicate: bool,
    /// Own sequences newly acknowledged by the remote end
    pub acked: Vec<u16>,
    /// Own sequences declared lost
    pub lost: Vec<u16>,
    /// Incoming resend entries dropped because their data already arrived
    pub dropped_resends: Vec<u16>,
    /// The packet's reliable data had already arrived through a resend and
    /// was removed from it
    pub stripped_reliable: bool,
}

/// Bounded set of recently seen sequence numbers.
#[derive(Debug)]
struct SequenceHistory {
    entries: VecDeque<u16>,
    capacity: usize,
}

impl SequenceHistory {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, sequence: u16) -> bool {
        self.entries.contains(&sequence)
    }

    fn insert(&mut self, sequence: u16) {
        if self.contains(sequence) {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(sequence);
    }
}

/// Per-endpoint sequence, ack and resend state.
///
/// `F` is the field space of packets this end sends.
#[derive(Debug)]
pub struct ReliabilityEngine<F: FieldId> {
    config: ReliabilityConfig,
    ack_width: FlagWidth,
    local_sequence: u16,
    remote_sequence: u16,
    received_any: bool,
    received_bits: u64,
    received: SequenceHistory,
    /// Origins whose reliable data arrived in another packet's resend section
    resent: SequenceHistory,
    acked: SequenceHistory,
    sent: VecDeque<SentPacket<F>>,
    rtt: RttEstimator,
    last_received: Instant,
}

impl<F: FieldId> ReliabilityEngine<F> {
    pub fn new(config: ReliabilityConfig, now: Instant) -> Result<Self, ConfigError> {
        config.validate()?;
        let ack_width = config.ack_width()?;
        Ok(Self {
            ack_width,
            local_sequence: 0,
            remote_sequence: 0,
            received_any: false,
            received_bits: 0,
            received: SequenceHistory::new(config.history_size),
            resent: SequenceHistory::new(config.history_size),
            acked: SequenceHistory::new(config.history_size),
            sent: VecDeque::new(),
            rtt: RttEstimator::new(config.initial_rtt, config.rtt_smoothing),
            last_received: now,
            config,
        })
    }

    pub fn ack_width(&self) -> FlagWidth {
        self.ack_width
    }

    /// Sequence the next stamped packet will carry.
    pub fn local_sequence(&self) -> u16 {
        self.local_sequence
    }

    /// Highest sequence received, if any.
    pub fn remote_sequence(&self) -> Option<u16> {
        self.received_any.then_some(self.remote_sequence)
    }

    pub fn rtt(&self) -> Duration {
        self.rtt.rtt()
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// Sent packets still waiting for an ack or a loss verdict.
    pub fn in_flight(&self) -> usize {
        self.sent.len()
    }

    fn window_mask(&self) -> u64 {
        match self.ack_width.bits() {
            64 => u64::MAX,
            bits => (1u64 << bits) - 1,
        }
    }

    /// Stamps the packet with the next sequence and the current ack state.
    pub fn stamp(&mut self, packet: &mut UpdatePacket<F>) {
        packet.header = PacketHeader {
            sequence: self.local_sequence,
            ack: self.remote_sequence,
            ack_bits: self.received_bits & self.window_mask(),
        };
        self.local_sequence = self.local_sequence.wrapping_add(1);
    }

    /// Remembers the reliable part of a sent packet until it is acked or lost.
    ///
    /// With `max_in_flight` packets already waiting, the oldest one is given
    /// up on and its reliable items are queued into `outgoing` as if it had
    /// been lost.
    pub fn record_sent(
        &mut self,
        packet: &UpdatePacket<F>,
        outgoing: &mut UpdatePacket<F>,
        now: Instant,
    ) {
        if self.sent.len() >= self.config.max_in_flight {
            if let Some(evicted) = self.sent.pop_front() {
                warn!(
                    "Too many packets in flight, resending reliable data of {}",
                    evicted.sequence
                );
                requeue(evicted, outgoing);
            }
        }
        self.sent.push_back(SentPacket {
            sequence: packet.sequence(),
            sent_at: now,
            reliable: packet.reliable_part(),
        });
    }

    /// Processes an incoming packet.
    ///
    /// Updates the ack state, drops incoming resend entries whose data already
    /// arrived, then applies the remote end's acks. Reliable items of packets
    /// found lost are queued into `outgoing`.
    ///
    /// A packet whose reliable data already came through a resend is still
    /// delivered, with only its unreliable items left.
    pub fn receive<In: FieldId>(
        &mut self,
        incoming: &mut UpdatePacket<In>,
        outgoing: &mut UpdatePacket<F>,
        now: Instant,
    ) -> ReceiveReport {
        let header = incoming.header;
        let mut report = ReceiveReport {
            sequence: header.sequence,
            ..Default::default()
        };
        self.last_received = now;

        if self.received.contains(header.sequence) {
            debug!("Duplicate packet {}", header.sequence);
            report.duplicate = true;
            return report;
        }
        self.received.insert(header.sequence);
        self.update_received_bits(header.sequence);

        if self.resent.contains(header.sequence) {
            debug!(
                "Packet {} arrived after its reliable data was resent",
                header.sequence
            );
            incoming.strip_reliable();
            report.stripped_reliable = true;
        }

        let origins: Vec<u16> = incoming.resend_items().keys().copied().collect();
        for origin in origins {
            if self.received.contains(origin) || self.resent.contains(origin) {
                incoming.remove_resend(origin);
                report.dropped_resends.push(origin);
            } else {
                self.resent.insert(origin);
            }
        }

        self.apply_acks(header, outgoing, now, &mut report);
        report
    }

    fn update_received_bits(&mut self, sequence: u16) {
        if !self.received_any {
            self.received_any = true;
            self.remote_sequence = sequence;
            self.received_bits = 1;
        } else if sequence_greater_than(sequence, self.remote_sequence) {
            let shift = sequence.wrapping_sub(self.remote_sequence);
            self.received_bits = if shift >= 64 {
                1
            } else {
                (self.received_bits << shift) | 1
            };
            self.remote_sequence = sequence;
        } else {
            let offset = self.remote_sequence.wrapping_sub(sequence);
            if usize::from(offset) < self.ack_width.bits() {
                self.received_bits |= 1 << offset;
            }
        }
        self.received_bits &= self.window_mask();
    }

    fn apply_acks(
        &mut self,
        header: PacketHeader,
        outgoing: &mut UpdatePacket<F>,
        now: Instant,
        report: &mut ReceiveReport,
    ) {
        // Bit 0 clear: the remote end has not received anything yet
        if header.ack_bits & 1 == 0 {
            return;
        }

        let window = self.ack_width.bits();
        let threshold = self.config.loss_threshold;
        let mut lost = Vec::new();
        let mut pending = VecDeque::with_capacity(self.sent.len());

        for sent in self.sent.drain(..) {
            if sequence_greater_than(sent.sequence, header.ack) {
                pending.push_back(sent);
                continue;
            }
            let offset = header.ack.wrapping_sub(sent.sequence);
            if usize::from(offset) < window && header.ack_bits & (1 << offset) != 0 {
                self.rtt.add_sample(now.saturating_duration_since(sent.sent_at));
                self.acked.insert(sent.sequence);
                report.acked.push(sent.sequence);
            } else if offset >= threshold {
                lost.push(sent);
            } else {
                pending.push_back(sent);
            }
        }
        self.sent = pending;

        for sent in lost {
            if self.acked.contains(sent.sequence) {
                continue;
            }
            debug!("Packet {} presumed lost", sent.sequence);
            report.lost.push(sent.sequence);
            requeue(sent, outgoing);
        }
    }
}

/// Moves the reliable items of a lost packet into the outgoing packet.
fn requeue<F: FieldId>(lost: SentPacket<F>, outgoing: &mut UpdatePacket<F>) {
    let mut reliable = lost.reliable;

    for (field, item) in reliable.items().clone() {
        if item.drop_if_newer_exists() && outgoing.contains(field) {
            debug!("Dropping stale {:?} from packet {}", field, lost.sequence);
            continue;
        }
        outgoing.insert_resend(lost.sequence, field, item);
    }

    for (origin, items) in reliable.resend_items().clone() {
        for (field, item) in items {
            if item.drop_if_newer_exists() && outgoing.contains(field) {
                continue;
            }
            outgoing.insert_resend(origin, field, item);
        }
    }

    let addon_ids: Vec<u8> = reliable.addons().keys().copied().collect();
    for addon_id in addon_ids {
        let Some(lost_block) = reliable.remove_addon(addon_id) else {
            continue;
        };
        let current = match outgoing.addon_mut(addon_id, lost_block.field_space_size()) {
            Ok(current) => current,
            Err(e) => {
                debug!("Cannot requeue addon {} items: {}", addon_id, e);
                continue;
            }
        };
        for (field_id, item) in lost_block.items() {
            let replacement = match current.get(*field_id) {
                None => Some(item.clone()),
                Some(_) if item.drop_if_newer_exists() => None,
                Some(newer) => item.merge(newer.as_ref()),
            };
            if let Some(replacement) = replacement {
                if let Err(e) = current.insert(*field_id, replacement) {
                    debug!("Cannot requeue addon {} field {}: {}", addon_id, field_id, e);
                }
            }
        }
    }
}
