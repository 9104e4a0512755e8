//! Per-connection update manager
//!
//! Application code mutates the current outgoing packet from any task while a
//! send-tick task flushes it and a receive task feeds incoming bytes. One lock
//! guards the current packet together with the reliability engine, and no
//! encoding, decoding or I/O happens while it is held.

use crate::addon::AddonRegistry;
use crate::config::NetConfig;
use crate::error::{ConfigError, ConnectionError, PacketError};
use crate::flags::{FieldId, FlagWidth};
use crate::packet::UpdatePacket;
use crate::reliability::ReliabilityEngine;
use log::{debug, error};
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct State<Out: FieldId> {
    current: UpdatePacket<Out>,
    engine: ReliabilityEngine<Out>,
}

/// Sends packets of field space `Out` and receives packets of `In`.
pub struct UpdateManager<Out: FieldId, In: FieldId> {
    state: Mutex<State<Out>>,
    registry: Arc<AddonRegistry>,
    ack_width: FlagWidth,
    timeout: Duration,
    _incoming: PhantomData<fn() -> In>,
}

impl<Out: FieldId, In: FieldId> UpdateManager<Out, In> {
    /// Creates the manager with an empty current packet.
    ///
    /// `registry` must hold the addons negotiated at login, since incoming
    /// addon blocks are decoded through it.
    pub fn new(config: &NetConfig, registry: Arc<AddonRegistry>) -> Result<Self, ConfigError> {
        let engine = ReliabilityEngine::new(config.reliability.clone(), Instant::now())?;
        Ok(Self {
            ack_width: engine.ack_width(),
            state: Mutex::new(State {
                current: UpdatePacket::new(),
                engine,
            }),
            registry,
            timeout: config.connection_timeout,
            _incoming: PhantomData,
        })
    }

    /// Runs `f` against the packet that goes out on the next flush.
    pub fn update<R>(&self, f: impl FnOnce(&mut UpdatePacket<Out>) -> R) -> R {
        f(&mut self.state.lock().current)
    }

    /// Swaps out the current packet, stamps and encodes it.
    ///
    /// The packet is recorded for loss detection even when it carries no
    /// data, since every packet also carries acks. The bytes may exceed one
    /// datagram; see [`PacketSlicer`](crate::slicing::PacketSlicer).
    pub fn flush(&self) -> Result<Vec<u8>, PacketError> {
        let mut packet = {
            let mut state = self.state.lock();
            let mut packet = std::mem::take(&mut state.current);
            state.engine.stamp(&mut packet);
            packet
        };

        let bytes = match packet.encode(self.ack_width) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode packet {}: {}", packet.sequence(), e);
                return Err(e);
            }
        };

        let mut guard = self.state.lock();
        let State { current, engine } = &mut *guard;
        engine.record_sent(&packet, current, Instant::now());
        Ok(bytes)
    }

    /// Decodes an incoming packet and applies its acks.
    ///
    /// Returns `None` for a duplicate. Incoming resend entries whose data was
    /// already received are removed from the returned packet.
    pub fn receive(&self, bytes: &[u8]) -> Result<Option<UpdatePacket<In>>, PacketError> {
        let mut packet = UpdatePacket::<In>::decode(bytes, self.ack_width, &self.registry)?;

        let report = {
            let mut guard = self.state.lock();
            let State { current, engine } = &mut *guard;
            engine.receive(&mut packet, current, Instant::now())
        };

        if !report.lost.is_empty() {
            debug!("Requeued reliable data of lost packets {:?}", report.lost);
        }
        if report.duplicate {
            return Ok(None);
        }
        Ok(Some(packet))
    }

    /// Fails once nothing has been received for the configured timeout.
    pub fn check_timeout(&self) -> Result<(), ConnectionError> {
        let elapsed = self.state.lock().engine.last_received().elapsed();
        if elapsed > self.timeout {
            return Err(ConnectionError::ConnectionTimedOut { elapsed });
        }
        Ok(())
    }

    /// Smoothed round trip time measured from acks.
    pub fn rtt(&self) -> Duration {
        self.state.lock().engine.rtt()
    }

    /// Sent packets not yet acked or declared lost.
    pub fn in_flight(&self) -> usize {
        self.state.lock().engine.in_flight()
    }

    pub fn registry(&self) -> &Arc<AddonRegistry> {
        &self.registry
    }
}

impl<Out: FieldId, In: FieldId> fmt::Debug for UpdateManager<Out, In> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateManager")
            .field("ack_width", &self.ack_width)
            .field("timeout", &self.timeout)
            .field("addons", &self.registry.len())
            .finish_non_exhaustive()
    }
}
