//! Tunable protocol parameters

use crate::chunk::{max_slice_size, MAX_SLICES};
use crate::error::{ChunkError, ConfigError};
use crate::flags::FlagWidth;
use crate::framing::CHANNEL_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sequence and acknowledgement tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Bits in the ack bitmap: 8, 16, 32 or 64
    pub ack_window_bits: u8,
    /// How many sequences behind the latest ack an unacknowledged packet
    /// must fall before it is declared lost
    pub loss_threshold: u16,
    /// Remembered received and acknowledged sequences for duplicate checks
    pub history_size: usize,
    /// Sent packets tracked while waiting for an ack
    pub max_in_flight: usize,
    /// Weight of a new sample in the RTT average
    pub rtt_smoothing: f64,
    pub initial_rtt: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            ack_window_bits: 32,
            loss_threshold: 10,
            history_size: 64,
            max_in_flight: 1024,
            rtt_smoothing: 0.125,
            initial_rtt: Duration::from_millis(100),
        }
    }
}

impl ReliabilityConfig {
    pub fn ack_width(&self) -> Result<FlagWidth, ConfigError> {
        match self.ack_window_bits {
            8 => Ok(FlagWidth::U8),
            16 => Ok(FlagWidth::U16),
            32 => Ok(FlagWidth::U32),
            64 => Ok(FlagWidth::U64),
            other => Err(ConfigError::UnsupportedAckWindow(other)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ack_width()?;
        if self.loss_threshold == 0 || self.loss_threshold > u16::from(self.ack_window_bits) {
            return Err(ConfigError::LossThreshold {
                threshold: self.loss_threshold,
                window: self.ack_window_bits,
            });
        }
        if self.history_size == 0 {
            return Err(ConfigError::Zero("history_size"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Zero("max_in_flight"));
        }
        if !(self.rtt_smoothing > 0.0 && self.rtt_smoothing <= 1.0) {
            return Err(ConfigError::Zero("rtt_smoothing"));
        }
        Ok(())
    }
}

/// Chunk transfer tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Largest datagram the socket carries, channel byte included
    pub max_datagram_size: usize,
    pub slice_size: usize,
    pub retransmit_interval: Duration,
    /// Give up on a transfer after this long
    pub transfer_timeout: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: 1200,
            slice_size: 1024,
            retransmit_interval: Duration::from_millis(100),
            transfer_timeout: Duration::from_secs(5),
        }
    }
}

impl ChunkConfig {
    /// Datagram size left for the secure transport after the channel byte.
    pub fn transport_datagram_size(&self) -> usize {
        self.max_datagram_size.saturating_sub(CHANNEL_HEADER_SIZE)
    }

    /// Largest payload one chunk can carry.
    pub fn max_payload_size(&self) -> usize {
        self.slice_size * MAX_SLICES
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slice_size == 0 {
            return Err(ConfigError::Zero("slice_size"));
        }
        let max = max_slice_size(self.transport_datagram_size());
        if self.slice_size > max {
            return Err(ChunkError::SliceTooLarge {
                slice_size: self.slice_size,
                overhead: self.max_datagram_size - max,
                max: self.max_datagram_size,
            }
            .into());
        }
        if self.retransmit_interval.is_zero() {
            return Err(ConfigError::Zero("retransmit_interval"));
        }
        if self.transfer_timeout.is_zero() {
            return Err(ConfigError::Zero("transfer_timeout"));
        }
        Ok(())
    }
}

/// Everything a server or client needs to run the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Interval between flushes of the outgoing update packet
    pub tick_interval: Duration,
    /// A connection with nothing received for this long is dead
    pub connection_timeout: Duration,
    pub timeout_check_interval: Duration,
    pub reliability: ReliabilityConfig,
    pub chunk: ChunkConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            connection_timeout: Duration::from_secs(5),
            timeout_check_interval: Duration::from_secs(1),
            reliability: ReliabilityConfig::default(),
            chunk: ChunkConfig::default(),
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Zero("tick_interval"));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::Zero("connection_timeout"));
        }
        if self.timeout_check_interval.is_zero() {
            return Err(ConfigError::Zero("timeout_check_interval"));
        }
        self.reliability.validate()?;
        self.chunk.validate()
    }
}
