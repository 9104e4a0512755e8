//! Error types for the update protocol
//!
//! Errors are grouped by the layer that raises them. Decode-time errors inside
//! an addon block are converted into [`AddonError`] and logged by the packet
//! decoder; only [`PacketError`] crosses the packet-processing boundary.

use std::time::Duration;
use thiserror::Error;

/// Failures of the primitive codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Attempted to read past the end of the buffer
    #[error("truncated buffer: need {needed} bytes, {available} available")]
    TruncatedBuffer { needed: usize, available: usize },

    /// String too long for its length prefix
    #[error("string of {length} characters exceeds the maximum of {max}")]
    StringTooLong { length: usize, max: usize },

    /// String bytes are not valid UTF-8
    #[error("invalid utf-8 in string")]
    InvalidUtf8,

    /// A byte that must map onto a closed set did not
    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: u64 },

    /// A presence flag was set for an index outside the field space
    #[error("flag bit {index} is outside a field space of size {size}")]
    FlagOutOfRange { index: u8, size: u8 },

    /// A count or length does not fit in its prefix
    #[error("{what} of {length} exceeds the maximum of {max}")]
    LengthOverflow {
        what: &'static str,
        length: usize,
        max: usize,
    },
}

/// Structural problems with a field ID space.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldSpaceError {
    /// More fields than the widest flag header can describe
    #[error("field space of size {size} exceeds the maximum of {max}")]
    TooLarge { size: usize, max: usize },

    /// Declaration order and wire index disagree
    #[error("field at position {position} reports index {index}")]
    NotContiguous { position: usize, index: u8 },
}

/// Addon registration and lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("addon {addon_id} is already registered with {existing} fields, not {requested}")]
    DuplicateAddonId {
        addon_id: u8,
        existing: u8,
        requested: u8,
    },

    #[error("factory of addon {addon_id} returned nothing for field {field_id}")]
    FactoryReturnedNothing { addon_id: u8, field_id: u8 },

    #[error("addon {0} is not registered")]
    UnknownAddonId(u8),

    #[error("field {field_id} is outside the {size}-field space of addon {addon_id}")]
    FieldOutOfRange { addon_id: u8, field_id: u8, size: u8 },

    #[error(transparent)]
    FieldSpace(#[from] FieldSpaceError),
}

/// Failure of a single addon block. Never escapes packet decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddonError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0} unread bytes at the end of the addon block")]
    TrailingBytes(usize),

    #[error("addon block of {length} bytes exceeds the maximum of {max}")]
    BlockTooLarge { length: usize, max: usize },
}

/// Errors that make a whole update packet unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    FieldSpace(#[from] FieldSpaceError),

    /// The addon block length cannot be trusted without a registration
    #[error("unknown addon id {0}")]
    UnknownAddonId(u8),

    #[error("{0} unread bytes after the packet body")]
    TrailingBytes(usize),
}

/// Length-prefix framing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("frame of {size} bytes exceeds the maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("datagram ends inside a frame: {missing} bytes missing")]
    PartialFrame { missing: usize },

    #[error("unknown channel {0}")]
    UnknownChannel(u8),

    #[error("empty datagram")]
    EmptyDatagram,
}

/// Chunk transfer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("cannot transfer an empty payload")]
    EmptyPayload,

    #[error("payload of {size} bytes exceeds the chunk maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("slice {slice_id} is outside chunk {chunk_id} of {total} slices")]
    SliceOutOfRange {
        chunk_id: u8,
        slice_id: u8,
        total: u16,
    },

    #[error("chunk {chunk_id} announced {actual} slices, expected {expected}")]
    TotalMismatch {
        chunk_id: u8,
        expected: u16,
        actual: u16,
    },

    #[error("final slice length {length} exceeds the slice size {slice_size}")]
    InvalidSliceLength { length: usize, slice_size: usize },

    #[error("slice size {slice_size} plus {overhead} bytes of framing exceeds the datagram maximum {max}")]
    SliceTooLarge {
        slice_size: usize,
        overhead: usize,
        max: usize,
    },

    #[error("unknown chunk datagram tag {0}")]
    UnknownTag(u8),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors at the secure-transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("hand-off cancelled")]
    Cancelled,

    #[error("datagram of {size} bytes exceeds the maximum of {max}")]
    DatagramTooLarge { size: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Login handshake errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("message serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("handshake timed out after {0:?}")]
    TimedOut(Duration),

    #[error("login rejected: {0}")]
    Rejected(String),
}

/// Connection-level events that end a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection timed out: nothing received for {elapsed:?}")]
    ConnectionTimedOut { elapsed: Duration },

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("ack window of {0} bits is not one of 8, 16, 32 or 64")]
    UnsupportedAckWindow(u8),

    #[error("loss threshold {threshold} must be between 1 and the ack window {window}")]
    LossThreshold { threshold: u16, window: u8 },

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
