//! Payload items
//!
//! A payload item is one logical piece of state carried in an update packet:
//! a batch of position updates, a chat line, the current game settings. Items
//! describe their own reliability and serialize themselves through the
//! primitive codec.

use crate::codec::{PacketReader, PacketWriter};
use crate::error::CodecError;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Shared handle to a payload item.
///
/// Items are shared between an outgoing packet and the reliability history,
/// and between a decoded packet and its merged read view.
pub type ItemRef = Arc<dyn PayloadItem>;

pub trait PayloadItem: Any + Debug + Send + Sync {
    /// Whether the item must be retransmitted when its packet is lost.
    fn is_reliable(&self) -> bool;

    /// Whether a lost copy should be discarded once a newer one is queued.
    fn drop_if_newer_exists(&self) -> bool;

    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError>;

    /// Populates a freshly instantiated item from the reader.
    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<(), CodecError>;

    /// Concatenates two collections of the same kind. `None` for items
    /// that are not collections or when `other` is a different type.
    fn merge(&self, _other: &dyn PayloadItem) -> Option<ItemRef> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Borrows an item as its concrete type.
pub fn downcast<T: PayloadItem>(item: &dyn PayloadItem) -> Option<&T> {
    item.as_any().downcast_ref::<T>()
}

/// One element of an [`ItemBatch`].
pub trait BatchEntry: Clone + Debug + Send + Sync + 'static {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError>;
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError>;
}

/// Most entries a single batch can carry behind its `u16` count.
pub const MAX_BATCH_ENTRIES: usize = u16::MAX as usize;

/// A collection of same-typed entries sharing one field slot.
///
/// Reliability is fixed when the batch is created for its field; entries
/// pushed during a tick accumulate until the packet is flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemBatch<T> {
    entries: Vec<T>,
    reliable: bool,
    drop_if_newer: bool,
}

impl<T: BatchEntry> ItemBatch<T> {
    pub fn new(reliable: bool, drop_if_newer: bool) -> Self {
        Self {
            entries: Vec::new(),
            reliable,
            drop_if_newer,
        }
    }

    pub fn reliable() -> Self {
        Self::new(true, false)
    }

    pub fn unreliable() -> Self {
        Self::new(false, false)
    }

    pub fn with_entries(mut self, entries: impl IntoIterator<Item = T>) -> Self {
        self.entries.extend(entries);
        self
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: BatchEntry> PayloadItem for ItemBatch<T> {
    fn is_reliable(&self) -> bool {
        self.reliable
    }

    fn drop_if_newer_exists(&self) -> bool {
        self.drop_if_newer
    }

    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        if self.entries.len() > MAX_BATCH_ENTRIES {
            return Err(CodecError::LengthOverflow {
                what: "batch",
                length: self.entries.len(),
                max: MAX_BATCH_ENTRIES,
            });
        }
        writer.write_u16(self.entries.len() as u16);
        for entry in &self.entries {
            entry.encode(writer)?;
        }
        Ok(())
    }

    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<(), CodecError> {
        let count = reader.read_u16()?;
        let mut entries = Vec::with_capacity(usize::from(count).min(reader.remaining()));
        for _ in 0..count {
            entries.push(T::decode(reader)?);
        }
        self.entries = entries;
        Ok(())
    }

    fn merge(&self, other: &dyn PayloadItem) -> Option<ItemRef> {
        let other = downcast::<Self>(other)?;
        let mut merged = self.clone();
        merged.entries.extend(other.entries.iter().cloned());
        Some(Arc::new(merged))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
