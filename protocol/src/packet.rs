//! Update packets
//!
//! One [`UpdatePacket`] is built per connection per tick. On the wire it is:
//!
//! ```text
//! u16 sequence
//! u16 ack
//! ack bits            (8/16/32/64 bits, from the configured ack window)
//! core flags          (width from the core field space)
//!   core items in field order
//! u16 resend count
//!   u16 origin sequence, flags, items     (per entry)
//! u8  addon count
//!   u8 addon id, u16 block length, block  (per addon)
//! ```

use crate::addon::{AddonPacketData, AddonRegistry};
use crate::codec::{PacketReader, PacketWriter};
use crate::error::{CodecError, FieldSpaceError, PacketError};
use crate::flags::{FieldId, FieldSpace, FlagWidth};
use crate::item::{downcast, BatchEntry, ItemBatch, ItemRef, PayloadItem};
use log::warn;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Sequence and acknowledgement state stamped on every packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u16,
    /// Highest sequence received from the remote end
    pub ack: u16,
    /// Bit `i` set when `ack - i` was received
    pub ack_bits: u64,
}

impl PacketHeader {
    pub fn write(&self, writer: &mut PacketWriter, ack_width: FlagWidth) {
        writer.write_u16(self.sequence);
        writer.write_u16(self.ack);
        ack_width.write(writer, self.ack_bits);
    }

    pub fn read(reader: &mut PacketReader<'_>, ack_width: FlagWidth) -> Result<Self, CodecError> {
        Ok(Self {
            sequence: reader.read_u16()?,
            ack: reader.read_u16()?,
            ack_bits: ack_width.read(reader)?,
        })
    }
}

/// Items keyed by core field, iterated in wire order.
pub type FieldItems<F> = BTreeMap<F, ItemRef>;

#[derive(Debug, Clone)]
pub struct UpdatePacket<F: FieldId> {
    pub header: PacketHeader,
    normal: FieldItems<F>,
    resend: BTreeMap<u16, FieldItems<F>>,
    addons: BTreeMap<u8, AddonPacketData>,
}

impl<F: FieldId> Default for UpdatePacket<F> {
    fn default() -> Self {
        Self {
            header: PacketHeader::default(),
            normal: BTreeMap::new(),
            resend: BTreeMap::new(),
            addons: BTreeMap::new(),
        }
    }
}

impl<F: FieldId> UpdatePacket<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.resend.is_empty() && self.addons.is_empty()
    }

    /// Sets a field, replacing whatever it held.
    pub fn set_item<T: PayloadItem>(&mut self, field: F, item: T) -> Option<ItemRef> {
        self.normal.insert(field, Arc::new(item))
    }

    pub fn insert_item(&mut self, field: F, item: ItemRef) -> Option<ItemRef> {
        self.normal.insert(field, item)
    }

    pub fn item(&self, field: F) -> Option<&ItemRef> {
        self.normal.get(&field)
    }

    /// Borrows a field as its concrete item type.
    pub fn get<T: PayloadItem>(&self, field: F) -> Option<&T> {
        self.normal.get(&field).and_then(|item| downcast::<T>(item.as_ref()))
    }

    pub fn remove_item(&mut self, field: F) -> Option<ItemRef> {
        self.normal.remove(&field)
    }

    pub fn contains(&self, field: F) -> bool {
        self.normal.contains_key(&field)
    }

    pub fn items(&self) -> &FieldItems<F> {
        &self.normal
    }

    /// Appends to the batch held by `field`, creating it from the field's
    /// factory if needed. Returns `false` when the field is not a batch of `T`.
    pub fn push_entry<T: BatchEntry>(&mut self, field: F, entry: T) -> bool {
        let slot = match self.normal.entry(field) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let fresh = field.instantiate();
                if fresh.as_any().downcast_ref::<ItemBatch<T>>().is_none() {
                    return false;
                }
                vacant.insert(Arc::from(fresh))
            }
        };

        if let Some(batch) = Arc::get_mut(slot)
            .and_then(|item| item.as_any_mut().downcast_mut::<ItemBatch<T>>())
        {
            batch.push(entry);
            return true;
        }

        // Shared with a sent packet: copy on write
        let Some(existing) = downcast::<ItemBatch<T>>(&**slot) else {
            return false;
        };
        let mut batch = existing.clone();
        batch.push(entry);
        *slot = Arc::new(batch);
        true
    }

    pub fn resend_items(&self) -> &BTreeMap<u16, FieldItems<F>> {
        &self.resend
    }

    pub fn resend_for(&self, origin: u16) -> Option<&FieldItems<F>> {
        self.resend.get(&origin)
    }

    /// Queues a resend item under the sequence it was first sent with. A
    /// collection already queued there absorbs the item.
    pub fn insert_resend(&mut self, origin: u16, field: F, item: ItemRef) {
        let entry = self.resend.entry(origin).or_default();
        let merged = entry.get(&field).and_then(|existing| existing.merge(item.as_ref()));
        entry.insert(field, merged.unwrap_or(item));
    }

    pub fn remove_resend(&mut self, origin: u16) -> Option<FieldItems<F>> {
        self.resend.remove(&origin)
    }

    pub fn addon(&self, addon_id: u8) -> Option<&AddonPacketData> {
        self.addons.get(&addon_id)
    }

    pub fn addons(&self) -> &BTreeMap<u8, AddonPacketData> {
        &self.addons
    }

    /// Block for an addon, created with the given field space size.
    pub fn addon_mut(
        &mut self,
        addon_id: u8,
        field_space_size: u8,
    ) -> Result<&mut AddonPacketData, FieldSpaceError> {
        match self.addons.entry(addon_id) {
            Entry::Occupied(occupied) => Ok(occupied.into_mut()),
            Entry::Vacant(vacant) => Ok(vacant.insert(AddonPacketData::new(field_space_size)?)),
        }
    }

    pub fn insert_addon(&mut self, addon_id: u8, data: AddonPacketData) -> Option<AddonPacketData> {
        self.addons.insert(addon_id, data)
    }

    pub fn remove_addon(&mut self, addon_id: u8) -> Option<AddonPacketData> {
        self.addons.remove(&addon_id)
    }

    pub fn contains_reliable_data(&self) -> bool {
        self.normal.values().any(|item| item.is_reliable())
            || self.resend.values().any(|items| !items.is_empty())
            || self.addons.values().any(AddonPacketData::contains_reliable_data)
    }

    /// Removes the reliable items of the normal set and addon blocks, leaving
    /// unreliable data and the resend section.
    ///
    /// Applied to a packet that arrives after its reliable data was already
    /// delivered by a resend.
    pub fn strip_reliable(&mut self) {
        self.normal.retain(|_, item| !item.is_reliable());
        for block in self.addons.values_mut() {
            let reliable: Vec<u8> = block
                .items()
                .iter()
                .filter(|(_, item)| item.is_reliable())
                .map(|(field_id, _)| *field_id)
                .collect();
            for field_id in reliable {
                block.remove(field_id);
            }
        }
        self.addons.retain(|_, block| !block.is_empty());
    }

    /// Copy holding only what must be resent if this packet is lost.
    pub fn reliable_part(&self) -> Self {
        Self {
            header: self.header,
            normal: self
                .normal
                .iter()
                .filter(|(_, item)| item.is_reliable())
                .map(|(field, item)| (*field, Arc::clone(item)))
                .collect(),
            resend: self.resend.clone(),
            addons: self
                .addons
                .iter()
                .map(|(addon_id, data)| (*addon_id, data.reliable_part()))
                .filter(|(_, data)| !data.is_empty())
                .collect(),
        }
    }

    /// All data in this packet as one view. Normal items win; resend items
    /// only fill fields the normal set lacks, except that two collections of
    /// the same kind are concatenated.
    pub fn merged_items(&self) -> FieldItems<F> {
        let mut merged = self.normal.clone();
        for items in self.resend.values() {
            for (field, item) in items {
                match merged.entry(*field) {
                    Entry::Vacant(vacant) => {
                        vacant.insert(Arc::clone(item));
                    }
                    Entry::Occupied(mut occupied) => {
                        if let Some(combined) = occupied.get().merge(item.as_ref()) {
                            occupied.insert(combined);
                        }
                    }
                }
            }
        }
        merged
    }

    /// Serializes the packet.
    ///
    /// An addon block that fails to encode, or outgrows its `u16` length, is
    /// logged and removed from the packet so it is neither sent nor tracked
    /// for resending. Failures in core items fail the whole packet.
    pub fn encode(&mut self, ack_width: FlagWidth) -> Result<Vec<u8>, PacketError> {
        let space = F::field_space()?;
        let mut writer = PacketWriter::with_capacity(64);

        self.header.write(&mut writer, ack_width);
        write_items(&mut writer, &space, &self.normal)?;

        if self.resend.len() > u16::MAX as usize {
            return Err(CodecError::LengthOverflow {
                what: "resend entries",
                length: self.resend.len(),
                max: u16::MAX as usize,
            }
            .into());
        }
        writer.write_u16(self.resend.len() as u16);
        for (origin, items) in &self.resend {
            writer.write_u16(*origin);
            write_items(&mut writer, &space, items)?;
        }

        let mut blocks = Vec::with_capacity(self.addons.len());
        let mut failed = Vec::new();
        for (addon_id, data) in &self.addons {
            if blocks.len() == u8::MAX as usize {
                warn!("Too many addon blocks, dropping addon {}", addon_id);
                failed.push(*addon_id);
                continue;
            }
            let mut block = PacketWriter::new();
            match data.encode(&mut block) {
                Ok(()) if block.len() <= u16::MAX as usize => {
                    blocks.push((*addon_id, block.into_bytes()))
                }
                Ok(()) => {
                    warn!(
                        "Addon {} block of {} bytes is too large, dropping it",
                        addon_id,
                        block.len()
                    );
                    failed.push(*addon_id);
                }
                Err(e) => {
                    warn!("Failed to encode block of addon {}: {}", addon_id, e);
                    failed.push(*addon_id);
                }
            }
        }
        for addon_id in failed {
            self.addons.remove(&addon_id);
        }

        writer.write_u8(blocks.len() as u8);
        for (addon_id, block) in &blocks {
            writer.write_u8(*addon_id);
            writer.write_u16(block.len() as u16);
            writer.write_bytes(block);
        }

        Ok(writer.into_bytes())
    }

    /// Deserializes a packet.
    ///
    /// Core data is not length-delimited, so any failure inside it rejects
    /// the packet. An addon block that fails to decode is logged and left
    /// out; an unregistered addon id rejects the packet.
    pub fn decode(
        bytes: &[u8],
        ack_width: FlagWidth,
        registry: &AddonRegistry,
    ) -> Result<Self, PacketError> {
        let space = F::field_space()?;
        let mut reader = PacketReader::new(bytes);
        let mut packet = Self::new();

        packet.header = PacketHeader::read(&mut reader, ack_width)?;
        packet.normal = read_items(&mut reader, &space)?;

        let resend_count = reader.read_u16()?;
        for _ in 0..resend_count {
            let origin = reader.read_u16()?;
            let items = read_items(&mut reader, &space)?;
            packet.resend.insert(origin, items);
        }

        let addon_count = reader.read_u8()?;
        for _ in 0..addon_count {
            let addon_id = reader.read_u8()?;
            let length = reader.read_u16()?;
            let block = reader.take(usize::from(length))?;
            let info = registry
                .info(addon_id)
                .ok_or(PacketError::UnknownAddonId(addon_id))?;
            match AddonPacketData::decode(block, addon_id, info) {
                Ok(data) => {
                    packet.addons.insert(addon_id, data);
                }
                Err(e) => warn!("Dropping block of addon {}: {}", addon_id, e),
            }
        }

        if !reader.is_exhausted() {
            return Err(PacketError::TrailingBytes(reader.remaining()));
        }
        Ok(packet)
    }
}

fn write_items<F: FieldId>(
    writer: &mut PacketWriter,
    space: &FieldSpace,
    items: &FieldItems<F>,
) -> Result<(), CodecError> {
    space.write_flags(writer, items.keys().map(|field| field.index()))?;
    for item in items.values() {
        item.encode(writer)?;
    }
    Ok(())
}

fn read_items<F: FieldId>(
    reader: &mut PacketReader<'_>,
    space: &FieldSpace,
) -> Result<FieldItems<F>, CodecError> {
    let mask = space.read_flags(reader)?;
    let mut items = BTreeMap::new();
    for index in mask.iter() {
        let field = F::from_index(index).ok_or(CodecError::FlagOutOfRange {
            index,
            size: space.size(),
        })?;
        let mut item = field.instantiate();
        item.decode(reader)?;
        items.insert(field, Arc::from(item));
    }
    Ok(items)
}
