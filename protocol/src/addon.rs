//! Addon channel registry
//!
//! Third-party addons get their own byte-addressed block inside every update
//! packet. Each registered addon declares the size of its private field space
//! and a factory that instantiates the right [`PayloadItem`] for a field index.
//! The registry is filled before any connection starts and is shared read-only
//! through an `Arc` afterwards.

use crate::codec::{PacketReader, PacketWriter};
use crate::error::{AddonError, CodecError, FieldSpaceError, RegistryError};
use crate::flags::FieldSpace;
use crate::item::{ItemRef, PayloadItem};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Builds an empty item for a field index, or `None` for an index the addon
/// does not know.
pub type AddonFactory = Arc<dyn Fn(u8) -> Option<Box<dyn PayloadItem>> + Send + Sync>;

/// Registration of one addon.
#[derive(Clone)]
pub struct AddonPacketInfo {
    field_space: FieldSpace,
    factory: AddonFactory,
}

impl AddonPacketInfo {
    pub fn field_space(&self) -> FieldSpace {
        self.field_space
    }

    pub fn field_space_size(&self) -> u8 {
        self.field_space.size()
    }
}

impl fmt::Debug for AddonPacketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddonPacketInfo")
            .field("field_space_size", &self.field_space.size())
            .finish_non_exhaustive()
    }
}

/// Table of addon registrations keyed by addon id.
#[derive(Debug, Clone, Default)]
pub struct AddonRegistry {
    addons: BTreeMap<u8, AddonPacketInfo>,
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an addon.
    ///
    /// The factory is called once for every field index so a factory that
    /// cannot build one of its own fields fails here rather than while
    /// decoding. Registering an id again with the same field space size
    /// replaces the factory.
    pub fn register<F>(
        &mut self,
        addon_id: u8,
        field_space_size: u8,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(u8) -> Option<Box<dyn PayloadItem>> + Send + Sync + 'static,
    {
        if let Some(existing) = self.addons.get(&addon_id) {
            if existing.field_space_size() != field_space_size {
                return Err(RegistryError::DuplicateAddonId {
                    addon_id,
                    existing: existing.field_space_size(),
                    requested: field_space_size,
                });
            }
        }

        let field_space = FieldSpace::new(usize::from(field_space_size))?;
        for field_id in 0..field_space_size {
            if factory(field_id).is_none() {
                return Err(RegistryError::FactoryReturnedNothing { addon_id, field_id });
            }
        }

        self.addons.insert(
            addon_id,
            AddonPacketInfo {
                field_space,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn info(&self, addon_id: u8) -> Option<&AddonPacketInfo> {
        self.addons.get(&addon_id)
    }

    pub fn contains(&self, addon_id: u8) -> bool {
        self.addons.contains_key(&addon_id)
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.addons.keys().copied()
    }

    /// Instantiates the item for one addon field.
    pub fn resolve(&self, addon_id: u8, field_id: u8) -> Result<Box<dyn PayloadItem>, RegistryError> {
        let info = self
            .addons
            .get(&addon_id)
            .ok_or(RegistryError::UnknownAddonId(addon_id))?;
        resolve_with(info, addon_id, field_id)
    }

    /// An empty block for an addon, sized from its registration.
    pub fn empty_block(&self, addon_id: u8) -> Result<AddonPacketData, RegistryError> {
        let info = self
            .addons
            .get(&addon_id)
            .ok_or(RegistryError::UnknownAddonId(addon_id))?;
        Ok(AddonPacketData::with_space(info.field_space))
    }
}

fn resolve_with(
    info: &AddonPacketInfo,
    addon_id: u8,
    field_id: u8,
) -> Result<Box<dyn PayloadItem>, RegistryError> {
    if !info.field_space.contains(field_id) {
        return Err(RegistryError::FieldOutOfRange {
            addon_id,
            field_id,
            size: info.field_space.size(),
        });
    }
    (info.factory)(field_id).ok_or(RegistryError::FactoryReturnedNothing { addon_id, field_id })
}

/// The items one addon contributes to one packet.
#[derive(Debug, Clone)]
pub struct AddonPacketData {
    field_space: FieldSpace,
    items: BTreeMap<u8, ItemRef>,
}

impl AddonPacketData {
    pub fn new(field_space_size: u8) -> Result<Self, FieldSpaceError> {
        Ok(Self::with_space(FieldSpace::new(usize::from(field_space_size))?))
    }

    fn with_space(field_space: FieldSpace) -> Self {
        Self {
            field_space,
            items: BTreeMap::new(),
        }
    }

    pub fn field_space_size(&self) -> u8 {
        self.field_space.size()
    }

    /// Stores an item, returning the one it replaced.
    pub fn insert(&mut self, field_id: u8, item: ItemRef) -> Result<Option<ItemRef>, CodecError> {
        if !self.field_space.contains(field_id) {
            return Err(CodecError::FlagOutOfRange {
                index: field_id,
                size: self.field_space.size(),
            });
        }
        Ok(self.items.insert(field_id, item))
    }

    pub fn set<T: PayloadItem>(&mut self, field_id: u8, item: T) -> Result<Option<ItemRef>, CodecError> {
        self.insert(field_id, Arc::new(item))
    }

    pub fn get(&self, field_id: u8) -> Option<&ItemRef> {
        self.items.get(&field_id)
    }

    pub fn remove(&mut self, field_id: u8) -> Option<ItemRef> {
        self.items.remove(&field_id)
    }

    pub fn items(&self) -> &BTreeMap<u8, ItemRef> {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_reliable_data(&self) -> bool {
        self.items.values().any(|item| item.is_reliable())
    }

    /// Copy holding only the reliable items.
    pub fn reliable_part(&self) -> Self {
        Self {
            field_space: self.field_space,
            items: self
                .items
                .iter()
                .filter(|(_, item)| item.is_reliable())
                .map(|(field_id, item)| (*field_id, Arc::clone(item)))
                .collect(),
        }
    }

    /// Writes the self-contained sub-packet: flag header, then items in
    /// field order.
    pub fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        self.field_space
            .write_flags(writer, self.items.keys().copied())?;
        for item in self.items.values() {
            item.encode(writer)?;
        }
        Ok(())
    }

    /// Decodes one sub-packet. The block must be consumed exactly.
    pub fn decode(bytes: &[u8], addon_id: u8, info: &AddonPacketInfo) -> Result<Self, AddonError> {
        let mut reader = PacketReader::new(bytes);
        let mask = info.field_space.read_flags(&mut reader)?;

        let mut data = Self::with_space(info.field_space);
        for field_id in mask.iter() {
            let mut item = resolve_with(info, addon_id, field_id)?;
            item.decode(&mut reader)?;
            data.items.insert(field_id, Arc::from(item));
        }

        if !reader.is_exhausted() {
            return Err(AddonError::TrailingBytes(reader.remaining()));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{downcast, ItemBatch};
    use crate::items::{ChatMessage, Signal};

    fn chat_factory(field_id: u8) -> Option<Box<dyn PayloadItem>> {
        match field_id {
            0 => Some(Box::new(ItemBatch::<ChatMessage>::reliable())),
            1 => Some(Box::new(Signal)),
            _ => None,
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = AddonRegistry::new();
        registry.register(3, 2, chat_factory).unwrap();

        assert!(registry.contains(3));
        assert_eq!(registry.info(3).unwrap().field_space_size(), 2);
        assert!(registry.resolve(3, 1).unwrap().is_reliable());
        assert_eq!(
            registry.resolve(3, 2).unwrap_err(),
            RegistryError::FieldOutOfRange {
                addon_id: 3,
                field_id: 2,
                size: 2
            }
        );
        assert_eq!(
            registry.resolve(4, 0).unwrap_err(),
            RegistryError::UnknownAddonId(4)
        );
    }

    #[test]
    fn test_duplicate_id_with_other_size_fails() {
        let mut registry = AddonRegistry::new();
        registry.register(1, 2, chat_factory).unwrap();
        // Same size replaces the factory
        assert!(registry.register(1, 2, chat_factory).is_ok());
        assert_eq!(
            registry.register(1, 1, chat_factory),
            Err(RegistryError::DuplicateAddonId {
                addon_id: 1,
                existing: 2,
                requested: 1
            })
        );
    }

    #[test]
    fn test_factory_returning_nothing_fails_at_registration() {
        let mut registry = AddonRegistry::new();
        assert_eq!(
            registry.register(9, 3, chat_factory),
            Err(RegistryError::FactoryReturnedNothing {
                addon_id: 9,
                field_id: 2
            })
        );
        assert!(!registry.contains(9));
    }

    #[test]
    fn test_oversized_space_fails_at_registration() {
        let mut registry = AddonRegistry::new();
        let result = registry.register(0, 65, |_| Some(Box::new(Signal) as Box<dyn PayloadItem>));
        assert!(matches!(result, Err(RegistryError::FieldSpace(_))));
    }

    #[test]
    fn test_block_roundtrip() {
        let mut registry = AddonRegistry::new();
        registry.register(3, 2, chat_factory).unwrap();

        let mut block = registry.empty_block(3).unwrap();
        block
            .set(0, ItemBatch::reliable().with_entries([ChatMessage::new("hi")]))
            .unwrap();
        assert!(block.set(2, Signal).is_err());

        let mut writer = PacketWriter::new();
        block.encode(&mut writer).unwrap();
        let bytes = writer.into_bytes();

        let decoded = AddonPacketData::decode(&bytes, 3, registry.info(3).unwrap()).unwrap();
        let chat = downcast::<ItemBatch<ChatMessage>>(decoded.get(0).unwrap().as_ref()).unwrap();
        assert_eq!(chat.entries(), &[ChatMessage::new("hi")]);
        assert!(decoded.get(1).is_none());
    }

    #[test]
    fn test_trailing_bytes_in_block_fail() {
        let mut registry = AddonRegistry::new();
        registry.register(3, 2, chat_factory).unwrap();

        let bytes = [0b10, 0xFF];
        assert_eq!(
            AddonPacketData::decode(&bytes, 3, registry.info(3).unwrap()).unwrap_err(),
            AddonError::TrailingBytes(1)
        );
    }
}
