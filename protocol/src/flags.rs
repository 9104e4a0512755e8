//! Bit-flag field sets
//!
//! A field ID space is an ordered, zero-based set of optional slots. Before the
//! slots themselves, the encoder writes an integer with bit `i` set when slot
//! `i` carries data, using the narrowest of 8/16/32/64 bits that covers the
//! whole space. Slots are then written in index order, so sender and receiver
//! agree regardless of how the present slots were collected.

use crate::codec::{PacketReader, PacketWriter};
use crate::error::{CodecError, FieldSpaceError};
use crate::item::PayloadItem;
use std::fmt::Debug;
use std::hash::Hash;

/// Largest field space a flag header can describe.
pub const MAX_FIELD_SPACE: usize = 64;

/// Width of a flag header on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagWidth {
    /// Empty space, nothing is written
    None,
    U8,
    U16,
    U32,
    U64,
}

impl FlagWidth {
    /// Narrowest width with at least `size` bits.
    pub fn for_size(size: usize) -> Result<Self, FieldSpaceError> {
        match size {
            0 => Ok(FlagWidth::None),
            1..=8 => Ok(FlagWidth::U8),
            9..=16 => Ok(FlagWidth::U16),
            17..=32 => Ok(FlagWidth::U32),
            33..=MAX_FIELD_SPACE => Ok(FlagWidth::U64),
            _ => Err(FieldSpaceError::TooLarge {
                size,
                max: MAX_FIELD_SPACE,
            }),
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            FlagWidth::None => 0,
            FlagWidth::U8 => 1,
            FlagWidth::U16 => 2,
            FlagWidth::U32 => 4,
            FlagWidth::U64 => 8,
        }
    }

    pub const fn bits(self) -> usize {
        self.bytes() * 8
    }

    /// Writes the low bits of `mask` that fit this width.
    pub fn write(self, writer: &mut PacketWriter, mask: u64) {
        match self {
            FlagWidth::None => {}
            FlagWidth::U8 => writer.write_u8(mask as u8),
            FlagWidth::U16 => writer.write_u16(mask as u16),
            FlagWidth::U32 => writer.write_u32(mask as u32),
            FlagWidth::U64 => writer.write_u64(mask),
        }
    }

    pub fn read(self, reader: &mut PacketReader<'_>) -> Result<u64, CodecError> {
        Ok(match self {
            FlagWidth::None => 0,
            FlagWidth::U8 => u64::from(reader.read_u8()?),
            FlagWidth::U16 => u64::from(reader.read_u16()?),
            FlagWidth::U32 => u64::from(reader.read_u32()?),
            FlagWidth::U64 => reader.read_u64()?,
        })
    }
}

/// Set of present field indices decoded from a flag header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldMask(u64);

impl FieldMask {
    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, index: u8) -> bool {
        index < 64 && self.0 & (1 << index) != 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Present indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..64u8).filter(move |index| self.contains(*index))
    }
}

/// Size and flag width of one field ID space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpace {
    size: u8,
    width: FlagWidth,
}

impl FieldSpace {
    /// # Errors
    ///
    /// [`FieldSpaceError::TooLarge`] when `size` exceeds [`MAX_FIELD_SPACE`].
    pub fn new(size: usize) -> Result<Self, FieldSpaceError> {
        let width = FlagWidth::for_size(size)?;
        Ok(Self {
            size: size as u8,
            width,
        })
    }

    pub const fn size(&self) -> u8 {
        self.size
    }

    pub const fn width(&self) -> FlagWidth {
        self.width
    }

    pub const fn contains(&self, index: u8) -> bool {
        index < self.size
    }

    /// Writes the flag header for the given present indices.
    pub fn write_flags<I>(&self, writer: &mut PacketWriter, present: I) -> Result<(), CodecError>
    where
        I: IntoIterator<Item = u8>,
    {
        let mut mask = 0u64;
        for index in present {
            if !self.contains(index) {
                return Err(CodecError::FlagOutOfRange {
                    index,
                    size: self.size,
                });
            }
            mask |= 1 << index;
        }
        self.width.write(writer, mask);
        Ok(())
    }

    /// Reads a flag header, rejecting bits outside the space.
    pub fn read_flags(&self, reader: &mut PacketReader<'_>) -> Result<FieldMask, CodecError> {
        let mask = self.width.read(reader)?;
        let size = u32::from(self.size);
        if size < 64 && mask >> size != 0 {
            let index = (63 - (mask >> size).leading_zeros()) + size;
            return Err(CodecError::FlagOutOfRange {
                index: index as u8,
                size: self.size,
            });
        }
        Ok(FieldMask(mask))
    }
}

/// An ordered, finite, zero-based identifier space for core payload slots.
///
/// `ALL` lists every identifier in wire order; `index` must equal the position
/// in `ALL`, and `Ord` must agree with it so ordered maps iterate in wire order.
/// `instantiate` is the factory used when decoding a slot.
pub trait FieldId: Copy + Ord + Eq + Hash + Debug + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn index(self) -> u8;

    fn instantiate(self) -> Box<dyn PayloadItem>;

    fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Builds the space, checking size and declaration order.
    fn field_space() -> Result<FieldSpace, FieldSpaceError> {
        for (position, field) in Self::ALL.iter().enumerate() {
            if field.index() as usize != position {
                return Err(FieldSpaceError::NotContiguous {
                    position,
                    index: field.index(),
                });
            }
        }
        FieldSpace::new(Self::ALL.len())
    }
}
