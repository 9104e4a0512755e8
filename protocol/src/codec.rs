//! Primitive codec
//!
//! [`PacketWriter`] appends fixed-width little-endian values to a growable
//! buffer and [`PacketReader`] consumes them from a cursor. Neither knows
//! anything about packet framing.
//!
//! Strings are prefixed with a `u16` count of characters followed by their
//! UTF-8 bytes; the reader walks the UTF-8 lead bytes to find where the string
//! ends.

use crate::error::CodecError;
use serde::{Deserialize, Serialize};

/// Longest string, in characters, that fits behind the `u16` length prefix.
pub const MAX_STRING_LENGTH: usize = u16::MAX as usize;

/// Implemented by game value types that ride inside payload items.
///
/// The codec never looks inside these types; they write and read themselves
/// through the primitive operations.
pub trait WireValue: Sized {
    fn write_to(&self, writer: &mut PacketWriter) -> Result<(), CodecError>;
    fn read_from(reader: &mut PacketReader<'_>) -> Result<Self, CodecError>;
}

/// Two-component float vector, e.g. a position on a 2D map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector2 {
    pub x: f32,
    pub y: f32,
}

impl Vector2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Three-component float vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

impl WireValue for Vector2 {
    fn write_to(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_f32(self.x);
        writer.write_f32(self.y);
        Ok(())
    }

    fn read_from(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            x: reader.read_f32()?,
            y: reader.read_f32()?,
        })
    }
}

impl WireValue for Vector3 {
    fn write_to(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_f32(self.x);
        writer.write_f32(self.y);
        writer.write_f32(self.z);
        Ok(())
    }

    fn read_from(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            x: reader.read_f32()?,
            y: reader.read_f32()?,
            z: reader.read_f32()?,
        })
    }
}

/// Growable output buffer for packet bytes.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    /// Appends raw bytes without any length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Writes a character-counted, length-prefixed string.
    ///
    /// # Errors
    ///
    /// [`CodecError::StringTooLong`] if the string has more than
    /// [`MAX_STRING_LENGTH`] characters. Nothing is written in that case.
    pub fn write_string(&mut self, value: &str) -> Result<(), CodecError> {
        let length = value.chars().count();
        if length > MAX_STRING_LENGTH {
            return Err(CodecError::StringTooLong {
                length,
                max: MAX_STRING_LENGTH,
            });
        }
        self.write_u16(length as u16);
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_vector2(&mut self, value: Vector2) {
        self.write_f32(value.x);
        self.write_f32(value.y);
    }

    pub fn write_vector3(&mut self, value: Vector3) {
        self.write_f32(value.x);
        self.write_f32(value.y);
        self.write_f32(value.z);
    }

    pub fn write_value<T: WireValue>(&mut self, value: &T) -> Result<(), CodecError> {
        value.write_to(self)
    }
}

/// Cursor over a received byte buffer.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Consumes `count` bytes and returns them as a borrowed slice.
    pub fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < count {
            return Err(CodecError::TruncatedBuffer {
                needed: count,
                available: self.remaining(),
            });
        }
        let bytes = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_i8(&mut self) -> Result<i8, CodecError> {
        Ok(i8::from_le_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidValue {
                what: "bool",
                value: u64::from(other),
            }),
        }
    }

    /// Reads `count` raw bytes into an owned buffer.
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, CodecError> {
        Ok(self.take(count)?.to_vec())
    }

    /// Reads a string written by [`PacketWriter::write_string`].
    ///
    /// The cursor only moves if the whole string could be read.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let start = self.position;
        let result = self.read_string_inner();
        if result.is_err() {
            self.position = start;
        }
        result
    }

    fn read_string_inner(&mut self) -> Result<String, CodecError> {
        let characters = self.read_u16()?;
        let body_start = self.position;
        for _ in 0..characters {
            let lead = self.read_u8()?;
            let width = utf8_width(lead).ok_or(CodecError::InvalidUtf8)?;
            self.take(width - 1)?;
        }
        let body = &self.buffer[body_start..self.position];
        std::str::from_utf8(body)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_vector2(&mut self) -> Result<Vector2, CodecError> {
        Vector2::read_from(self)
    }

    pub fn read_vector3(&mut self) -> Result<Vector3, CodecError> {
        Vector3::read_from(self)
    }

    pub fn read_value<T: WireValue>(&mut self) -> Result<T, CodecError> {
        T::read_from(self)
    }
}

/// Encoded width of a UTF-8 character from its lead byte.
fn utf8_width(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF4 => Some(4),
        _ => None,
    }
}
