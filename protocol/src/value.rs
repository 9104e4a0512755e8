//! Tagged dynamic values
//!
//! Entity state machines expose variables of a handful of primitive types.
//! Instead of looking up accessors at runtime, each [`ValueTag`] maps to a
//! fixed pair of encode/decode functions in [`VALUE_CODECS`].

use crate::codec::{PacketReader, PacketWriter, Vector2, Vector3, WireValue};
use crate::error::CodecError;

/// A dynamically typed state value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int(i32),
    Float(f32),
    String(String),
    Vector2(Vector2),
    Vector3(Vector3),
}

/// Wire tag preceding every encoded [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    Bool = 0,
    Byte = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Vector2 = 5,
    Vector3 = 6,
}

pub type EncodeFn = fn(&Value, &mut PacketWriter) -> Result<(), CodecError>;
pub type DecodeFn = fn(&mut PacketReader<'_>) -> Result<Value, CodecError>;

/// Encode/decode pair for one tag.
#[derive(Clone, Copy)]
pub struct ValueCodec {
    pub tag: ValueTag,
    pub encode: EncodeFn,
    pub decode: DecodeFn,
}

/// Indexed by `ValueTag as usize`.
pub const VALUE_CODECS: [ValueCodec; 7] = [
    ValueCodec {
        tag: ValueTag::Bool,
        encode: encode_bool,
        decode: |reader| Ok(Value::Bool(reader.read_bool()?)),
    },
    ValueCodec {
        tag: ValueTag::Byte,
        encode: encode_byte,
        decode: |reader| Ok(Value::Byte(reader.read_u8()?)),
    },
    ValueCodec {
        tag: ValueTag::Int,
        encode: encode_int,
        decode: |reader| Ok(Value::Int(reader.read_i32()?)),
    },
    ValueCodec {
        tag: ValueTag::Float,
        encode: encode_float,
        decode: |reader| Ok(Value::Float(reader.read_f32()?)),
    },
    ValueCodec {
        tag: ValueTag::String,
        encode: encode_string,
        decode: |reader| Ok(Value::String(reader.read_string()?)),
    },
    ValueCodec {
        tag: ValueTag::Vector2,
        encode: encode_vector2,
        decode: |reader| Ok(Value::Vector2(reader.read_vector2()?)),
    },
    ValueCodec {
        tag: ValueTag::Vector3,
        encode: encode_vector3,
        decode: |reader| Ok(Value::Vector3(reader.read_vector3()?)),
    },
];

fn mismatch(tag: ValueTag) -> CodecError {
    CodecError::InvalidValue {
        what: "value for tag",
        value: tag as u64,
    }
}

fn encode_bool(value: &Value, writer: &mut PacketWriter) -> Result<(), CodecError> {
    let Value::Bool(v) = value else {
        return Err(mismatch(ValueTag::Bool));
    };
    writer.write_bool(*v);
    Ok(())
}

fn encode_byte(value: &Value, writer: &mut PacketWriter) -> Result<(), CodecError> {
    let Value::Byte(v) = value else {
        return Err(mismatch(ValueTag::Byte));
    };
    writer.write_u8(*v);
    Ok(())
}

fn encode_int(value: &Value, writer: &mut PacketWriter) -> Result<(), CodecError> {
    let Value::Int(v) = value else {
        return Err(mismatch(ValueTag::Int));
    };
    writer.write_i32(*v);
    Ok(())
}

fn encode_float(value: &Value, writer: &mut PacketWriter) -> Result<(), CodecError> {
    let Value::Float(v) = value else {
        return Err(mismatch(ValueTag::Float));
    };
    writer.write_f32(*v);
    Ok(())
}

fn encode_string(value: &Value, writer: &mut PacketWriter) -> Result<(), CodecError> {
    let Value::String(v) = value else {
        return Err(mismatch(ValueTag::String));
    };
    writer.write_string(v)
}

fn encode_vector2(value: &Value, writer: &mut PacketWriter) -> Result<(), CodecError> {
    let Value::Vector2(v) = value else {
        return Err(mismatch(ValueTag::Vector2));
    };
    writer.write_vector2(*v);
    Ok(())
}

fn encode_vector3(value: &Value, writer: &mut PacketWriter) -> Result<(), CodecError> {
    let Value::Vector3(v) = value else {
        return Err(mismatch(ValueTag::Vector3));
    };
    writer.write_vector3(*v);
    Ok(())
}

impl ValueTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        VALUE_CODECS.get(tag as usize).map(|codec| codec.tag)
    }

    pub fn codec(self) -> &'static ValueCodec {
        &VALUE_CODECS[self as usize]
    }
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Bool(_) => ValueTag::Bool,
            Value::Byte(_) => ValueTag::Byte,
            Value::Int(_) => ValueTag::Int,
            Value::Float(_) => ValueTag::Float,
            Value::String(_) => ValueTag::String,
            Value::Vector2(_) => ValueTag::Vector2,
            Value::Vector3(_) => ValueTag::Vector3,
        }
    }
}

impl WireValue for Value {
    fn write_to(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        let tag = self.tag();
        writer.write_u8(tag as u8);
        (tag.codec().encode)(self, writer)
    }

    fn read_from(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let raw = reader.read_u8()?;
        let tag = ValueTag::from_u8(raw).ok_or(CodecError::InvalidValue {
            what: "value tag",
            value: u64::from(raw),
        })?;
        (tag.codec().decode)(reader)
    }
}
