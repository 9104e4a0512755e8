//! Concrete payload items carried in the core field spaces.

use crate::codec::{PacketReader, PacketWriter, Vector2, WireValue};
use crate::error::CodecError;
use crate::flags::FieldSpace;
use crate::item::{BatchEntry, PayloadItem};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Team a player has joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Team {
    #[default]
    None = 0,
    Moss = 1,
    Hive = 2,
    Grimm = 3,
    Lifeblood = 4,
}

impl Team {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Team::None),
            1 => Some(Team::Moss),
            2 => Some(Team::Hive),
            3 => Some(Team::Grimm),
            4 => Some(Team::Lifeblood),
            _ => None,
        }
    }
}

impl WireValue for Team {
    fn write_to(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(*self as u8);
        Ok(())
    }

    fn read_from(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let raw = reader.read_u8()?;
        Team::from_u8(raw).ok_or(CodecError::InvalidValue {
            what: "team",
            value: u64::from(raw),
        })
    }
}

/// Why the server ended a client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    Shutdown = 0,
    Kicked = 1,
    Banned = 2,
    TimedOut = 3,
}

impl WireValue for DisconnectReason {
    fn write_to(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u8(*self as u8);
        Ok(())
    }

    fn read_from(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        match reader.read_u8()? {
            0 => Ok(DisconnectReason::Shutdown),
            1 => Ok(DisconnectReason::Kicked),
            2 => Ok(DisconnectReason::Banned),
            3 => Ok(DisconnectReason::TimedOut),
            other => Err(CodecError::InvalidValue {
                what: "disconnect reason",
                value: u64::from(other),
            }),
        }
    }
}

/// A player that joined the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: u16,
    pub username: String,
}

impl BatchEntry for PlayerInfo {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u16(self.id);
        writer.write_string(&self.username)
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            id: reader.read_u16()?,
            username: reader.read_string()?,
        })
    }
}

/// A player that left the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerDisconnect {
    pub id: u16,
    pub username: String,
    pub timed_out: bool,
}

impl BatchEntry for PlayerDisconnect {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u16(self.id);
        writer.write_string(&self.username)?;
        writer.write_bool(self.timed_out);
        Ok(())
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            id: reader.read_u16()?,
            username: reader.read_string()?,
            timed_out: reader.read_bool()?,
        })
    }
}

/// A player entering a scene, with enough state to spawn them.
///
/// On the server-bound channel `id` is ignored; the server fills in the
/// sender's id before relaying.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneEntry {
    pub id: u16,
    pub scene: String,
    pub position: Vector2,
    pub scale: bool,
    pub animation: u16,
    pub team: Team,
}

impl BatchEntry for SceneEntry {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u16(self.id);
        writer.write_string(&self.scene)?;
        writer.write_vector2(self.position);
        writer.write_bool(self.scale);
        writer.write_u16(self.animation);
        writer.write_value(&self.team)
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            id: reader.read_u16()?,
            scene: reader.read_string()?,
            position: reader.read_vector2()?,
            scale: reader.read_bool()?,
            animation: reader.read_u16()?,
            team: reader.read_value()?,
        })
    }
}

/// Bare player id, used for scene leaves and deaths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlayerId(pub u16);

impl BatchEntry for PlayerId {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u16(self.0);
        Ok(())
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(PlayerId(reader.read_u16()?))
    }
}

const PLAYER_POSITION: u8 = 0;
const PLAYER_SCALE: u8 = 1;
const PLAYER_ANIMATION: u8 = 2;

/// Per-tick change of a player. Only the parts that changed are sent,
/// behind a 3-field flag header of their own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerUpdate {
    pub id: u16,
    pub position: Option<Vector2>,
    pub scale: Option<bool>,
    pub animation: Option<u16>,
}

fn player_update_space() -> Result<FieldSpace, CodecError> {
    FieldSpace::new(3).map_err(|_| CodecError::InvalidValue {
        what: "player update field space",
        value: 3,
    })
}

impl BatchEntry for PlayerUpdate {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        let space = player_update_space()?;
        let present = [
            self.position.map(|_| PLAYER_POSITION),
            self.scale.map(|_| PLAYER_SCALE),
            self.animation.map(|_| PLAYER_ANIMATION),
        ];
        writer.write_u16(self.id);
        space.write_flags(writer, present.into_iter().flatten())?;
        if let Some(position) = self.position {
            writer.write_vector2(position);
        }
        if let Some(scale) = self.scale {
            writer.write_bool(scale);
        }
        if let Some(animation) = self.animation {
            writer.write_u16(animation);
        }
        Ok(())
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let space = player_update_space()?;
        let id = reader.read_u16()?;
        let mask = space.read_flags(reader)?;
        let mut update = PlayerUpdate {
            id,
            ..Default::default()
        };
        if mask.contains(PLAYER_POSITION) {
            update.position = Some(reader.read_vector2()?);
        }
        if mask.contains(PLAYER_SCALE) {
            update.scale = Some(reader.read_bool()?);
        }
        if mask.contains(PLAYER_ANIMATION) {
            update.animation = Some(reader.read_u16()?);
        }
        Ok(update)
    }
}

/// State change of a scene entity: an optional position and any number of
/// state-machine variables keyed by their index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityUpdate {
    pub entity_id: u16,
    pub position: Option<Vector2>,
    pub variables: Vec<(u8, Value)>,
}

impl BatchEntry for EntityUpdate {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        if self.variables.len() > u8::MAX as usize {
            return Err(CodecError::LengthOverflow {
                what: "entity variables",
                length: self.variables.len(),
                max: u8::MAX as usize,
            });
        }
        writer.write_u16(self.entity_id);
        match self.position {
            Some(position) => {
                writer.write_bool(true);
                writer.write_vector2(position);
            }
            None => writer.write_bool(false),
        }
        writer.write_u8(self.variables.len() as u8);
        for (index, value) in &self.variables {
            writer.write_u8(*index);
            writer.write_value(value)?;
        }
        Ok(())
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        let entity_id = reader.read_u16()?;
        let position = if reader.read_bool()? {
            Some(reader.read_vector2()?)
        } else {
            None
        };
        let count = reader.read_u8()?;
        let mut variables = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let index = reader.read_u8()?;
            variables.push((index, reader.read_value()?));
        }
        Ok(Self {
            entity_id,
            position,
            variables,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamChange {
    pub id: u16,
    pub team: Team,
}

impl BatchEntry for TeamChange {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_u16(self.id);
        writer.write_value(&self.team)
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            id: reader.read_u16()?,
            team: reader.read_value()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub message: String,
}

impl ChatMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl BatchEntry for ChatMessage {
    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_string(&self.message)
    }

    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            message: reader.read_string()?,
        })
    }
}

/// Server-wide gameplay settings. Only the latest copy matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSettings {
    pub pvp: bool,
    pub body_damage: bool,
    pub always_show_map_icons: bool,
    pub team_selection: bool,
    pub max_players: u16,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            pvp: false,
            body_damage: true,
            always_show_map_icons: false,
            team_selection: false,
            max_players: 64,
        }
    }
}

impl PayloadItem for GameSettings {
    fn is_reliable(&self) -> bool {
        true
    }

    fn drop_if_newer_exists(&self) -> bool {
        true
    }

    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_bool(self.pvp);
        writer.write_bool(self.body_damage);
        writer.write_bool(self.always_show_map_icons);
        writer.write_bool(self.team_selection);
        writer.write_u16(self.max_players);
        Ok(())
    }

    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<(), CodecError> {
        self.pvp = reader.read_bool()?;
        self.body_damage = reader.read_bool()?;
        self.always_show_map_icons = reader.read_bool()?;
        self.team_selection = reader.read_bool()?;
        self.max_players = reader.read_u16()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Tells a client the server is ending its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerClientDisconnect {
    pub reason: DisconnectReason,
}

impl Default for ServerClientDisconnect {
    fn default() -> Self {
        Self {
            reason: DisconnectReason::Shutdown,
        }
    }
}

impl PayloadItem for ServerClientDisconnect {
    fn is_reliable(&self) -> bool {
        true
    }

    fn drop_if_newer_exists(&self) -> bool {
        false
    }

    fn encode(&self, writer: &mut PacketWriter) -> Result<(), CodecError> {
        writer.write_value(&self.reason)
    }

    fn decode(&mut self, reader: &mut PacketReader<'_>) -> Result<(), CodecError> {
        self.reason = reader.read_value()?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Reliable marker with no body; its presence is the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signal;

impl PayloadItem for Signal {
    fn is_reliable(&self) -> bool {
        true
    }

    fn drop_if_newer_exists(&self) -> bool {
        false
    }

    fn encode(&self, _writer: &mut PacketWriter) -> Result<(), CodecError> {
        Ok(())
    }

    fn decode(&mut self, _reader: &mut PacketReader<'_>) -> Result<(), CodecError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
