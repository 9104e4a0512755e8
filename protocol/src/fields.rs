//! Core field ID spaces
//!
//! Declaration order is wire order. `instantiate` is the decode-side factory
//! and fixes each field's reliability policy.

use crate::flags::FieldId;
use crate::item::{ItemBatch, PayloadItem};
use crate::items::{
    ChatMessage, EntityUpdate, GameSettings, PlayerDisconnect, PlayerId, PlayerInfo, PlayerUpdate,
    SceneEntry, ServerClientDisconnect, Signal, TeamChange,
};

/// Fields the server sends to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ClientBoundField {
    PlayerConnect = 0,
    PlayerDisconnect = 1,
    PlayerEnterScene = 2,
    PlayerLeaveScene = 3,
    PlayerUpdate = 4,
    EntityUpdate = 5,
    PlayerDeath = 6,
    PlayerTeamUpdate = 7,
    GameSettings = 8,
    ChatMessage = 9,
    ServerClientDisconnect = 10,
}

impl FieldId for ClientBoundField {
    const ALL: &'static [Self] = &[
        ClientBoundField::PlayerConnect,
        ClientBoundField::PlayerDisconnect,
        ClientBoundField::PlayerEnterScene,
        ClientBoundField::PlayerLeaveScene,
        ClientBoundField::PlayerUpdate,
        ClientBoundField::EntityUpdate,
        ClientBoundField::PlayerDeath,
        ClientBoundField::PlayerTeamUpdate,
        ClientBoundField::GameSettings,
        ClientBoundField::ChatMessage,
        ClientBoundField::ServerClientDisconnect,
    ];

    fn index(self) -> u8 {
        self as u8
    }

    fn instantiate(self) -> Box<dyn PayloadItem> {
        match self {
            ClientBoundField::PlayerConnect => Box::new(ItemBatch::<PlayerInfo>::reliable()),
            ClientBoundField::PlayerDisconnect => {
                Box::new(ItemBatch::<PlayerDisconnect>::reliable())
            }
            ClientBoundField::PlayerEnterScene => Box::new(ItemBatch::<SceneEntry>::reliable()),
            ClientBoundField::PlayerLeaveScene => Box::new(ItemBatch::<PlayerId>::reliable()),
            ClientBoundField::PlayerUpdate => Box::new(ItemBatch::<PlayerUpdate>::unreliable()),
            ClientBoundField::EntityUpdate => Box::new(ItemBatch::<EntityUpdate>::unreliable()),
            ClientBoundField::PlayerDeath => Box::new(ItemBatch::<PlayerId>::reliable()),
            ClientBoundField::PlayerTeamUpdate => Box::new(ItemBatch::<TeamChange>::reliable()),
            ClientBoundField::GameSettings => Box::<GameSettings>::default(),
            ClientBoundField::ChatMessage => Box::new(ItemBatch::<ChatMessage>::reliable()),
            ClientBoundField::ServerClientDisconnect => {
                Box::<ServerClientDisconnect>::default()
            }
        }
    }
}

/// Fields a client sends to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServerBoundField {
    PlayerUpdate = 0,
    EntityUpdate = 1,
    PlayerEnterScene = 2,
    PlayerLeaveScene = 3,
    PlayerDeath = 4,
    PlayerTeamUpdate = 5,
    ChatMessage = 6,
    PlayerDisconnect = 7,
}

impl FieldId for ServerBoundField {
    const ALL: &'static [Self] = &[
        ServerBoundField::PlayerUpdate,
        ServerBoundField::EntityUpdate,
        ServerBoundField::PlayerEnterScene,
        ServerBoundField::PlayerLeaveScene,
        ServerBoundField::PlayerDeath,
        ServerBoundField::PlayerTeamUpdate,
        ServerBoundField::ChatMessage,
        ServerBoundField::PlayerDisconnect,
    ];

    fn index(self) -> u8 {
        self as u8
    }

    fn instantiate(self) -> Box<dyn PayloadItem> {
        match self {
            ServerBoundField::PlayerUpdate => Box::new(ItemBatch::<PlayerUpdate>::unreliable()),
            ServerBoundField::EntityUpdate => Box::new(ItemBatch::<EntityUpdate>::unreliable()),
            ServerBoundField::PlayerEnterScene => Box::new(ItemBatch::<SceneEntry>::reliable()),
            ServerBoundField::PlayerLeaveScene => Box::new(Signal),
            ServerBoundField::PlayerDeath => Box::new(Signal),
            ServerBoundField::PlayerTeamUpdate => {
                Box::new(ItemBatch::<TeamChange>::new(true, true))
            }
            ServerBoundField::ChatMessage => Box::new(ItemBatch::<ChatMessage>::reliable()),
            ServerBoundField::PlayerDisconnect => Box::new(Signal),
        }
    }
}
