//! Turns received update packets into client events
//!
//! Events are read through the packet's merged view, so data that arrived
//! through the resend section looks exactly like data sent on time.

use log::info;
use protocol::item::{downcast, BatchEntry};
use protocol::items::{
    ChatMessage, DisconnectReason, EntityUpdate, GameSettings, PlayerDisconnect, PlayerId,
    PlayerInfo, PlayerUpdate, SceneEntry, ServerClientDisconnect, TeamChange,
};
use protocol::packet::FieldItems;
use protocol::{ClientBoundField, ItemBatch, ItemRef, UpdatePacket};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    PlayerConnected(PlayerInfo),
    PlayerDisconnected(PlayerDisconnect),
    PlayerEnteredScene(SceneEntry),
    PlayerLeftScene(u16),
    PlayerMoved(PlayerUpdate),
    EntityUpdated(EntityUpdate),
    PlayerDied(u16),
    TeamChanged(TeamChange),
    SettingsChanged(GameSettings),
    Chat(String),
    /// The server ended the connection
    Disconnected(DisconnectReason),
    /// Items received for a network addon
    AddonData { addon_id: u8, items: usize },
}

fn entries<'a, T: BatchEntry>(
    items: &'a FieldItems<ClientBoundField>,
    field: ClientBoundField,
) -> impl Iterator<Item = &'a T> {
    items
        .get(&field)
        .and_then(|item: &ItemRef| downcast::<ItemBatch<T>>(item.as_ref()))
        .into_iter()
        .flat_map(|batch| batch.entries().iter())
}

/// Events of one packet, in field order.
pub fn collect_events(packet: &UpdatePacket<ClientBoundField>) -> Vec<ClientEvent> {
    let items = packet.merged_items();
    let mut events = Vec::new();

    events.extend(
        entries::<PlayerInfo>(&items, ClientBoundField::PlayerConnect)
            .cloned()
            .map(ClientEvent::PlayerConnected),
    );
    events.extend(
        entries::<PlayerDisconnect>(&items, ClientBoundField::PlayerDisconnect)
            .cloned()
            .map(ClientEvent::PlayerDisconnected),
    );
    events.extend(
        entries::<SceneEntry>(&items, ClientBoundField::PlayerEnterScene)
            .cloned()
            .map(ClientEvent::PlayerEnteredScene),
    );
    events.extend(
        entries::<PlayerId>(&items, ClientBoundField::PlayerLeaveScene)
            .map(|player| ClientEvent::PlayerLeftScene(player.0)),
    );
    events.extend(
        entries::<PlayerUpdate>(&items, ClientBoundField::PlayerUpdate)
            .cloned()
            .map(ClientEvent::PlayerMoved),
    );
    events.extend(
        entries::<EntityUpdate>(&items, ClientBoundField::EntityUpdate)
            .cloned()
            .map(ClientEvent::EntityUpdated),
    );
    events.extend(
        entries::<PlayerId>(&items, ClientBoundField::PlayerDeath)
            .map(|player| ClientEvent::PlayerDied(player.0)),
    );
    events.extend(
        entries::<TeamChange>(&items, ClientBoundField::PlayerTeamUpdate)
            .copied()
            .map(ClientEvent::TeamChanged),
    );
    if let Some(settings) = items
        .get(&ClientBoundField::GameSettings)
        .and_then(|item| downcast::<GameSettings>(item.as_ref()))
    {
        events.push(ClientEvent::SettingsChanged(settings.clone()));
    }
    events.extend(
        entries::<ChatMessage>(&items, ClientBoundField::ChatMessage)
            .map(|chat| ClientEvent::Chat(chat.message.clone())),
    );
    for (&addon_id, block) in packet.addons() {
        events.push(ClientEvent::AddonData {
            addon_id,
            items: block.len(),
        });
    }
    if let Some(disconnect) = items
        .get(&ClientBoundField::ServerClientDisconnect)
        .and_then(|item| downcast::<ServerClientDisconnect>(item.as_ref()))
    {
        events.push(ClientEvent::Disconnected(disconnect.reason));
    }

    events
}

/// What the client knows about the other players.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    players: BTreeMap<u16, String>,
    settings: GameSettings,
}

impl Roster {
    pub fn new(players: Vec<PlayerInfo>, settings: GameSettings) -> Self {
        Self {
            players: players
                .into_iter()
                .map(|player| (player.id, player.username))
                .collect(),
            settings,
        }
    }

    pub fn apply(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::PlayerConnected(player) => {
                self.players.insert(player.id, player.username.clone());
            }
            ClientEvent::PlayerDisconnected(player) => {
                self.players.remove(&player.id);
            }
            ClientEvent::SettingsChanged(settings) => {
                self.settings = settings.clone();
            }
            _ => {}
        }
    }

    pub fn username(&self, id: u16) -> Option<&str> {
        self.players.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn settings(&self) -> &GameSettings {
        &self.settings
    }

    /// Logs an event with player names filled in.
    pub fn log_event(&self, event: &ClientEvent) {
        let name = |id: u16| self.username(id).unwrap_or("unknown").to_string();
        match event {
            ClientEvent::PlayerConnected(player) => info!("{} joined", player.username),
            ClientEvent::PlayerDisconnected(player) if player.timed_out => {
                info!("{} timed out", player.username)
            }
            ClientEvent::PlayerDisconnected(player) => info!("{} left", player.username),
            ClientEvent::PlayerEnteredScene(entry) => {
                info!("{} entered {}", name(entry.id), entry.scene)
            }
            ClientEvent::PlayerLeftScene(id) => info!("{} left the scene", name(*id)),
            ClientEvent::PlayerDied(id) => info!("{} died", name(*id)),
            ClientEvent::TeamChanged(change) => {
                info!("{} joined team {:?}", name(change.id), change.team)
            }
            ClientEvent::SettingsChanged(settings) => info!("Settings changed: {:?}", settings),
            ClientEvent::Chat(line) => info!("[chat] {}", line),
            ClientEvent::Disconnected(reason) => info!("Server closed the connection: {:?}", reason),
            ClientEvent::PlayerMoved(_)
            | ClientEvent::EntityUpdated(_)
            | ClientEvent::AddonData { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::items::Team;
    use protocol::Vector2;

    #[test]
    fn test_collect_events_in_field_order() {
        let mut packet = UpdatePacket::new();
        packet.push_entry(ClientBoundField::ChatMessage, ChatMessage::new("Hornet: hi"));
        packet.push_entry(
            ClientBoundField::PlayerConnect,
            PlayerInfo {
                id: 2,
                username: "Hornet".to_string(),
            },
        );
        packet.push_entry(ClientBoundField::PlayerDeath, PlayerId(2));

        let events = collect_events(&packet);
        assert_eq!(
            events,
            vec![
                ClientEvent::PlayerConnected(PlayerInfo {
                    id: 2,
                    username: "Hornet".to_string()
                }),
                ClientEvent::PlayerDied(2),
                ClientEvent::Chat("Hornet: hi".to_string()),
            ]
        );
    }

    #[test]
    fn test_resent_items_become_events() {
        use std::sync::Arc;

        let mut packet = UpdatePacket::new();
        let chat: ItemRef = Arc::new(
            ItemBatch::<ChatMessage>::reliable().with_entries([ChatMessage::new("late")]),
        );
        packet.insert_resend(3, ClientBoundField::ChatMessage, chat);

        assert_eq!(
            collect_events(&packet),
            vec![ClientEvent::Chat("late".to_string())]
        );
    }

    #[test]
    fn test_server_disconnect_is_last() {
        let mut packet = UpdatePacket::new();
        packet.set_item(
            ClientBoundField::ServerClientDisconnect,
            ServerClientDisconnect {
                reason: DisconnectReason::Kicked,
            },
        );
        packet.push_entry(ClientBoundField::PlayerLeaveScene, PlayerId(4));

        let events = collect_events(&packet);
        assert_eq!(events.last(), Some(&ClientEvent::Disconnected(DisconnectReason::Kicked)));
        assert_eq!(events[0], ClientEvent::PlayerLeftScene(4));
    }

    #[test]
    fn test_roster_follows_events() {
        let mut roster = Roster::new(
            vec![PlayerInfo {
                id: 1,
                username: "Quirrel".to_string(),
            }],
            GameSettings::default(),
        );
        roster.apply(&ClientEvent::PlayerConnected(PlayerInfo {
            id: 2,
            username: "Hornet".to_string(),
        }));
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.username(2), Some("Hornet"));

        roster.apply(&ClientEvent::PlayerDisconnected(PlayerDisconnect {
            id: 1,
            username: "Quirrel".to_string(),
            timed_out: true,
        }));
        assert_eq!(roster.username(1), None);

        let settings = GameSettings {
            team_selection: true,
            ..Default::default()
        };
        roster.apply(&ClientEvent::SettingsChanged(settings.clone()));
        assert_eq!(roster.settings(), &settings);

        roster.apply(&ClientEvent::TeamChanged(TeamChange {
            id: 2,
            team: Team::Hive,
        }));
        roster.apply(&ClientEvent::PlayerEnteredScene(SceneEntry {
            id: 2,
            scene: "Town".to_string(),
            position: Vector2::default(),
            scale: false,
            animation: 0,
            team: Team::Hive,
        }));
        assert_eq!(roster.len(), 1);
    }
}
