//! Game-state relay between clients
//!
//! The server keeps no simulation of its own. Everything a client reports is
//! recorded on its roster entry and forwarded to the clients that need it,
//! by queueing items on their update managers. The next send tick of each
//! recipient carries them out.

use crate::client_manager::ClientManager;
use log::{debug, warn};
use protocol::item::{downcast, BatchEntry};
use protocol::items::{
    ChatMessage, EntityUpdate, GameSettings, PlayerDisconnect, PlayerId, PlayerInfo,
    PlayerUpdate, SceneEntry, TeamChange,
};
use protocol::packet::FieldItems;
use protocol::{ClientBoundField, ItemBatch, ServerBoundField, UpdatePacket};

/// Longest chat line relayed, in characters.
pub const MAX_CHAT_LENGTH: usize = 256;

/// Applies one packet received from `client_id`. Returns `true` when the
/// client asked to disconnect.
///
/// Scene changes are applied before pose updates so that a client switching
/// scenes within one tick is announced in the right place. Resent scene
/// changes are replayed in the order they were first sent, so a stale enter
/// never undoes a newer leave.
pub fn apply_packet(
    clients: &mut ClientManager,
    client_id: u16,
    packet: &UpdatePacket<ServerBoundField>,
    settings: &GameSettings,
) -> bool {
    if clients.get(client_id).is_none() {
        return false;
    }
    let items = packet.merged_items();

    for change in scene_changes(packet) {
        match change {
            SceneChange::Leave => leave_scene(clients, client_id),
            SceneChange::Enter(entry) => enter_scene(clients, client_id, entry),
        }
    }
    for update in batch_entries::<PlayerUpdate>(&items, ServerBoundField::PlayerUpdate) {
        relay_player_update(clients, client_id, update);
    }
    for update in batch_entries::<EntityUpdate>(&items, ServerBoundField::EntityUpdate) {
        relay_entity_update(clients, client_id, update);
    }
    if items.contains_key(&ServerBoundField::PlayerDeath) {
        relay_death(clients, client_id);
    }
    // Only the latest team choice counts
    if let Some(change) = batch_entries::<TeamChange>(&items, ServerBoundField::PlayerTeamUpdate).last() {
        change_team(clients, client_id, change, settings);
    }
    for chat in batch_entries::<ChatMessage>(&items, ServerBoundField::ChatMessage) {
        relay_chat(clients, client_id, &chat.message);
    }
    for (addon_id, block) in packet.addons() {
        debug!(
            "Client {} sent {} items for addon {}",
            client_id,
            block.len(),
            addon_id
        );
    }

    items.contains_key(&ServerBoundField::PlayerDisconnect)
}

enum SceneChange<'a> {
    Leave,
    Enter(&'a SceneEntry),
}

/// Scene changes of a packet, oldest first. Within one section a leave comes
/// before an enter.
fn scene_changes(packet: &UpdatePacket<ServerBoundField>) -> Vec<SceneChange<'_>> {
    let current = packet.sequence();
    let mut sections: Vec<(u16, &FieldItems<ServerBoundField>)> = packet
        .resend_items()
        .iter()
        .map(|(origin, items)| (*origin, items))
        .collect();
    sections.push((current, packet.items()));
    // Distance behind the current sequence, wrap-aware
    sections.sort_by_key(|(origin, _)| origin.wrapping_sub(current) as i16);

    let mut changes = Vec::new();
    for (_, items) in sections {
        if items.contains_key(&ServerBoundField::PlayerLeaveScene) {
            changes.push(SceneChange::Leave);
        }
        changes.extend(
            batch_entries::<SceneEntry>(items, ServerBoundField::PlayerEnterScene)
                .iter()
                .map(SceneChange::Enter),
        );
    }
    changes
}

fn batch_entries<T: BatchEntry>(
    items: &FieldItems<ServerBoundField>,
    field: ServerBoundField,
) -> &[T] {
    items
        .get(&field)
        .and_then(|item| downcast::<ItemBatch<T>>(item.as_ref()))
        .map(|batch| batch.entries())
        .unwrap_or(&[])
}

/// Takes a player out of its scene and tells the others still there.
///
/// Does nothing for a player that is in no scene.
pub fn leave_scene(clients: &mut ClientManager, client_id: u16) {
    let Some(scene) = clients.get_mut(client_id).and_then(|client| client.scene.take()) else {
        return;
    };
    debug!("Player {} left scene {}", client_id, scene);
    for other in clients.others_in_scene(client_id, &scene) {
        other
            .updates
            .update(|packet| packet.push_entry(ClientBoundField::PlayerLeaveScene, PlayerId(client_id)));
    }
}

/// Moves a player into a scene and introduces it to everyone already there,
/// and them to it.
pub fn enter_scene(clients: &mut ClientManager, client_id: u16, entry: &SceneEntry) {
    let previous = clients.get(client_id).and_then(|client| client.scene.clone());
    if previous.is_some() {
        leave_scene(clients, client_id);
    }

    let announced = match clients.get_mut(client_id) {
        Some(client) => {
            client.scene = Some(entry.scene.clone());
            client.position = entry.position;
            client.scale = entry.scale;
            client.animation = entry.animation;
            client.scene_entry()
        }
        None => None,
    };
    let Some(announced) = announced else {
        return;
    };
    debug!("Player {} entered scene {}", client_id, announced.scene);

    let mut present = Vec::new();
    for other in clients.others_in_scene(client_id, &entry.scene) {
        other
            .updates
            .update(|packet| packet.push_entry(ClientBoundField::PlayerEnterScene, announced.clone()));
        present.extend(other.scene_entry());
    }

    if let Some(client) = clients.get(client_id) {
        client.updates.update(|packet| {
            for entry in present {
                packet.push_entry(ClientBoundField::PlayerEnterScene, entry);
            }
        });
    }
}

/// Records the player's pose and forwards it to its scene.
pub fn relay_player_update(clients: &mut ClientManager, client_id: u16, update: &PlayerUpdate) {
    let scene = match clients.get_mut(client_id) {
        Some(client) => {
            if let Some(position) = update.position {
                client.position = position;
            }
            if let Some(scale) = update.scale {
                client.scale = scale;
            }
            if let Some(animation) = update.animation {
                client.animation = animation;
            }
            client.scene.clone()
        }
        None => None,
    };
    let Some(scene) = scene else {
        return;
    };

    let relayed = PlayerUpdate {
        id: client_id,
        ..update.clone()
    };
    for other in clients.others_in_scene(client_id, &scene) {
        other
            .updates
            .update(|packet| packet.push_entry(ClientBoundField::PlayerUpdate, relayed.clone()));
    }
}

/// Forwards an entity update to the other players in the sender's scene.
///
/// Entities belong to scenes, so an update from a player outside every
/// scene goes nowhere.
pub fn relay_entity_update(clients: &mut ClientManager, client_id: u16, update: &EntityUpdate) {
    let Some(scene) = clients.get(client_id).and_then(|client| client.scene.clone()) else {
        return;
    };
    for other in clients.others_in_scene(client_id, &scene) {
        other
            .updates
            .update(|packet| packet.push_entry(ClientBoundField::EntityUpdate, update.clone()));
    }
}

/// Tells the sender's scene that its player died.
pub fn relay_death(clients: &mut ClientManager, client_id: u16) {
    let Some(scene) = clients.get(client_id).and_then(|client| client.scene.clone()) else {
        return;
    };
    for other in clients.others_in_scene(client_id, &scene) {
        other
            .updates
            .update(|packet| packet.push_entry(ClientBoundField::PlayerDeath, PlayerId(client_id)));
    }
}

/// Records a team choice and announces it to every other client.
///
/// Ignored with a warning while the game settings disable team selection.
pub fn change_team(
    clients: &mut ClientManager,
    client_id: u16,
    change: &TeamChange,
    settings: &GameSettings,
) {
    if !settings.team_selection {
        warn!("Player {} changed team while team selection is off", client_id);
        return;
    }
    let Some(client) = clients.get_mut(client_id) else {
        return;
    };
    client.team = change.team;

    let announced = TeamChange {
        id: client_id,
        team: change.team,
    };
    for other in clients.others(client_id) {
        other
            .updates
            .update(|packet| packet.push_entry(ClientBoundField::PlayerTeamUpdate, announced));
    }
}

/// Sends a chat line to every client, the sender included.
pub fn relay_chat(clients: &mut ClientManager, client_id: u16, message: &str) {
    let Some(sender) = clients.get(client_id) else {
        return;
    };
    let message: String = message.trim().chars().take(MAX_CHAT_LENGTH).collect();
    if message.is_empty() {
        return;
    }
    let line = ChatMessage::new(format!("{}: {}", sender.username, message));

    for client in clients.others(client_id).chain(clients.get(client_id)) {
        client
            .updates
            .update(|packet| packet.push_entry(ClientBoundField::ChatMessage, line.clone()));
    }
}

/// Tells every client that a new player joined.
pub fn announce_connect(clients: &ClientManager, player: &PlayerInfo) {
    for other in clients.others(player.id) {
        other
            .updates
            .update(|packet| packet.push_entry(ClientBoundField::PlayerConnect, player.clone()));
    }
}

/// Tells the remaining clients that a player left, and its scene that the
/// player is gone from it.
pub fn announce_departure(
    clients: &ClientManager,
    client_id: u16,
    username: &str,
    scene: Option<&str>,
    timed_out: bool,
) {
    let departure = PlayerDisconnect {
        id: client_id,
        username: username.to_string(),
        timed_out,
    };
    for other in clients.others(client_id) {
        let left_scene = scene.is_some_and(|scene| other.in_scene(scene));
        other.updates.update(|packet| {
            if left_scene {
                packet.push_entry(ClientBoundField::PlayerLeaveScene, PlayerId(client_id));
            }
            packet.push_entry(ClientBoundField::PlayerDisconnect, departure.clone());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use crate::client_manager::ClientUpdates;
    use protocol::items::{Signal, Team};
    use protocol::{AddonRegistry, NetConfig, Vector2};
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn add(manager: &mut ClientManager, port: u16, name: &str) -> u16 {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let updates = ClientUpdates::new(&NetConfig::default(), Arc::new(AddonRegistry::new())).unwrap();
        manager
            .add_client(addr, name.to_string(), Arc::new(updates))
            .unwrap()
    }

    fn queued<T: BatchEntry>(manager: &ClientManager, client_id: u16, field: ClientBoundField) -> Vec<T> {
        manager.get(client_id).unwrap().updates.update(|packet| {
            packet
                .get::<ItemBatch<T>>(field)
                .map(|batch| batch.entries().to_vec())
                .unwrap_or_default()
        })
    }

    fn entry(scene: &str) -> SceneEntry {
        SceneEntry {
            id: 0,
            scene: scene.to_string(),
            position: Vector2::new(1.0, 2.0),
            scale: false,
            animation: 3,
            team: Team::None,
        }
    }

    fn packet_with<T: BatchEntry>(field: ServerBoundField, entries: Vec<T>) -> UpdatePacket<ServerBoundField> {
        let mut packet = UpdatePacket::new();
        for entry in entries {
            assert!(packet.push_entry(field, entry));
        }
        packet
    }

    #[test]
    fn test_scene_entry_introduces_both_sides() {
        let mut clients = ClientManager::new(4);
        let a = add(&mut clients, 9001, "a");
        let b = add(&mut clients, 9002, "b");
        let c = add(&mut clients, 9003, "c");

        enter_scene(&mut clients, a, &entry("Town"));
        enter_scene(&mut clients, c, &entry("Crossroads"));
        enter_scene(&mut clients, b, &entry("Town"));

        let seen_by_a: Vec<u16> = queued::<SceneEntry>(&clients, a, ClientBoundField::PlayerEnterScene)
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(seen_by_a, vec![b]);

        let seen_by_b: Vec<u16> = queued::<SceneEntry>(&clients, b, ClientBoundField::PlayerEnterScene)
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(seen_by_b, vec![a]);

        assert!(queued::<SceneEntry>(&clients, c, ClientBoundField::PlayerEnterScene).is_empty());
    }

    #[test]
    fn test_player_update_reaches_scene_only() {
        let mut clients = ClientManager::new(4);
        let a = add(&mut clients, 9001, "a");
        let b = add(&mut clients, 9002, "b");
        let c = add(&mut clients, 9003, "c");
        enter_scene(&mut clients, a, &entry("Town"));
        enter_scene(&mut clients, b, &entry("Town"));
        enter_scene(&mut clients, c, &entry("Crossroads"));

        let update = PlayerUpdate {
            id: 999,
            position: Some(Vector2::new(5.0, 6.0)),
            ..Default::default()
        };
        relay_player_update(&mut clients, a, &update);

        let relayed = queued::<PlayerUpdate>(&clients, b, ClientBoundField::PlayerUpdate);
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].id, a);
        assert!(queued::<PlayerUpdate>(&clients, c, ClientBoundField::PlayerUpdate).is_empty());
        let stored = clients.get(a).unwrap().position;
        assert_approx_eq!(stored.x, 5.0);
        assert_approx_eq!(stored.y, 6.0);
    }

    #[test]
    fn test_apply_packet_leave_then_enter() {
        let mut clients = ClientManager::new(4);
        let a = add(&mut clients, 9001, "a");
        let b = add(&mut clients, 9002, "b");
        enter_scene(&mut clients, a, &entry("Town"));
        enter_scene(&mut clients, b, &entry("Town"));

        let mut packet = packet_with(ServerBoundField::PlayerEnterScene, vec![entry("Crossroads")]);
        packet.set_item(ServerBoundField::PlayerLeaveScene, Signal);
        let disconnect = apply_packet(&mut clients, a, &packet, &GameSettings::default());

        assert!(!disconnect);
        assert!(clients.get(a).unwrap().in_scene("Crossroads"));
        let left = queued::<PlayerId>(&clients, b, ClientBoundField::PlayerLeaveScene);
        assert_eq!(left, vec![PlayerId(a)]);
    }

    fn resent_enter(packet: &mut UpdatePacket<ServerBoundField>, origin: u16, scene: &str) {
        let batch = ItemBatch::reliable().with_entries([entry(scene)]);
        packet.insert_resend(origin, ServerBoundField::PlayerEnterScene, Arc::new(batch));
    }

    #[test]
    fn test_resent_enter_does_not_undo_newer_leave() {
        let mut clients = ClientManager::new(4);
        let a = add(&mut clients, 9001, "a");

        // Enter first sent in 10 and lost, leave sent normally in 12
        let mut packet = UpdatePacket::new();
        packet.header.sequence = 12;
        packet.set_item(ServerBoundField::PlayerLeaveScene, Signal);
        resent_enter(&mut packet, 10, "Town");
        apply_packet(&mut clients, a, &packet, &GameSettings::default());

        assert_eq!(clients.get(a).unwrap().scene, None);
    }

    #[test]
    fn test_resent_changes_replay_in_send_order_across_wrap() {
        let mut clients = ClientManager::new(4);
        let a = add(&mut clients, 9001, "a");

        let mut packet = UpdatePacket::new();
        packet.header.sequence = 2;
        resent_enter(&mut packet, 65534, "Crossroads");
        resent_enter(&mut packet, 0, "Town");
        packet.insert_resend(1, ServerBoundField::PlayerLeaveScene, Arc::new(Signal));
        apply_packet(&mut clients, a, &packet, &GameSettings::default());

        assert_eq!(clients.get(a).unwrap().scene, None);
    }

    #[test]
    fn test_team_change_requires_team_selection() {
        let mut clients = ClientManager::new(4);
        let a = add(&mut clients, 9001, "a");
        let b = add(&mut clients, 9002, "b");
        let change = TeamChange {
            id: a,
            team: Team::Grimm,
        };

        change_team(&mut clients, a, &change, &GameSettings::default());
        assert_eq!(clients.get(a).unwrap().team, Team::None);

        let settings = GameSettings {
            team_selection: true,
            ..Default::default()
        };
        change_team(&mut clients, a, &change, &settings);
        assert_eq!(clients.get(a).unwrap().team, Team::Grimm);
        assert_eq!(
            queued::<TeamChange>(&clients, b, ClientBoundField::PlayerTeamUpdate),
            vec![change]
        );
    }

    #[test]
    fn test_chat_goes_to_everyone_with_name() {
        let mut clients = ClientManager::new(4);
        let a = add(&mut clients, 9001, "Hornet");
        let b = add(&mut clients, 9002, "Quirrel");

        let packet = packet_with(ServerBoundField::ChatMessage, vec![ChatMessage::new("  hello ")]);
        apply_packet(&mut clients, a, &packet, &GameSettings::default());

        for id in [a, b] {
            let lines = queued::<ChatMessage>(&clients, id, ClientBoundField::ChatMessage);
            assert_eq!(lines, vec![ChatMessage::new("Hornet: hello")]);
        }

        relay_chat(&mut clients, a, "   ");
        assert_eq!(queued::<ChatMessage>(&clients, b, ClientBoundField::ChatMessage).len(), 1);
    }

    #[test]
    fn test_disconnect_request_and_departure() {
        let mut clients = ClientManager::new(4);
        let a = add(&mut clients, 9001, "a");
        let b = add(&mut clients, 9002, "b");
        enter_scene(&mut clients, a, &entry("Town"));
        enter_scene(&mut clients, b, &entry("Town"));

        let mut packet = UpdatePacket::new();
        packet.set_item(ServerBoundField::PlayerDisconnect, Signal);
        assert!(apply_packet(&mut clients, a, &packet, &GameSettings::default()));

        let client = clients.remove_client(a).unwrap();
        announce_departure(&clients, a, &client.username, client.scene.as_deref(), false);

        let gone = queued::<PlayerDisconnect>(&clients, b, ClientBoundField::PlayerDisconnect);
        assert_eq!(gone.len(), 1);
        assert!(!gone[0].timed_out);
        assert_eq!(
            queued::<PlayerId>(&clients, b, ClientBoundField::PlayerLeaveScene),
            vec![PlayerId(a)]
        );
    }

    #[test]
    fn test_connect_announced_to_others() {
        let mut clients = ClientManager::new(4);
        let a = add(&mut clients, 9001, "a");
        let b = add(&mut clients, 9002, "b");
        announce_connect(&clients, &clients.get(b).unwrap().info());

        let joined = queued::<PlayerInfo>(&clients, a, ClientBoundField::PlayerConnect);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].username, "b");
        assert!(queued::<PlayerInfo>(&clients, b, ClientBoundField::PlayerConnect).is_empty());
    }
}
