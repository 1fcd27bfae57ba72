//! Durable JSON store for rooms, messages, invite links, and attachment
//! metadata, keyed by entity id. One file per concern; message files are
//! keyed by room id.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use huddle_core::room::Effect;
use huddle_core::{ChatMessage, FileAttachment, InviteLink, Room};

const ROOMS_FILE: &str = "rooms.json";
const LINKS_FILE: &str = "links.json";
const ATTACHMENTS_FILE: &str = "attachments.json";

pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub async fn open(dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub async fn load_rooms(&self) -> Vec<Room> {
        self.read_json(ROOMS_FILE).await.unwrap_or_default()
    }

    pub async fn save_rooms(&self, rooms: &[Room]) -> anyhow::Result<()> {
        self.write_json(ROOMS_FILE, &rooms).await
    }

    pub async fn save_room(&self, room: &Room) -> anyhow::Result<()> {
        let mut rooms = self.load_rooms().await;
        match rooms.iter_mut().find(|r| r.id == room.id) {
            Some(existing) => *existing = room.clone(),
            None => rooms.push(room.clone()),
        }
        self.save_rooms(&rooms).await
    }

    pub async fn delete_room(&self, room_id: Uuid) -> anyhow::Result<()> {
        let mut rooms = self.load_rooms().await;
        rooms.retain(|r| r.id != room_id);
        self.save_rooms(&rooms).await?;
        self.clear_messages(room_id).await
    }

    pub async fn load_messages(&self, room_id: Uuid) -> Vec<ChatMessage> {
        self.read_json(&messages_file(room_id)).await.unwrap_or_default()
    }

    pub async fn append_message(&self, message: &ChatMessage) -> anyhow::Result<()> {
        let name = messages_file(message.room_id);
        let mut messages = self.load_messages(message.room_id).await;
        messages.push(message.clone());
        self.write_json(&name, &messages).await
    }

    pub async fn clear_messages(&self, room_id: Uuid) -> anyhow::Result<()> {
        let path = self.dir.join(messages_file(room_id));
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Live invite links; expired ones are dropped on load.
    pub async fn load_links(&self) -> Vec<InviteLink> {
        let links: Vec<InviteLink> = self.read_json(LINKS_FILE).await.unwrap_or_default();
        links.into_iter().filter(|l| !l.is_expired()).collect()
    }

    pub async fn save_link(&self, link: &InviteLink) -> anyhow::Result<()> {
        let mut links = self.load_links().await;
        links.retain(|l| l.code != link.code);
        links.push(link.clone());
        self.write_json(LINKS_FILE, &links).await
    }

    pub async fn load_attachments(&self) -> Vec<FileAttachment> {
        self.read_json(ATTACHMENTS_FILE).await.unwrap_or_default()
    }

    pub async fn save_attachment(&self, attachment: &FileAttachment) -> anyhow::Result<()> {
        let mut attachments = self.load_attachments().await;
        attachments.retain(|a| a.id != attachment.id);
        attachments.push(attachment.clone());
        self.write_json(ATTACHMENTS_FILE, &attachments).await
    }

    /// Attachment by id (new URL form) or stored file name (legacy form).
    pub async fn find_attachment(&self, key: &str) -> Option<FileAttachment> {
        let attachments = self.load_attachments().await;
        if let Ok(id) = key.parse::<Uuid>() {
            return attachments.into_iter().find(|a| a.id == id);
        }
        attachments.into_iter().find(|a| a.file_name == key)
    }

    /// Run one persistence effect produced by the chat core. Delivery
    /// effects were already consumed by the registry and are ignored here.
    pub async fn apply(&self, effect: Effect) -> anyhow::Result<()> {
        match effect {
            Effect::PersistRoom(room) => self.save_room(&room).await,
            Effect::PersistMessage(message) => self.append_message(&message).await,
            Effect::DeleteRoom(room_id) => self.delete_room(room_id).await,
            Effect::ClearHistory(room_id) => self.clear_messages(room_id).await,
            Effect::PersistLink(link) => self.save_link(&link).await,
            _ => Ok(()),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let bytes = tokio::fs::read(self.dir.join(name)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(self.dir.join(name), bytes).await?;
        Ok(())
    }
}

fn messages_file(room_id: Uuid) -> String {
    format!("messages-{room_id}.json")
}

/// Persist a batch of storage effects, logging failures. Persistence
/// problems never take a connection down.
pub async fn persist(store: &Store, effects: Vec<Effect>) {
    for effect in effects {
        if let Err(e) = store.apply(effect).await {
            warn!("persistence failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::User;

    async fn temp_store() -> (Store, PathBuf) {
        let dir = std::env::temp_dir().join(format!("huddle-store-{}", Uuid::new_v4()));
        let store = Store::open(&dir).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn rooms_round_trip_with_upsert() {
        let (store, dir) = temp_store().await;
        let mut room = Room::new("General", User::new("alice"));
        store.save_room(&room).await.unwrap();

        room.add_participant("bob");
        store.save_room(&room).await.unwrap();

        let loaded = store.load_rooms().await;
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].participants.contains("bob"));

        store.delete_room(room.id).await.unwrap();
        assert!(store.load_rooms().await.is_empty());
        tokio::fs::remove_dir_all(dir).await.unwrap();
    }

    #[tokio::test]
    async fn messages_keyed_by_room() {
        let (store, dir) = temp_store().await;
        let room_a = Uuid::new_v4();
        let room_b = Uuid::new_v4();
        store
            .append_message(&ChatMessage::new("in a", User::new("u"), room_a))
            .await
            .unwrap();
        store
            .append_message(&ChatMessage::new("in b", User::new("u"), room_b))
            .await
            .unwrap();

        assert_eq!(store.load_messages(room_a).await.len(), 1);
        assert_eq!(store.load_messages(room_b).await.len(), 1);

        store.clear_messages(room_a).await.unwrap();
        assert!(store.load_messages(room_a).await.is_empty());
        assert_eq!(store.load_messages(room_b).await.len(), 1);
        tokio::fs::remove_dir_all(dir).await.unwrap();
    }

    #[tokio::test]
    async fn expired_links_dropped_on_load() {
        let (store, dir) = temp_store().await;
        let room = Room::new("General", User::new("alice"));
        let live = InviteLink::new(&room, None);
        let expired = InviteLink::new(&room, Some(chrono::Duration::seconds(-1)));
        store.save_link(&live).await.unwrap();
        store.save_link(&expired).await.unwrap();

        let loaded = store.load_links().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].code, live.code);
        tokio::fs::remove_dir_all(dir).await.unwrap();
    }

    #[tokio::test]
    async fn attachments_found_by_id_or_stored_name() {
        let (store, dir) = temp_store().await;
        let att = FileAttachment::new("abc123.png", "photo.png", "image/png", 4, "uploads/abc123.png");
        store.save_attachment(&att).await.unwrap();

        assert!(store.find_attachment(&att.id.to_string()).await.is_some());
        assert!(store.find_attachment("abc123.png").await.is_some());
        assert!(store.find_attachment("missing.png").await.is_none());
        tokio::fs::remove_dir_all(dir).await.unwrap();
    }
}
