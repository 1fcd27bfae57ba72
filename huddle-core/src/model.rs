//! Chat data model: users, rooms, messages, attachments, invite links.
//! Room membership is tracked by username so a user can reconnect without
//! losing room state.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Emoji assigned to users who never picked one.
pub const DEFAULT_EMOJI: &str = "\u{1F464}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub joined_at: DateTime<Utc>,
    pub emoji: String,
}

impl User {
    pub fn new(username: &str) -> Self {
        Self::with_emoji(username, DEFAULT_EMOJI)
    }

    pub fn with_emoji(username: &str, emoji: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            joined_at: Utc::now(),
            emoji: emoji.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub created_by: User,
    /// Usernames of current participants.
    pub participants: HashSet<String>,
}

impl Room {
    pub fn new(name: &str, created_by: User) -> Self {
        let mut participants = HashSet::new();
        participants.insert(created_by.username.clone());
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
            created_by,
            participants,
        }
    }

    pub fn add_participant(&mut self, username: &str) {
        self.participants.insert(username.to_string());
    }

    pub fn remove_participant(&mut self, username: &str) {
        self.participants.remove(username);
    }
}

/// What a chat message carries. System notices (joins, leaves, room
/// creation) travel as messages too so history replays them in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    UserJoined,
    UserLeft,
    RoomCreated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub content: String,
    pub sender: User,
    pub room_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub attachment: Option<FileAttachment>,
}

impl ChatMessage {
    pub fn new(content: &str, sender: User, room_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.to_string(),
            sender,
            room_id,
            timestamp: Utc::now(),
            kind: MessageKind::Text,
            attachment: None,
        }
    }

    /// System notice (join/leave/room-created).
    pub fn notice(content: &str, sender: User, room_id: Uuid, kind: MessageKind) -> Self {
        Self {
            kind,
            ..Self::new(content, sender, room_id)
        }
    }

    /// Message carrying a file. An empty caption falls back to the original
    /// file name as content.
    pub fn with_attachment(
        attachment: FileAttachment,
        sender: User,
        room_id: Uuid,
        caption: &str,
    ) -> Self {
        let content = if caption.is_empty() {
            attachment.original_file_name.clone()
        } else {
            caption.to_string()
        };
        let kind = if attachment.is_image {
            MessageKind::Image
        } else {
            MessageKind::File
        };
        Self {
            id: Uuid::new_v4(),
            content,
            sender,
            room_id,
            timestamp: Utc::now(),
            kind,
            attachment: Some(attachment),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub id: Uuid,
    /// Stored (disk) file name.
    pub file_name: String,
    pub original_file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    /// Path relative to the upload directory root.
    pub file_path: String,
    pub uploaded_at: DateTime<Utc>,
    pub is_image: bool,
}

impl FileAttachment {
    pub fn new(
        file_name: &str,
        original_file_name: &str,
        mime_type: &str,
        file_size: u64,
        file_path: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.to_string(),
            original_file_name: original_file_name.to_string(),
            mime_type: mime_type.to_string(),
            file_size,
            file_path: file_path.to_string(),
            uploaded_at: Utc::now(),
            is_image: mime_type.starts_with("image/"),
        }
    }

    /// Public URL the web client fetches this attachment from.
    pub fn url(&self) -> String {
        format!("/files/{}/{}", self.id, self.original_file_name)
    }
}

const INVITE_CODE_LEN: usize = 8;
const INVITE_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteLink {
    pub room_id: Uuid,
    pub room_name: String,
    pub code: String,
    pub created_by: User,
    pub expires_at: Option<DateTime<Utc>>,
}

impl InviteLink {
    pub fn new(room: &Room, expires_in: Option<Duration>) -> Self {
        Self {
            room_id: room.id,
            room_name: room.name.clone(),
            code: Self::generate_code(),
            created_by: room.created_by.clone(),
            expires_at: expires_in.map(|d| Utc::now() + d),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() > at,
            None => false,
        }
    }

    fn generate_code() -> String {
        let mut rng = rand::thread_rng();
        (0..INVITE_CODE_LEN)
            .map(|_| INVITE_CODE_CHARSET[rng.gen_range(0..INVITE_CODE_CHARSET.len())] as char)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_tracks_participants() {
        let creator = User::new("creator");
        let mut room = Room::new("Test Room", creator);
        assert!(room.participants.contains("creator"));

        room.add_participant("guest");
        assert_eq!(room.participants.len(), 2);

        room.remove_participant("guest");
        assert_eq!(room.participants.len(), 1);
        assert!(room.participants.contains("creator"));
    }

    #[test]
    fn attachment_message_kind_follows_mime() {
        let image = FileAttachment::new("a.png", "photo.png", "image/png", 10, "uploads/a.png");
        assert!(image.is_image);
        let msg = ChatMessage::with_attachment(image, User::new("u"), Uuid::new_v4(), "");
        assert_eq!(msg.kind, MessageKind::Image);
        assert_eq!(msg.content, "photo.png");

        let doc = FileAttachment::new("b.pdf", "doc.pdf", "application/pdf", 10, "uploads/b.pdf");
        assert!(!doc.is_image);
        let msg = ChatMessage::with_attachment(doc, User::new("u"), Uuid::new_v4(), "see this");
        assert_eq!(msg.kind, MessageKind::File);
        assert_eq!(msg.content, "see this");
    }

    #[test]
    fn invite_codes_and_expiry() {
        let room = Room::new("Test Room", User::new("creator"));
        let link = InviteLink::new(&room, None);
        assert_eq!(link.code.len(), 8);
        assert!(!link.is_expired());

        let expired = InviteLink::new(&room, Some(Duration::seconds(-1)));
        assert!(expired.is_expired());
    }
}
