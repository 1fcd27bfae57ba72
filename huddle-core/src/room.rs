//! Room and membership state machine.
//!
//! Host-driven: the daemon passes decoded client commands and peer events;
//! the core mutates room/membership/history state and returns the effects
//! to execute (deliveries and persistence). One room per connection is an
//! enforced invariant: joining a room always leaves the current one first.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;
use crate::model::{
    ChatMessage, FileAttachment, InviteLink, MessageKind, Room, User, DEFAULT_EMOJI,
};
use crate::protocol::PeerMessage;

/// Reserved room, bootstrapped once and exempt from deletion.
pub const LOBBY_NAME: &str = "Lobby";

const INVITE_TTL_SECS: i64 = 3600;

/// Default cap on messages replayed to a joining connection.
pub const DEFAULT_HISTORY_REPLAY_LIMIT: usize = 500;

/// Identity of one live connection (web client or peer link).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Commands from the web client, discriminated by the JSON "type" field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientCommand {
    Join {
        username: String,
        #[serde(default)]
        emoji: Option<String>,
        #[serde(default, rename = "isReconnecting")]
        is_reconnecting: bool,
    },
    CreateRoom {
        name: String,
    },
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: Uuid,
    },
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: Uuid,
    },
    SendMessage {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        content: String,
        #[serde(default)]
        emoji: Option<String>,
    },
    SendFileMessage {
        #[serde(rename = "roomId")]
        room_id: Uuid,
        attachment: AttachmentRef,
        #[serde(default)]
        caption: Option<String>,
    },
    CreateInvite {
        #[serde(rename = "roomId")]
        room_id: Uuid,
    },
    ClearChatHistory {
        #[serde(rename = "roomId")]
        room_id: Uuid,
    },
    RemoveRoom {
        #[serde(rename = "roomId")]
        room_id: Uuid,
    },
    Ping,
    Pong,
    UpdateEmoji {
        emoji: String,
    },
}

/// Reference to a previously uploaded attachment.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentRef {
    pub id: Uuid,
}

/// Events sent to web clients, discriminated by the JSON "type" field.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    RoomList {
        rooms: Vec<RoomSummary>,
        is_admin: bool,
        user_emoji: String,
    },
    RoomCreated {
        room: RoomSummary,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room: RoomSummary,
        is_admin: bool,
    },
    #[serde(rename_all = "camelCase")]
    RoomRemoved {
        room_id: Uuid,
    },
    ChatMessage {
        message: MessagePayload,
    },
    #[serde(rename_all = "camelCase")]
    ChatHistoryCleared {
        room_id: Uuid,
    },
    InviteCreated {
        link: String,
    },
    UserCount {
        count: usize,
    },
    EmojiUpdated {
        emoji: String,
        success: bool,
    },
    Pong,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub participant_count: usize,
    pub created_by: String,
}

impl From<&Room> for RoomSummary {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            created_at: room.created_at,
            participant_count: room.participants.len(),
            created_by: room.created_by.username.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageKind,
    pub emoji: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
}

impl From<&ChatMessage> for MessagePayload {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            sender: msg.sender.username.clone(),
            content: msg.content.clone(),
            timestamp: msg.timestamp,
            message_type: msg.kind,
            emoji: msg.sender.emoji.clone(),
            attachment: msg.attachment.as_ref().map(AttachmentPayload::from),
        }
    }
}

/// Attachment fields as the web client expects them; `name` and `size`
/// duplicate the canonical fields for client compatibility.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    pub id: Uuid,
    pub file_name: String,
    pub original_file_name: String,
    pub name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub size: u64,
    pub url: String,
    pub is_image: bool,
}

impl From<&FileAttachment> for AttachmentPayload {
    fn from(att: &FileAttachment) -> Self {
        Self {
            id: att.id,
            file_name: att.file_name.clone(),
            original_file_name: att.original_file_name.clone(),
            name: att.original_file_name.clone(),
            mime_type: att.mime_type.clone(),
            file_size: att.file_size,
            size: att.file_size,
            url: att.url(),
            is_image: att.is_image,
        }
    }
}

/// What the daemon must do after the core handled an event. Deliveries are
/// fire-and-forget; persistence effects run outside the state lock.
#[derive(Debug, Clone)]
pub enum Effect {
    Unicast(ConnId, ServerEvent),
    Multicast {
        room_id: Uuid,
        event: ServerEvent,
        exclude: Option<String>,
    },
    BroadcastAll(ServerEvent),
    PeerUnicast(ConnId, PeerMessage),
    PeerBroadcast(PeerMessage),
    PersistRoom(Room),
    PersistMessage(ChatMessage),
    DeleteRoom(Uuid),
    ClearHistory(Uuid),
    PersistLink(InviteLink),
}

pub struct ChatCore {
    admin_username: String,
    public_host: String,
    history_replay_limit: usize,
    rooms: HashMap<Uuid, Room>,
    room_messages: HashMap<Uuid, Vec<ChatMessage>>,
    invite_links: HashMap<String, InviteLink>,
    attachments: HashMap<Uuid, FileAttachment>,
    user_emojis: HashMap<String, String>,
    usernames: HashMap<ConnId, String>,
    user_conns: HashMap<String, ConnId>,
    user_rooms: HashMap<String, Uuid>,
    lobby_id: Uuid,
}

impl ChatCore {
    pub fn new(admin_username: &str, public_host: &str, history_replay_limit: usize) -> Self {
        let mut core = Self {
            admin_username: admin_username.to_string(),
            public_host: public_host.to_string(),
            history_replay_limit,
            rooms: HashMap::new(),
            room_messages: HashMap::new(),
            invite_links: HashMap::new(),
            attachments: HashMap::new(),
            user_emojis: HashMap::new(),
            usernames: HashMap::new(),
            user_conns: HashMap::new(),
            user_rooms: HashMap::new(),
            lobby_id: Uuid::nil(),
        };
        core.ensure_lobby();
        core
    }

    /// Load persisted state. Participant sets are runtime state and start
    /// empty regardless of what was stored.
    pub fn restore(
        &mut self,
        rooms: Vec<Room>,
        messages: Vec<(Uuid, Vec<ChatMessage>)>,
        links: Vec<InviteLink>,
        attachments: Vec<FileAttachment>,
    ) {
        for mut room in rooms {
            room.participants.clear();
            self.rooms.insert(room.id, room);
        }
        for (room_id, msgs) in messages {
            self.room_messages.insert(room_id, msgs);
        }
        for link in links {
            if !link.is_expired() {
                self.invite_links.insert(link.code.clone(), link);
            }
        }
        for att in attachments {
            self.attachments.insert(att.id, att);
        }
        self.ensure_lobby();
    }

    fn ensure_lobby(&mut self) {
        if let Some(room) = self
            .rooms
            .values()
            .find(|r| r.name.eq_ignore_ascii_case(LOBBY_NAME))
        {
            self.lobby_id = room.id;
            return;
        }
        let lobby = Room::new(LOBBY_NAME, User::new("System"));
        self.lobby_id = lobby.id;
        self.room_messages.insert(lobby.id, Vec::new());
        self.rooms.insert(lobby.id, lobby);
    }

    pub fn lobby_id(&self) -> Uuid {
        self.lobby_id
    }

    pub fn rooms_snapshot(&self) -> Vec<Room> {
        self.rooms.values().cloned().collect()
    }

    pub fn connected_users(&self) -> usize {
        self.user_conns.len()
    }

    /// Connections that should receive a multicast to `room_id`: those whose
    /// current room matches, minus the excluded username.
    pub fn conns_in_room(&self, room_id: Uuid, exclude: Option<&str>) -> Vec<ConnId> {
        self.user_rooms
            .iter()
            .filter(|(username, room)| {
                **room == room_id && exclude != Some(username.as_str())
            })
            .filter_map(|(username, _)| self.user_conns.get(username).copied())
            .collect()
    }

    /// Register an uploaded attachment so file messages can reference it.
    pub fn register_attachment(&mut self, attachment: FileAttachment) {
        self.attachments.insert(attachment.id, attachment);
    }

    /// Room behind a live invite code. Expired codes are pruned on lookup.
    pub fn resolve_invite(&mut self, code: &str) -> Option<Uuid> {
        let link = self.invite_links.get(code)?;
        if link.is_expired() {
            self.invite_links.remove(code);
            return None;
        }
        let room_id = link.room_id;
        self.rooms.contains_key(&room_id).then_some(room_id)
    }

    pub fn handle_command(&mut self, conn: ConnId, cmd: ClientCommand) -> Vec<Effect> {
        match cmd {
            ClientCommand::Join {
                username,
                emoji,
                is_reconnecting,
            } => self.join(conn, &username, emoji.as_deref(), is_reconnecting),
            ClientCommand::CreateRoom { name } => self.create_room(conn, &name),
            ClientCommand::JoinRoom { room_id } => self.join_room(conn, room_id),
            ClientCommand::LeaveRoom { room_id } => self.leave_room(conn, room_id),
            ClientCommand::SendMessage {
                room_id,
                content,
                emoji,
            } => self.send_message(conn, room_id, &content, emoji.as_deref()),
            ClientCommand::SendFileMessage {
                room_id,
                attachment,
                caption,
            } => self.send_file_message(conn, room_id, attachment.id, caption.as_deref()),
            ClientCommand::CreateInvite { room_id } => self.create_invite(conn, room_id),
            ClientCommand::ClearChatHistory { room_id } => {
                self.clear_chat_history(conn, room_id)
            }
            ClientCommand::RemoveRoom { room_id } => self.remove_room(conn, room_id),
            ClientCommand::Ping => vec![Effect::Unicast(conn, ServerEvent::Pong)],
            ClientCommand::Pong => Vec::new(),
            ClientCommand::UpdateEmoji { emoji } => self.update_emoji(conn, &emoji),
        }
    }

    /// A connection closed or errored. Deregisters it and leaves its room,
    /// with a leave notice there. Idempotent: a second call for the same
    /// connection only refreshes the user count.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(username) = self.usernames.remove(&conn) {
            if self.user_conns.get(&username) == Some(&conn) {
                self.user_conns.remove(&username);
                if let Some(room_id) = self.user_rooms.remove(&username) {
                    effects.extend(self.leave_notice(&username, room_id));
                }
            }
        }
        effects.push(Effect::BroadcastAll(ServerEvent::UserCount {
            count: self.user_conns.len(),
        }));
        effects
    }

    /// A new peer link came up: share our room list with it.
    pub fn peer_link_established(&self, conn: ConnId) -> Vec<Effect> {
        vec![Effect::PeerUnicast(
            conn,
            PeerMessage::RoomList(self.rooms.values().cloned().collect()),
        )]
    }

    /// Apply a decoded message from a peer link.
    pub fn apply_peer(&mut self, conn: ConnId, msg: PeerMessage) -> Vec<Effect> {
        match msg {
            PeerMessage::ChatMessage(message) => {
                if !self.rooms.contains_key(&message.room_id) {
                    return Vec::new();
                }
                let room_id = message.room_id;
                let payload = MessagePayload::from(&message);
                self.append_history(room_id, message.clone());
                vec![
                    Effect::PersistMessage(message),
                    Effect::Multicast {
                        room_id,
                        event: ServerEvent::ChatMessage { message: payload },
                        exclude: None,
                    },
                ]
            }
            PeerMessage::UserJoined(user, room_id) | PeerMessage::JoinRoom(room_id, user) => {
                if let Some(room) = self.rooms.get_mut(&room_id) {
                    room.add_participant(&user.username);
                }
                Vec::new()
            }
            PeerMessage::UserLeft(user, room_id) | PeerMessage::LeaveRoom(room_id, user) => {
                if let Some(room) = self.rooms.get_mut(&room_id) {
                    room.remove_participant(&user.username);
                }
                Vec::new()
            }
            PeerMessage::RoomCreated(room) => self.merge_remote_room(room),
            PeerMessage::RoomList(rooms) => rooms
                .into_iter()
                .flat_map(|room| self.merge_remote_room(room))
                .collect(),
            PeerMessage::Ping => vec![Effect::PeerUnicast(conn, PeerMessage::Pong)],
            PeerMessage::Pong => Vec::new(),
        }
    }

    fn merge_remote_room(&mut self, room: Room) -> Vec<Effect> {
        if self.rooms.contains_key(&room.id) {
            return Vec::new();
        }
        let summary = RoomSummary::from(&room);
        self.room_messages.entry(room.id).or_default();
        self.rooms.insert(room.id, room.clone());
        vec![
            Effect::PersistRoom(room),
            Effect::BroadcastAll(ServerEvent::RoomCreated { room: summary }),
        ]
    }

    fn join(
        &mut self,
        conn: ConnId,
        username: &str,
        emoji: Option<&str>,
        is_reconnecting: bool,
    ) -> Vec<Effect> {
        self.usernames.insert(conn, username.to_string());
        self.user_conns.insert(username.to_string(), conn);

        let stored = self
            .user_emojis
            .get(username)
            .cloned()
            .or_else(|| emoji.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_EMOJI.to_string());
        self.user_emojis.insert(username.to_string(), stored.clone());
        // A freshly picked emoji overrides the stored one.
        if let Some(picked) = emoji {
            if picked != DEFAULT_EMOJI && picked != stored {
                self.user_emojis
                    .insert(username.to_string(), picked.to_string());
            }
        }

        let mut effects = vec![Effect::Unicast(
            conn,
            ServerEvent::RoomList {
                rooms: self.rooms.values().map(RoomSummary::from).collect(),
                is_admin: username == self.admin_username,
                user_emoji: self.user_emojis[username].clone(),
            },
        )];

        // Reconnecting clients rejoin their room themselves.
        if !is_reconnecting {
            effects.extend(self.join_room(conn, self.lobby_id));
        }

        effects.push(Effect::BroadcastAll(ServerEvent::UserCount {
            count: self.user_conns.len(),
        }));
        effects
    }

    fn create_room(&mut self, conn: ConnId, name: &str) -> Vec<Effect> {
        let Some(username) = self.usernames.get(&conn).cloned() else {
            return Vec::new();
        };
        let collision = self
            .rooms
            .values()
            .any(|r| r.name.eq_ignore_ascii_case(name))
            || name.eq_ignore_ascii_case(LOBBY_NAME);
        if collision {
            return vec![Effect::Unicast(
                conn,
                ServerEvent::Error {
                    message: ChatError::DuplicateRoomName.to_string(),
                },
            )];
        }

        let creator = User::with_emoji(&username, self.emoji_for(&username));
        let room = Room::new(name, creator);
        let summary = RoomSummary::from(&room);
        self.room_messages.insert(room.id, Vec::new());
        self.rooms.insert(room.id, room.clone());

        vec![
            Effect::PersistRoom(room.clone()),
            Effect::BroadcastAll(ServerEvent::RoomCreated { room: summary }),
            Effect::PeerBroadcast(PeerMessage::RoomCreated(room)),
        ]
    }

    fn join_room(&mut self, conn: ConnId, room_id: Uuid) -> Vec<Effect> {
        let Some(username) = self.usernames.get(&conn).cloned() else {
            return Vec::new();
        };
        if !self.rooms.contains_key(&room_id) {
            return Vec::new();
        }

        let mut effects = Vec::new();

        // Implicit leave first: one room per connection.
        if let Some(current) = self.user_rooms.get(&username).copied() {
            effects.extend(self.leave_notice(&username, current));
        }

        let user = User::with_emoji(&username, self.emoji_for(&username));
        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.add_participant(&username);
        }
        self.user_rooms.insert(username.clone(), room_id);

        // Replay history before the join notice lands in it.
        let history = self.room_messages.get(&room_id).cloned().unwrap_or_default();
        let start = history.len().saturating_sub(self.history_replay_limit);
        for message in &history[start..] {
            effects.push(Effect::Unicast(
                conn,
                ServerEvent::ChatMessage {
                    message: MessagePayload::from(message),
                },
            ));
        }

        let notice = ChatMessage::notice(
            &format!("{username} joined the room"),
            user.clone(),
            room_id,
            MessageKind::UserJoined,
        );
        let payload = MessagePayload::from(&notice);
        self.append_history(room_id, notice.clone());
        effects.push(Effect::PersistMessage(notice));
        effects.push(Effect::Multicast {
            room_id,
            event: ServerEvent::ChatMessage { message: payload },
            exclude: None,
        });

        if let Some(room) = self.rooms.get(&room_id) {
            effects.push(Effect::Unicast(
                conn,
                ServerEvent::RoomJoined {
                    room: RoomSummary::from(room),
                    is_admin: username == self.admin_username,
                },
            ));
        }
        effects.push(Effect::PeerBroadcast(PeerMessage::JoinRoom(room_id, user)));
        effects
    }

    fn leave_room(&mut self, conn: ConnId, room_id: Uuid) -> Vec<Effect> {
        let Some(username) = self.usernames.get(&conn).cloned() else {
            return Vec::new();
        };
        let effects = self.leave_notice(&username, room_id);
        self.user_rooms.remove(&username);
        effects
    }

    /// Remove membership and broadcast a leave notice to the room.
    fn leave_notice(&mut self, username: &str, room_id: Uuid) -> Vec<Effect> {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };
        room.remove_participant(username);

        let user = User::with_emoji(username, self.emoji_for(username));
        let notice = ChatMessage::notice(
            &format!("{username} left the room"),
            user.clone(),
            room_id,
            MessageKind::UserLeft,
        );
        let payload = MessagePayload::from(&notice);
        self.append_history(room_id, notice.clone());
        vec![
            Effect::PersistMessage(notice),
            Effect::Multicast {
                room_id,
                event: ServerEvent::ChatMessage { message: payload },
                exclude: Some(username.to_string()),
            },
            Effect::PeerBroadcast(PeerMessage::LeaveRoom(room_id, user)),
        ]
    }

    fn send_message(
        &mut self,
        conn: ConnId,
        room_id: Uuid,
        content: &str,
        emoji: Option<&str>,
    ) -> Vec<Effect> {
        let Some(username) = self.usernames.get(&conn).cloned() else {
            return Vec::new();
        };
        if !self.rooms.contains_key(&room_id) {
            return Vec::new();
        }

        // Stored emoji wins; a newly provided one replaces it for next time.
        let resolved = self
            .user_emojis
            .get(&username)
            .cloned()
            .or_else(|| emoji.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_EMOJI.to_string());
        if let Some(provided) = emoji {
            if provided != resolved {
                self.user_emojis
                    .insert(username.clone(), provided.to_string());
            }
        }

        let message = ChatMessage::new(
            content,
            User::with_emoji(&username, &resolved),
            room_id,
        );
        let payload = MessagePayload::from(&message);
        self.append_history(room_id, message.clone());
        vec![
            Effect::PersistMessage(message.clone()),
            Effect::Multicast {
                room_id,
                event: ServerEvent::ChatMessage { message: payload },
                exclude: None,
            },
            Effect::PeerBroadcast(PeerMessage::ChatMessage(message)),
        ]
    }

    fn send_file_message(
        &mut self,
        conn: ConnId,
        room_id: Uuid,
        attachment_id: Uuid,
        caption: Option<&str>,
    ) -> Vec<Effect> {
        let Some(username) = self.usernames.get(&conn).cloned() else {
            return Vec::new();
        };
        if !self.rooms.contains_key(&room_id) {
            return Vec::new();
        }
        let Some(attachment) = self.attachments.get(&attachment_id).cloned() else {
            return vec![Effect::Unicast(
                conn,
                ServerEvent::Error {
                    message: ChatError::UnknownAttachment.to_string(),
                },
            )];
        };

        let user = User::with_emoji(&username, self.emoji_for(&username));
        let message =
            ChatMessage::with_attachment(attachment, user, room_id, caption.unwrap_or(""));
        let payload = MessagePayload::from(&message);
        self.append_history(room_id, message.clone());
        vec![
            Effect::PersistMessage(message.clone()),
            Effect::Multicast {
                room_id,
                event: ServerEvent::ChatMessage { message: payload },
                exclude: None,
            },
            Effect::PeerBroadcast(PeerMessage::ChatMessage(message)),
        ]
    }

    fn create_invite(&mut self, conn: ConnId, room_id: Uuid) -> Vec<Effect> {
        let Some(room) = self.rooms.get(&room_id) else {
            return Vec::new();
        };
        let link = InviteLink::new(room, Some(Duration::seconds(INVITE_TTL_SECS)));
        let url = format!("http://{}/join/{}", self.public_host, link.code);
        self.invite_links.insert(link.code.clone(), link.clone());
        vec![
            Effect::PersistLink(link),
            Effect::Unicast(conn, ServerEvent::InviteCreated { link: url }),
        ]
    }

    fn clear_chat_history(&mut self, conn: ConnId, room_id: Uuid) -> Vec<Effect> {
        if !self.is_admin(conn) {
            return vec![Effect::Unicast(
                conn,
                ServerEvent::Error {
                    message: ChatError::ClearHistoryDenied.to_string(),
                },
            )];
        }
        self.room_messages.remove(&room_id);
        vec![
            Effect::ClearHistory(room_id),
            Effect::Multicast {
                room_id,
                event: ServerEvent::ChatHistoryCleared { room_id },
                exclude: None,
            },
        ]
    }

    fn remove_room(&mut self, conn: ConnId, room_id: Uuid) -> Vec<Effect> {
        if !self.is_admin(conn) {
            return vec![Effect::Unicast(
                conn,
                ServerEvent::Error {
                    message: ChatError::RemoveRoomDenied.to_string(),
                },
            )];
        }
        let Some(room) = self.rooms.get(&room_id) else {
            return Vec::new();
        };
        if room.name.eq_ignore_ascii_case(LOBBY_NAME) {
            return vec![Effect::Unicast(
                conn,
                ServerEvent::Error {
                    message: ChatError::LobbyReserved.to_string(),
                },
            )];
        }

        self.rooms.remove(&room_id);
        self.room_messages.remove(&room_id);
        self.user_rooms.retain(|_, r| *r != room_id);
        vec![
            Effect::DeleteRoom(room_id),
            Effect::BroadcastAll(ServerEvent::RoomRemoved { room_id }),
        ]
    }

    fn update_emoji(&mut self, conn: ConnId, emoji: &str) -> Vec<Effect> {
        let Some(username) = self.usernames.get(&conn).cloned() else {
            return Vec::new();
        };
        self.user_emojis.insert(username, emoji.to_string());
        vec![Effect::Unicast(
            conn,
            ServerEvent::EmojiUpdated {
                emoji: emoji.to_string(),
                success: true,
            },
        )]
    }

    fn append_history(&mut self, room_id: Uuid, message: ChatMessage) {
        self.room_messages.entry(room_id).or_default().push(message);
    }

    fn emoji_for(&self, username: &str) -> &str {
        self.user_emojis
            .get(username)
            .map(String::as_str)
            .unwrap_or(DEFAULT_EMOJI)
    }

    fn is_admin(&self, conn: ConnId) -> bool {
        self.usernames
            .get(&conn)
            .is_some_and(|u| *u == self.admin_username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> ChatCore {
        ChatCore::new("Admin", "localhost", DEFAULT_HISTORY_REPLAY_LIMIT)
    }

    fn join(core: &mut ChatCore, conn: ConnId, username: &str) -> Vec<Effect> {
        core.handle_command(
            conn,
            ClientCommand::Join {
                username: username.to_string(),
                emoji: None,
                is_reconnecting: false,
            },
        )
    }

    fn create_room(core: &mut ChatCore, conn: ConnId, name: &str) -> Uuid {
        let effects = core.handle_command(
            conn,
            ClientCommand::CreateRoom {
                name: name.to_string(),
            },
        );
        effects
            .iter()
            .find_map(|e| match e {
                Effect::PersistRoom(room) => Some(room.id),
                _ => None,
            })
            .expect("room should be created")
    }

    fn error_messages(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Unicast(_, ServerEvent::Error { message }) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lobby_is_bootstrapped_once() {
        let core = core();
        let rooms = core.rooms_snapshot();
        assert_eq!(rooms.iter().filter(|r| r.name == LOBBY_NAME).count(), 1);
        assert_eq!(core.lobby_id(), rooms.iter().find(|r| r.name == LOBBY_NAME).unwrap().id);
    }

    #[test]
    fn join_lands_in_lobby_and_broadcasts_user_count() {
        let mut core = core();
        let effects = join(&mut core, ConnId(1), "alice");
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Unicast(ConnId(1), ServerEvent::RoomList { .. })
        )));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::BroadcastAll(ServerEvent::UserCount { count: 1 })
        )));
        let lobby = core.lobby_id();
        assert_eq!(core.conns_in_room(lobby, None), vec![ConnId(1)]);
    }

    #[test]
    fn duplicate_room_names_rejected_case_insensitively() {
        let mut core = core();
        join(&mut core, ConnId(1), "alice");
        create_room(&mut core, ConnId(1), "General");

        let dup = core.handle_command(
            ConnId(1),
            ClientCommand::CreateRoom {
                name: "general".to_string(),
            },
        );
        assert_eq!(
            error_messages(&dup),
            vec!["A room with this name already exists"]
        );

        let lobby_clash = core.handle_command(
            ConnId(1),
            ClientCommand::CreateRoom {
                name: "LOBBY".to_string(),
            },
        );
        assert_eq!(error_messages(&lobby_clash).len(), 1);
    }

    #[test]
    fn single_room_invariant_with_leave_before_join_notice() {
        let mut core = core();
        join(&mut core, ConnId(1), "alice");
        let room_a = create_room(&mut core, ConnId(1), "A");
        let room_b = create_room(&mut core, ConnId(1), "B");
        core.handle_command(ConnId(1), ClientCommand::JoinRoom { room_id: room_a });

        let effects = core.handle_command(ConnId(1), ClientCommand::JoinRoom { room_id: room_b });

        let rooms = core.rooms_snapshot();
        let a = rooms.iter().find(|r| r.id == room_a).unwrap();
        let b = rooms.iter().find(|r| r.id == room_b).unwrap();
        assert!(!a.participants.contains("alice"));
        assert!(b.participants.contains("alice"));
        assert_eq!(core.conns_in_room(room_b, None), vec![ConnId(1)]);
        assert!(core.conns_in_room(room_a, None).is_empty());

        // The leave notice in A must come before the join notice in B.
        let leave_pos = effects.iter().position(|e| {
            matches!(e, Effect::Multicast { room_id, event: ServerEvent::ChatMessage { message }, .. }
                if *room_id == room_a && message.message_type == MessageKind::UserLeft)
        });
        let join_pos = effects.iter().position(|e| {
            matches!(e, Effect::Multicast { room_id, event: ServerEvent::ChatMessage { message }, .. }
                if *room_id == room_b && message.message_type == MessageKind::UserJoined)
        });
        assert!(leave_pos.expect("leave notice") < join_pos.expect("join notice"));
    }

    #[test]
    fn multicast_targets_only_current_room() {
        let mut core = core();
        join(&mut core, ConnId(1), "alice");
        join(&mut core, ConnId(2), "bob");
        join(&mut core, ConnId(3), "carol");
        let room = create_room(&mut core, ConnId(1), "Side");
        core.handle_command(ConnId(1), ClientCommand::JoinRoom { room_id: room });
        core.handle_command(ConnId(2), ClientCommand::JoinRoom { room_id: room });

        let mut in_room = core.conns_in_room(room, None);
        in_room.sort();
        assert_eq!(in_room, vec![ConnId(1), ConnId(2)]);
        assert_eq!(core.conns_in_room(room, Some("bob")), vec![ConnId(1)]);
        assert!(!core
            .conns_in_room(core.lobby_id(), None)
            .contains(&ConnId(1)));
    }

    #[test]
    fn send_message_appends_history_and_multicasts() {
        let mut core = core();
        join(&mut core, ConnId(1), "alice");
        let lobby = core.lobby_id();
        let effects = core.handle_command(
            ConnId(1),
            ClientCommand::SendMessage {
                room_id: lobby,
                content: "hi all".to_string(),
                emoji: None,
            },
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Multicast { room_id, event: ServerEvent::ChatMessage { message }, exclude: None }
                if *room_id == lobby && message.content == "hi all"
        )));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::PeerBroadcast(PeerMessage::ChatMessage(m)) if m.content == "hi all"
        )));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::PersistMessage(_))));
    }

    #[test]
    fn history_replay_is_capped() {
        let mut core = ChatCore::new("Admin", "localhost", 5);
        join(&mut core, ConnId(1), "alice");
        let lobby = core.lobby_id();
        for i in 0..20 {
            core.handle_command(
                ConnId(1),
                ClientCommand::SendMessage {
                    room_id: lobby,
                    content: format!("msg {i}"),
                    emoji: None,
                },
            );
        }

        // Reconnecting join skips the automatic Lobby join, so the explicit
        // join below is the only replay source.
        core.handle_command(
            ConnId(2),
            ClientCommand::Join {
                username: "bob".to_string(),
                emoji: None,
                is_reconnecting: true,
            },
        );
        let effects = core.handle_command(ConnId(2), ClientCommand::JoinRoom { room_id: lobby });
        let replayed: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Unicast(ConnId(2), ServerEvent::ChatMessage { message }) => {
                    Some(message.content.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(replayed.len(), 5);
        assert_eq!(replayed.last().unwrap(), "msg 19");
    }

    #[test]
    fn admin_gates_on_clear_and_remove() {
        let mut core = core();
        join(&mut core, ConnId(1), "alice");
        join(&mut core, ConnId(2), "Admin");
        let room = create_room(&mut core, ConnId(1), "Temp");

        let denied = core.handle_command(ConnId(1), ClientCommand::RemoveRoom { room_id: room });
        assert_eq!(error_messages(&denied), vec!["Only an admin can remove rooms."]);
        let denied =
            core.handle_command(ConnId(1), ClientCommand::ClearChatHistory { room_id: room });
        assert_eq!(error_messages(&denied), vec!["Only an admin can clear history."]);

        let removed = core.handle_command(ConnId(2), ClientCommand::RemoveRoom { room_id: room });
        assert!(removed
            .iter()
            .any(|e| matches!(e, Effect::DeleteRoom(id) if *id == room)));
        assert!(!core.rooms_snapshot().iter().any(|r| r.id == room));
    }

    #[test]
    fn lobby_cannot_be_removed() {
        let mut core = core();
        join(&mut core, ConnId(1), "Admin");
        let lobby = core.lobby_id();
        let effects = core.handle_command(ConnId(1), ClientCommand::RemoveRoom { room_id: lobby });
        assert_eq!(error_messages(&effects).len(), 1);
        assert!(core.rooms_snapshot().iter().any(|r| r.id == lobby));
    }

    #[test]
    fn ping_answers_pong() {
        let mut core = core();
        join(&mut core, ConnId(1), "alice");
        let effects = core.handle_command(ConnId(1), ClientCommand::Ping);
        assert!(matches!(
            effects.as_slice(),
            [Effect::Unicast(ConnId(1), ServerEvent::Pong)]
        ));
    }

    #[test]
    fn invite_roundtrip_and_expiry_pruning() {
        let mut core = core();
        join(&mut core, ConnId(1), "alice");
        let lobby = core.lobby_id();
        let effects =
            core.handle_command(ConnId(1), ClientCommand::CreateInvite { room_id: lobby });
        let code = effects
            .iter()
            .find_map(|e| match e {
                Effect::PersistLink(link) => Some(link.code.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(core.resolve_invite(&code), Some(lobby));
        assert_eq!(core.resolve_invite("NOSUCH00"), None);
    }

    #[test]
    fn disconnect_leaves_room_and_notifies_once() {
        let mut core = core();
        join(&mut core, ConnId(1), "alice");
        join(&mut core, ConnId(2), "bob");
        let lobby = core.lobby_id();

        let effects = core.disconnect(ConnId(1));
        let leave_notices = effects
            .iter()
            .filter(|e| {
                matches!(e, Effect::Multicast { event: ServerEvent::ChatMessage { message }, .. }
                    if message.message_type == MessageKind::UserLeft)
            })
            .count();
        assert_eq!(leave_notices, 1);
        assert!(core.conns_in_room(lobby, None).contains(&ConnId(2)));
        assert!(!core.conns_in_room(lobby, None).contains(&ConnId(1)));

        // Second disconnect for the same connection: no further notice.
        let again = core.disconnect(ConnId(1));
        assert!(again.iter().all(|e| matches!(
            e,
            Effect::BroadcastAll(ServerEvent::UserCount { .. })
        )));
    }

    #[test]
    fn peer_chat_message_lands_in_room_history_and_multicast() {
        let mut core = core();
        join(&mut core, ConnId(1), "alice");
        let lobby = core.lobby_id();
        let remote = ChatMessage::new("from a peer", User::new("remote"), lobby);

        let effects = core.apply_peer(ConnId(9), PeerMessage::ChatMessage(remote));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Multicast { room_id, event: ServerEvent::ChatMessage { message }, .. }
                if *room_id == lobby && message.content == "from a peer"
        )));

        // The message is replayed to the next joiner.
        join(&mut core, ConnId(2), "bob");
        let replayed = core.handle_command(ConnId(2), ClientCommand::JoinRoom { room_id: lobby });
        assert!(replayed.iter().any(|e| matches!(
            e,
            Effect::Unicast(ConnId(2), ServerEvent::ChatMessage { message })
                if message.content == "from a peer"
        )));
    }

    #[test]
    fn peer_room_list_merges_unknown_rooms() {
        let mut core = core();
        let remote_room = Room::new("Remote Room", User::new("remote"));
        let id = remote_room.id;
        let effects = core.apply_peer(ConnId(9), PeerMessage::RoomList(vec![remote_room.clone()]));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::PersistRoom(r) if r.id == id)));

        // Merging the same list again is a no-op.
        let again = core.apply_peer(ConnId(9), PeerMessage::RoomList(vec![remote_room]));
        assert!(again.is_empty());
    }

    #[test]
    fn peer_ping_answers_on_same_link() {
        let mut core = core();
        let effects = core.apply_peer(ConnId(7), PeerMessage::Ping);
        assert!(matches!(
            effects.as_slice(),
            [Effect::PeerUnicast(ConnId(7), PeerMessage::Pong)]
        ));
    }

    #[test]
    fn client_command_json_shapes() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"join","username":"alice","emoji":"🦀"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Join { username, .. } if username == "alice"));

        let id = Uuid::new_v4();
        let cmd: ClientCommand = serde_json::from_str(&format!(
            r#"{{"type":"sendMessage","roomId":"{id}","content":"hey"}}"#
        ))
        .unwrap();
        assert!(matches!(cmd, ClientCommand::SendMessage { room_id, .. } if room_id == id));

        let json = serde_json::to_value(ServerEvent::UserCount { count: 3 }).unwrap();
        assert_eq!(json["type"], "userCount");
        assert_eq!(json["count"], 3);
    }
}
