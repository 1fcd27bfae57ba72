//! Peer wire protocol: the tagged message set exchanged between linked
//! instances, plus the discovery advertisement.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ChatMessage, Room, User};

/// Service type advertised on the local network.
pub const SERVICE_TYPE: &str = "_huddle._tcp";

/// Discovery domain.
pub const SERVICE_DOMAIN: &str = "local.";

/// All peer-link message types. Encoding is JSON; framing is a 4-byte
/// big-endian length prefix (see the wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    ChatMessage(ChatMessage),
    UserJoined(User, Uuid),
    UserLeft(User, Uuid),
    RoomCreated(Room),
    RoomList(Vec<Room>),
    JoinRoom(Uuid, User),
    LeaveRoom(Uuid, User),
    Ping,
    Pong,
}

/// A discoverable peer endpoint. Broadcast over UDP multicast; never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAdvertisement {
    pub name: String,
    pub service_type: String,
    pub domain: String,
    /// Random per-process id, used to ignore our own beacons.
    pub instance_id: Uuid,
    /// TCP port the peer transport listens on.
    pub listen_port: u16,
}

impl ServiceAdvertisement {
    pub fn new(name: &str, instance_id: Uuid, listen_port: u16) -> Self {
        Self {
            name: name.to_string(),
            service_type: SERVICE_TYPE.to_string(),
            domain: SERVICE_DOMAIN.to_string(),
            instance_id,
            listen_port,
        }
    }
}
