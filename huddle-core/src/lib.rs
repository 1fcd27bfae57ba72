//! Huddle chat protocol core.
//! Host-driven: no I/O; the daemon passes bytes and events, and receives
//! parsed values and effects to execute.

pub mod error;
pub mod http;
pub mod model;
pub mod multipart;
pub mod protocol;
pub mod room;
pub mod wire;
pub mod ws;

pub use error::{ChatError, Error, ProtocolError};
pub use model::{ChatMessage, FileAttachment, InviteLink, MessageKind, Room, User};
pub use protocol::{PeerMessage, ServiceAdvertisement, SERVICE_DOMAIN, SERVICE_TYPE};
pub use room::{ChatCore, ClientCommand, ConnId, Effect, ServerEvent};
pub use wire::{decode_envelope, encode_envelope, EnvelopeDecodeError, EnvelopeEncodeError};
