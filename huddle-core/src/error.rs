//! Error taxonomy. Parse and transport failures stay local to one request
//! or connection; room-domain failures go back to the originating client as
//! typed events and are never broadcast.

use thiserror::Error;

/// Malformed HTTP, multipart, WebSocket, or envelope framing. The request
/// is answered with 400 where a response is still possible; otherwise the
/// connection is dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed header block")]
    MalformedHeaders,
    #[error("header block exceeds {0} bytes")]
    HeadersTooLarge(usize),
    #[error("multipart boundary not found in body")]
    BoundaryNotFound,
    #[error("malformed multipart part headers")]
    MalformedPart,
    #[error("multipart file payload is empty")]
    EmptyFilePart,
    #[error("unknown websocket opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("frame payload of {len} bytes exceeds cap of {max}")]
    FrameTooLarge { len: u64, max: usize },
    #[error("text frame payload is not valid utf-8")]
    InvalidTextPayload,
}

/// Room-domain failures, surfaced to the requesting client only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("A room with this name already exists")]
    DuplicateRoomName,
    #[error("Unknown room")]
    UnknownRoom,
    #[error("Only an admin can clear history.")]
    ClearHistoryDenied,
    #[error("Only an admin can remove rooms.")]
    RemoveRoomDenied,
    #[error("The Lobby cannot be removed")]
    LobbyReserved,
    #[error("Unknown attachment")]
    UnknownAttachment,
}

/// Top-level error for the daemon's request handling.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Auth(String),
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("rejected: {0}")]
    Resource(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl Error {
    /// HTTP status line for this error when a response can still be written.
    pub fn status_line(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "400 Bad Request",
            Error::NotFound(_) => "404 Not Found",
            Error::Auth(_) => "401 Unauthorized",
            Error::Forbidden(_) => "403 Forbidden",
            Error::Resource(_) => "413 Payload Too Large",
            Error::Transport(_) => "500 Internal Server Error",
        }
    }
}
