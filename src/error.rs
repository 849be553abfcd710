#![forbid(unsafe_code)]

// Error taxonomy returned to signaling clients

use crate::media::types::MediaError;
use crate::room::names::NameStoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to the requesting connection as an `error` event.
///
/// None of these terminate the connection; the gateway converts each one into
/// a structured reply carrying its [`ErrorKind`].
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Room name already taken: {0}")]
    RoomNameTaken(String),

    #[error("Not in room: {0}")]
    NotInRoom(String),

    #[error("Not found: {0}")]
    TransportNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Cannot consume producer {0}")]
    CannotConsume(String),

    #[error("Media engine failure: {0}")]
    EngineFailure(#[from] MediaError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Name reservation store unavailable: {0}")]
    NameStoreUnavailable(#[from] NameStoreError),
}

/// Machine-readable error kind carried in the `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    RoomNameTaken,
    NotInRoom,
    TransportNotFound,
    Unauthorized,
    CannotConsume,
    EngineFailure,
    InvalidRequest,
    NameStoreUnavailable,
}

impl SignalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalError::RoomNameTaken(_) => ErrorKind::RoomNameTaken,
            SignalError::NotInRoom(_) => ErrorKind::NotInRoom,
            SignalError::TransportNotFound(_) => ErrorKind::TransportNotFound,
            SignalError::Unauthorized(_) => ErrorKind::Unauthorized,
            SignalError::CannotConsume(_) => ErrorKind::CannotConsume,
            SignalError::EngineFailure(_) => ErrorKind::EngineFailure,
            SignalError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SignalError::NameStoreUnavailable(_) => ErrorKind::NameStoreUnavailable,
        }
    }

    pub(crate) fn not_in_room(peer_id: &str) -> Self {
        SignalError::NotInRoom(format!("peer {peer_id} has no room"))
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
