use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a backend adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Everything the session can surface. All of these are local to one room
/// view; none of them tear down the session itself.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to load history page {page} for room {room_id}: {source}")]
    HistoryFetch {
        room_id: Uuid,
        page: u32,
        source: BackendError,
    },

    #[error("could not resolve author {sender_id} of message {message_id}: {source}")]
    AuthorLookup {
        room_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        source: BackendError,
    },

    #[error("message {message_id} is shown but was not persisted: {source}")]
    PersistenceWrite {
        room_id: Uuid,
        message_id: Uuid,
        source: BackendError,
    },

    #[error("subscription for room {room_id} failed: {source}")]
    Subscription { room_id: Uuid, source: BackendError },

    #[error("no room is active")]
    NotInRoom,

    #[error("no signed-in user")]
    NotSignedIn,
}

impl SyncError {
    pub fn room_id(&self) -> Option<Uuid> {
        match self {
            Self::HistoryFetch { room_id, .. }
            | Self::AuthorLookup { room_id, .. }
            | Self::PersistenceWrite { room_id, .. }
            | Self::Subscription { room_id, .. } => Some(*room_id),
            Self::NotInRoom | Self::NotSignedIn => None,
        }
    }
}
