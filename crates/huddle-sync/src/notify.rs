//! User-facing notification sink.
//!
//! Non-fatal failures are turned into a `Notice` and handed to the sink the
//! session was built with.

use std::fmt;

use tracing::{error, warn};
use uuid::Uuid;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    HistoryFetch,
    AuthorLookup,
    PersistenceWrite,
    Subscription,
    Usage,
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HistoryFetch => "history_fetch",
            Self::AuthorLookup => "author_lookup",
            Self::PersistenceWrite => "persistence_write",
            Self::Subscription => "subscription",
            Self::Usage => "usage",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub room_id: Option<Uuid>,
    pub message: String,
}

impl From<&SyncError> for Notice {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::HistoryFetch { .. } => NoticeKind::HistoryFetch,
            SyncError::AuthorLookup { .. } => NoticeKind::AuthorLookup,
            SyncError::PersistenceWrite { .. } => NoticeKind::PersistenceWrite,
            SyncError::Subscription { .. } => NoticeKind::Subscription,
            SyncError::NotInRoom | SyncError::NotSignedIn => NoticeKind::Usage,
        };
        Self {
            kind,
            room_id: err.room_id(),
            message: err.to_string(),
        }
    }
}

/// Trait for surfacing notices. Implementations can show a toast,
/// write to tracing, or discard them.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Sink that uses the `tracing` crate.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notice: Notice) {
        let room = notice.room_id.map(|id| id.to_string()).unwrap_or_default();
        match notice.kind {
            NoticeKind::Subscription => {
                error!(kind = %notice.kind, room_id = %room, "{}", notice.message);
            }
            _ => {
                warn!(kind = %notice.kind, room_id = %room, "{}", notice.message);
            }
        }
    }
}

/// No-op sink that discards all notices.
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _notice: Notice) {}
}
