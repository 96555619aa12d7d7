//! Seams to the external collaborators the engine consumes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use huddle_types::models::{Author, Message, MessageRecord, PresenceMeta};

use crate::error::BackendError;

/// Raw, not yet validated event text as delivered by a transport.
pub type RawEvent = Arc<str>;

/// An open room-scoped channel. Dropping the handle releases the
/// underlying subscription exactly once.
pub struct ChannelHandle {
    room_id: Uuid,
    conn_id: Uuid,
    rx: mpsc::UnboundedReceiver<RawEvent>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelHandle {
    pub fn new(
        room_id: Uuid,
        conn_id: Uuid,
        rx: mpsc::UnboundedReceiver<RawEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            room_id,
            conn_id,
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    /// Transport-specific connection or subscription id.
    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Next raw event, or `None` once the transport has closed the channel.
    pub async fn recv(&mut self) -> Option<RawEvent> {
        self.rx.recv().await
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Durable message storage.
pub trait MessageStore {
    fn insert_message(
        &self,
        record: MessageRecord,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Newest-first rows at inclusive offsets `[from, to]`, author joined.
    fn query_messages(
        &self,
        room_id: Uuid,
        from: u32,
        to: u32,
    ) -> impl Future<Output = Result<Vec<Message>, BackendError>> + Send;
}

/// Push stream of row inserts, filtered by room.
pub trait ChangeFeed {
    fn subscribe_inserts(
        &self,
        room_id: Uuid,
    ) -> impl Future<Output = Result<ChannelHandle, BackendError>> + Send;
}

/// Ephemeral per-room presence channels.
pub trait PresenceChannels {
    /// Join a room's channel; sync snapshots arrive on the returned handle.
    fn join_presence(
        &self,
        room_id: Uuid,
    ) -> impl Future<Output = Result<ChannelHandle, BackendError>> + Send;

    /// Publish a heartbeat on a joined channel.
    fn track(
        &self,
        room_id: Uuid,
        conn_id: Uuid,
        meta: PresenceMeta,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

pub trait IdentityService {
    /// The signed-in user, or `None` while identity is unresolved.
    fn current_user(&self) -> impl Future<Output = Result<Option<Author>, BackendError>> + Send;

    fn lookup_profile(&self, user_id: Uuid) -> impl Future<Output = Result<Author, BackendError>> + Send;
}

/// Everything a `SyncSession` needs from the outside world.
pub trait Backend:
    MessageStore + ChangeFeed + PresenceChannels + IdentityService + Clone + Send + Sync + 'static
{
}

impl<T> Backend for T where
    T: MessageStore + ChangeFeed + PresenceChannels + IdentityService + Clone + Send + Sync + 'static
{
}

/// Bound a backend call. Elapsed calls become `BackendError::Timeout`.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BackendError::Timeout(limit))?
}
