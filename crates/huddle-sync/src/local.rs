//! In-process backend: the SQLite store plus the gateway dispatcher,
//! without any network hop in between.

use std::sync::Arc;

use tracing::{debug, error};
use uuid::Uuid;

use huddle_db::Database;
use huddle_gateway::Dispatcher;
use huddle_types::models::{Author, Message, MessageRecord, PresenceMeta};

use crate::backend::{ChangeFeed, ChannelHandle, IdentityService, MessageStore, PresenceChannels};
use crate::error::BackendError;

#[derive(Clone)]
pub struct LocalBackend {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    user_id: Option<Uuid>,
}

impl LocalBackend {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self {
            db,
            dispatcher,
            user_id: None,
        }
    }

    /// Act as `user_id`. Identity resolves once that user has a profile row.
    pub fn signed_in(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Run blocking DB work off the async runtime.
async fn blocking<F, T>(f: F) -> Result<T, BackendError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            BackendError::Storage(anyhow::anyhow!("blocking task failed: {}", e))
        })?
        .map_err(BackendError::from)
}

impl MessageStore for LocalBackend {
    async fn insert_message(&self, record: MessageRecord) -> Result<(), BackendError> {
        let db = self.db.clone();
        let row = record.clone();
        let inserted = blocking(move || db.insert_message(&row)).await?;

        if inserted {
            // The backing store announces the new row to every subscriber
            self.dispatcher.publish_insert(record);
        } else {
            debug!(message_id = %record.id, "insert ignored, row already exists");
        }
        Ok(())
    }

    async fn query_messages(&self, room_id: Uuid, from: u32, to: u32) -> Result<Vec<Message>, BackendError> {
        let db = self.db.clone();
        blocking(move || {
            db.get_messages(&room_id, from, to)?
                .into_iter()
                .map(|row| row.into_message())
                .collect()
        })
        .await
    }
}

impl ChangeFeed for LocalBackend {
    async fn subscribe_inserts(&self, room_id: Uuid) -> Result<ChannelHandle, BackendError> {
        let (sub_id, rx) = self.dispatcher.subscribe_feed(room_id);
        let dispatcher = self.dispatcher.clone();
        Ok(ChannelHandle::new(room_id, sub_id, rx, move || {
            dispatcher.unsubscribe_feed(room_id, sub_id);
        }))
    }
}

impl PresenceChannels for LocalBackend {
    async fn join_presence(&self, room_id: Uuid) -> Result<ChannelHandle, BackendError> {
        let (conn_id, rx) = self.dispatcher.join_presence(room_id);
        let dispatcher = self.dispatcher.clone();
        Ok(ChannelHandle::new(room_id, conn_id, rx, move || {
            dispatcher.leave_presence(room_id, conn_id);
        }))
    }

    async fn track(&self, room_id: Uuid, conn_id: Uuid, meta: PresenceMeta) -> Result<(), BackendError> {
        if self.dispatcher.track(room_id, conn_id, meta) {
            Ok(())
        } else {
            Err(BackendError::ChannelClosed)
        }
    }
}

impl IdentityService for LocalBackend {
    async fn current_user(&self) -> Result<Option<Author>, BackendError> {
        let Some(user_id) = self.user_id else {
            return Ok(None);
        };
        match self.lookup_profile(user_id).await {
            Ok(author) => Ok(Some(author)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lookup_profile(&self, user_id: Uuid) -> Result<Author, BackendError> {
        let db = self.db.clone();
        let row = blocking(move || db.get_profile(&user_id)).await?;
        match row {
            Some(row) => Ok(row.into_author()?),
            None => Err(BackendError::NotFound(format!("profile {}", user_id))),
        }
    }
}
