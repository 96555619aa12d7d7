//! Optimistic echo: a local send is shown before the write that persists it
//! completes. The durable write runs on its own task and reports back.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use huddle_types::models::{Author, Message, MessageRecord};

use crate::backend::{MessageStore, with_timeout};
use crate::error::BackendError;

/// Result of one background persistence write.
#[derive(Debug)]
pub struct WriteOutcome {
    pub room_id: Uuid,
    pub message_id: Uuid,
    pub result: Result<(), BackendError>,
}

/// Build the provisional message. Returns `None` for blank content.
pub fn compose(room_id: Uuid, me: &Author, content: &str, now: DateTime<Utc>) -> Option<Message> {
    let content = content.trim();
    if content.is_empty() {
        return None;
    }
    let record = MessageRecord {
        id: Uuid::new_v4(),
        room_id,
        sender_id: me.id,
        content: content.to_string(),
        created_at: now,
    };
    Some(Message::from_record(record, me.clone()))
}

/// Persist `record` in the background and report the outcome on `outcomes`.
pub fn spawn_write<S>(
    store: &S,
    record: MessageRecord,
    timeout: Duration,
    outcomes: mpsc::UnboundedSender<WriteOutcome>,
) where
    S: MessageStore + Clone + Send + Sync + 'static,
{
    let store = store.clone();
    tokio::spawn(async move {
        let room_id = record.room_id;
        let message_id = record.id;
        let result = with_timeout(timeout, store.insert_message(record)).await;
        debug!(%message_id, ok = result.is_ok(), "optimistic write finished");
        let _ = outcomes.send(WriteOutcome {
            room_id,
            message_id,
            result,
        });
    });
}
