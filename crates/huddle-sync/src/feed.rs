//! Live change-feed handling: raw payloads are validated here before
//! anything reaches the store.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use huddle_types::events::FeedEvent;
use huddle_types::models::{Message, MessageRecord};

use crate::backend::{IdentityService, with_timeout};
use crate::error::SyncError;

/// Why a raw payload was refused at the boundary.
#[derive(Debug, Error)]
pub enum FeedRejection {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event for room {got} arrived on the channel for room {expected}")]
    WrongRoom { expected: Uuid, got: Uuid },

    #[error("message {0} has no content")]
    EmptyContent(Uuid),
}

/// Decode one raw payload for the channel of `expected_room`.
pub fn decode(expected_room: Uuid, raw: &str) -> Result<FeedEvent, FeedRejection> {
    let event: FeedEvent = serde_json::from_str(raw)?;

    let got = event.room_id();
    if got != expected_room {
        return Err(FeedRejection::WrongRoom {
            expected: expected_room,
            got,
        });
    }
    if let FeedEvent::Insert { record } = &event {
        if record.content.trim().is_empty() {
            return Err(FeedRejection::EmptyContent(record.id));
        }
    }
    Ok(event)
}

/// Attach the sender's profile snapshot to an inserted row.
pub async fn resolve_author<I: IdentityService>(
    identity: &I,
    record: MessageRecord,
    timeout: Duration,
) -> Result<Message, SyncError> {
    match with_timeout(timeout, identity.lookup_profile(record.sender_id)).await {
        Ok(author) => Ok(Message::from_record(record, author)),
        Err(source) => Err(SyncError::AuthorLookup {
            room_id: record.room_id,
            message_id: record.id,
            sender_id: record.sender_id,
            source,
        }),
    }
}

/// Author resolution for one live insert, finished off the session task.
#[derive(Debug)]
pub struct ResolvedInsert {
    pub room_id: Uuid,
    pub result: Result<Message, SyncError>,
}

/// Resolve `record`'s author on its own task and report on `resolved`.
/// The record is owned by the task from here on, so dropping the caller's
/// future cannot lose it.
pub fn spawn_resolve<I>(
    identity: &I,
    record: MessageRecord,
    timeout: Duration,
    resolved: mpsc::UnboundedSender<ResolvedInsert>,
) where
    I: IdentityService + Clone + Send + Sync + 'static,
{
    let identity = identity.clone();
    tokio::spawn(async move {
        let room_id = record.room_id;
        let message_id = record.id;
        let result = resolve_author(&identity, record, timeout).await;
        debug!(%message_id, ok = result.is_ok(), "author lookup finished");
        let _ = resolved.send(ResolvedInsert { room_id, result });
    });
}
