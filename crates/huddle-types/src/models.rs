use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author projection joined onto every message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

/// The persisted message row, without the author join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message as displayed: the row plus a denormalized author snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub author: Author,
}

impl Message {
    pub fn from_record(record: MessageRecord, author: Author) -> Self {
        Self {
            id: record.id,
            room_id: record.room_id,
            sender_id: record.sender_id,
            content: record.content,
            created_at: record.created_at,
            author,
        }
    }

    pub fn record(&self) -> MessageRecord {
        MessageRecord {
            id: self.id,
            room_id: self.room_id,
            sender_id: self.sender_id,
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }

    /// Sort key used everywhere a room list is ordered.
    /// Equal timestamps fall back to the id so ordering is total.
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// One heartbeat published on a presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub user_id: Uuid,
    pub online_at: DateTime<Utc>,
}

/// Full presence snapshot for a room, keyed by ephemeral connection id.
/// Several connections may carry the same participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceState(pub HashMap<String, Vec<PresenceMeta>>);

impl PresenceState {
    pub fn participants(&self) -> HashSet<Uuid> {
        self.0
            .values()
            .flat_map(|metas| metas.iter().map(|m| m.user_id))
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.participants().len()
    }
}
