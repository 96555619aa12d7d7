use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageRecord, PresenceMeta, PresenceState};

/// Events pushed from the backing store to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedEvent {
    /// A message row was inserted
    Insert { record: MessageRecord },

    /// Full presence snapshot for a room after any join, track or leave
    PresenceSync { room_id: Uuid, state: PresenceState },
}

impl FeedEvent {
    /// Every feed event is scoped to exactly one room.
    pub fn room_id(&self) -> Uuid {
        match self {
            Self::Insert { record } => record.room_id,
            Self::PresenceSync { room_id, .. } => *room_id,
        }
    }
}

/// Commands sent FROM client TO server over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Start receiving insert events for a room
    Subscribe { room_id: Uuid },

    /// Stop receiving insert events for a room
    Unsubscribe { room_id: Uuid },

    /// Join the room's presence channel and publish a heartbeat
    Track { room_id: Uuid, meta: PresenceMeta },

    /// Leave the room's presence channel
    Untrack { room_id: Uuid },
}
