use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Messages --

/// Body of `POST /rooms/{room_id}/messages`. The id is chosen by the client
/// so the optimistic copy and the persisted row share it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Inclusive offset window for `GET /rooms/{room_id}/messages`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MessageWindow {
    pub from: u32,
    pub to: u32,
}

// -- Profiles --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpsertProfileRequest {
    pub display_name: String,
    pub avatar_ref: Option<String>,
}
