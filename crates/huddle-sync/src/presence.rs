//! Room presence: who is connected right now.

use std::collections::HashSet;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use huddle_types::models::{Author, PresenceMeta, PresenceState};

use crate::backend::{ChannelHandle, PresenceChannels};
use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceView {
    /// Identity unresolved or no snapshot received yet.
    Unknown,
    Online(usize),
}

/// Distinct participants of one room, rebuilt from each full snapshot.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    room_id: Uuid,
    participants: HashSet<Uuid>,
    view: PresenceView,
}

impl PresenceTracker {
    pub fn new(room_id: Uuid) -> Self {
        Self {
            room_id,
            participants: HashSet::new(),
            view: PresenceView::Unknown,
        }
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn view(&self) -> &PresenceView {
        &self.view
    }

    pub fn participants(&self) -> &HashSet<Uuid> {
        &self.participants
    }

    pub fn apply_sync(&mut self, state: &PresenceState) -> &PresenceView {
        self.participants = state.participants();
        self.view = PresenceView::Online(self.participants.len());
        &self.view
    }

    pub fn reset(&mut self) {
        self.participants.clear();
        self.view = PresenceView::Unknown;
    }
}

/// Open the room's presence channel and publish our heartbeat.
/// Without a resolved identity nothing is tracked and `Ok(None)` comes back.
pub async fn join<P: PresenceChannels>(
    channels: &P,
    room_id: Uuid,
    me: Option<&Author>,
) -> Result<Option<ChannelHandle>, BackendError> {
    let Some(me) = me else {
        debug!(%room_id, "identity unresolved, presence not tracked");
        return Ok(None);
    };

    let handle = channels.join_presence(room_id).await?;
    let meta = PresenceMeta {
        user_id: me.id,
        online_at: Utc::now(),
    };
    channels.track(room_id, handle.conn_id(), meta).await?;
    Ok(Some(handle))
}
