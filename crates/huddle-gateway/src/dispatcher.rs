use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use huddle_types::events::FeedEvent;
use huddle_types::models::{MessageRecord, PresenceMeta, PresenceState};

/// A serialized `FeedEvent`. Serialized once per publish and shared by
/// every subscriber.
pub type Payload = Arc<str>;

/// Room-scoped fan-out hub for the change-feed and presence channels.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// Insert subscribers: room_id -> (subscription_id -> sender)
    feeds: RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::UnboundedSender<Payload>>>>,

    /// Presence channels: room_id -> room
    presence: RwLock<HashMap<Uuid, PresenceRoom>>,
}

#[derive(Default)]
struct PresenceRoom {
    /// conn_id -> sender for sync snapshots
    listeners: HashMap<Uuid, mpsc::UnboundedSender<Payload>>,

    /// conn_id -> heartbeats published on that connection
    tracked: HashMap<Uuid, Vec<PresenceMeta>>,
}

impl PresenceRoom {
    fn snapshot(&self) -> PresenceState {
        PresenceState(
            self.tracked
                .iter()
                .map(|(conn_id, metas)| (conn_id.to_string(), metas.clone()))
                .collect(),
        )
    }

    fn broadcast_sync(&mut self, room_id: Uuid) {
        let Some(payload) = encode(&FeedEvent::PresenceSync {
            room_id,
            state: self.snapshot(),
        }) else {
            return;
        };
        self.listeners.retain(|_, tx| tx.send(payload.clone()).is_ok());
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Change-feed --

    /// Subscribe to insert events for one room. Returns (subscription_id, receiver).
    pub fn subscribe_feed(&self, room_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = self.attach_feed(room_id, tx);
        (sub_id, rx)
    }

    /// Route a room's insert events into an existing sender.
    pub fn attach_feed(&self, room_id: Uuid, tx: mpsc::UnboundedSender<Payload>) -> Uuid {
        let sub_id = Uuid::new_v4();
        self.inner
            .feeds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(room_id)
            .or_default()
            .insert(sub_id, tx);
        debug!(%room_id, %sub_id, "feed subscription opened");
        sub_id
    }

    pub fn unsubscribe_feed(&self, room_id: Uuid, sub_id: Uuid) {
        let mut feeds = self.inner.feeds.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = feeds.get_mut(&room_id) {
            if subs.remove(&sub_id).is_some() {
                debug!(%room_id, %sub_id, "feed subscription closed");
            }
            if subs.is_empty() {
                feeds.remove(&room_id);
            }
        }
    }

    /// Deliver an inserted row to every subscriber of its room.
    pub fn publish_insert(&self, record: MessageRecord) {
        let room_id = record.room_id;
        let Some(payload) = encode(&FeedEvent::Insert { record }) else {
            return;
        };

        let mut feeds = self.inner.feeds.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = feeds.get_mut(&room_id) {
            subs.retain(|_, tx| tx.send(payload.clone()).is_ok());
            if subs.is_empty() {
                feeds.remove(&room_id);
            }
        }
    }

    pub fn feed_subscriber_count(&self, room_id: Uuid) -> usize {
        self.inner
            .feeds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&room_id)
            .map_or(0, HashMap::len)
    }

    // -- Presence --

    /// Join a room's presence channel. The current snapshot is delivered
    /// immediately. Returns (conn_id, receiver).
    pub fn join_presence(&self, room_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<Payload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = self.attach_presence(room_id, tx);
        (conn_id, rx)
    }

    pub fn attach_presence(&self, room_id: Uuid, tx: mpsc::UnboundedSender<Payload>) -> Uuid {
        let conn_id = Uuid::new_v4();
        let mut presence = self.inner.presence.write().unwrap_or_else(PoisonError::into_inner);
        let room = presence.entry(room_id).or_default();

        if let Some(payload) = encode(&FeedEvent::PresenceSync {
            room_id,
            state: room.snapshot(),
        }) {
            let _ = tx.send(payload);
        }
        room.listeners.insert(conn_id, tx);
        debug!(%room_id, %conn_id, "presence channel joined");
        conn_id
    }

    /// Publish a heartbeat for a joined connection, replacing its previous
    /// one. Returns false if the connection has not joined the room.
    pub fn track(&self, room_id: Uuid, conn_id: Uuid, meta: PresenceMeta) -> bool {
        let mut presence = self.inner.presence.write().unwrap_or_else(PoisonError::into_inner);
        let Some(room) = presence.get_mut(&room_id) else {
            return false;
        };
        if !room.listeners.contains_key(&conn_id) {
            return false;
        }

        room.tracked.insert(conn_id, vec![meta]);
        room.broadcast_sync(room_id);
        true
    }

    /// Leave a presence channel, dropping the connection's heartbeat.
    pub fn leave_presence(&self, room_id: Uuid, conn_id: Uuid) {
        let mut presence = self.inner.presence.write().unwrap_or_else(PoisonError::into_inner);
        let Some(room) = presence.get_mut(&room_id) else {
            return;
        };

        room.listeners.remove(&conn_id);
        if room.tracked.remove(&conn_id).is_some() {
            room.broadcast_sync(room_id);
        }
        if room.listeners.is_empty() && room.tracked.is_empty() {
            presence.remove(&room_id);
        }
        debug!(%room_id, %conn_id, "presence channel left");
    }

    pub fn presence_state(&self, room_id: Uuid) -> PresenceState {
        self.inner
            .presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&room_id)
            .map(PresenceRoom::snapshot)
            .unwrap_or_default()
    }
}

fn encode(event: &FeedEvent) -> Option<Payload> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json.into()),
        Err(e) => {
            error!("failed to encode feed event for room {}: {}", event.room_id(), e);
            None
        }
    }
}
