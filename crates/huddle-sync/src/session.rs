//! The per-session handle that owns all conversation state.
//!
//! A `SyncSession` is driven from one task. Every mutation goes through
//! `&mut self`, so the room store is the single serialization point for the
//! history loader, the live feed and optimistic sends. Work interleaves only
//! at await points; each store operation runs to completion. Work that has
//! to wait on the backend (author lookups, durable writes) runs on spawned
//! tasks and reports back over channels, so `next_update` can be dropped at
//! any await without losing an event.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_types::events::FeedEvent;
use huddle_types::models::Author;

use crate::backend::{Backend, ChannelHandle, RawEvent, with_timeout};
use crate::config::SyncConfig;
use crate::echo::{self, WriteOutcome};
use crate::error::{BackendError, SyncError};
use crate::feed::{self, ResolvedInsert};
use crate::history;
use crate::notify::{Notice, NotificationSink};
use crate::presence::{self, PresenceTracker, PresenceView};
use crate::store::{RoomState, RoomStore};
use crate::viewport::{Viewport, ViewportAction};

/// Something the view should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// New messages were merged into a room.
    Messages {
        room_id: Uuid,
        added: usize,
        action: ViewportAction,
    },

    Presence { room_id: Uuid, view: PresenceView },

    /// A non-fatal failure was surfaced to the notification sink.
    Notice(Notice),

    /// The room's channel broke and the room was left.
    RoomClosed { room_id: Uuid },
}

/// Receipt for an optimistic send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub message_id: Uuid,
    pub action: ViewportAction,
}

/// Receipt for an older-history fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loaded {
    pub added: usize,
    pub action: ViewportAction,
}

/// Channels held for the room on screen. Dropping this releases them.
struct ActiveRoom {
    room_id: Uuid,
    feed: ChannelHandle,
    presence: Option<ChannelHandle>,
    tracker: PresenceTracker,
}

enum Incoming {
    Feed(Option<RawEvent>),
    Presence(Option<RawEvent>),
    Write(WriteOutcome),
    Resolved(ResolvedInsert),
}

pub struct SyncSession<B: Backend> {
    backend: B,
    config: SyncConfig,
    sink: Arc<dyn NotificationSink>,
    store: RoomStore,
    me: Option<Author>,
    active: Option<ActiveRoom>,
    writes_tx: mpsc::UnboundedSender<WriteOutcome>,
    writes_rx: mpsc::UnboundedReceiver<WriteOutcome>,
    pending_writes: usize,
    resolved_tx: mpsc::UnboundedSender<ResolvedInsert>,
    resolved_rx: mpsc::UnboundedReceiver<ResolvedInsert>,
    pending_lookups: usize,
}

impl<B: Backend> SyncSession<B> {
    /// Build a session and resolve the signed-in user once.
    pub async fn connect(backend: B, config: SyncConfig, sink: Arc<dyn NotificationSink>) -> Self {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
        let mut session = Self {
            backend,
            store: RoomStore::new(config.room_capacity),
            config,
            sink,
            me: None,
            active: None,
            writes_tx,
            writes_rx,
            pending_writes: 0,
            resolved_tx,
            resolved_rx,
            pending_lookups: 0,
        };
        session.refresh_identity().await;
        session
    }

    /// Re-read the signed-in user from the identity service.
    pub async fn refresh_identity(&mut self) -> Option<&Author> {
        self.me = match with_timeout(self.config.lookup_timeout, self.backend.current_user()).await {
            Ok(me) => me,
            Err(e) => {
                warn!("Could not resolve current user: {}", e);
                None
            }
        };
        self.me.as_ref()
    }

    pub fn identity(&self) -> Option<&Author> {
        self.me.as_ref()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn active_room_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.room_id)
    }

    pub fn active_room(&self) -> Option<&RoomState> {
        let room_id = self.active_room_id()?;
        self.store.get(&room_id)
    }

    pub fn room(&self, room_id: &Uuid) -> Option<&RoomState> {
        self.store.get(room_id)
    }

    pub fn presence(&self) -> PresenceView {
        self.active
            .as_ref()
            .map_or(PresenceView::Unknown, |a| a.tracker.view().clone())
    }

    /// Writes spawned by `send` that have not reported back yet.
    pub fn pending_writes(&self) -> usize {
        self.pending_writes
    }

    /// Live inserts whose author lookup is still running.
    pub fn pending_lookups(&self) -> usize {
        self.pending_lookups
    }

    pub fn cached_rooms(&self) -> usize {
        self.store.len()
    }

    // -- Room lifecycle --

    /// Make `room_id` the active room. The previous room's channels are
    /// released before anything for the new room is opened.
    ///
    /// A channel that cannot be opened is fatal to the room view. A failed
    /// history fetch is only surfaced; the room stays usable and
    /// `load_more` retries it.
    ///
    /// Every entry starts from a fresh viewport pinned to the bottom, also
    /// for rooms that are still cached from an earlier visit.
    pub async fn enter_room(&mut self, room_id: Uuid) -> Result<(), SyncError> {
        if self.active_room_id() == Some(room_id) {
            return Ok(());
        }
        self.leave_room();

        let feed = with_timeout(self.config.subscribe_timeout, self.backend.subscribe_inserts(room_id))
            .await
            .map_err(|source| SyncError::Subscription { room_id, source })
            .map_err(|e| self.surface(e))?;

        let presence = with_timeout(
            self.config.subscribe_timeout,
            presence::join(&self.backend, room_id, self.me.as_ref()),
        )
        .await
        .map_err(|source| SyncError::Subscription { room_id, source })
        .map_err(|e| self.surface(e))?;

        self.store.pin(Some(room_id));
        let state = self.store.entry(room_id);
        state.viewport = Viewport::new();
        let already_loaded = state.is_initialized();

        match history::fetch_page(
            &self.backend,
            room_id,
            0,
            self.config.page_size,
            self.config.history_timeout,
        )
        .await
        {
            Ok(page) if already_loaded => {
                // Catch up on anything that arrived while we were away
                let state = self.store.entry(room_id);
                let caught_up = page
                    .messages
                    .into_iter()
                    .map(|m| state.append(m))
                    .filter(|&added| added)
                    .count();
                debug!(%room_id, caught_up, "re-entered room");
            }
            Ok(page) => {
                let added = history::apply_page(&mut self.store, page);
                debug!(%room_id, added, "seeded room from history");
            }
            Err(e) => {
                self.report(&e);
            }
        }
        self.store.entry(room_id).viewport.mark_ready();

        self.active = Some(ActiveRoom {
            room_id,
            feed,
            presence,
            tracker: PresenceTracker::new(room_id),
        });
        info!(%room_id, "entered room");
        Ok(())
    }

    /// Release the active room's channels. Its state stays cached.
    pub fn leave_room(&mut self) -> Option<Uuid> {
        let active = self.active.take()?;
        let room_id = active.room_id;
        drop(active);
        self.store.pin(None);
        info!(%room_id, "left room");
        Some(room_id)
    }

    /// Drop a room's cached state entirely, leaving it first if active.
    pub fn forget_room(&mut self, room_id: Uuid) -> bool {
        if self.active_room_id() == Some(room_id) {
            self.leave_room();
        }
        self.store.forget(&room_id).is_some()
    }

    // -- History --

    /// Fetch the next older page for the active room. The receipt says how
    /// many messages were new (zero once the room reports nothing more) and
    /// how the view should keep its scroll position.
    pub async fn load_more(&mut self) -> Result<Loaded, SyncError> {
        let room_id = self.active_room_id().ok_or(SyncError::NotInRoom)?;
        let Some(state) = self.store.get(&room_id) else {
            return Err(SyncError::NotInRoom);
        };
        if !state.has_more() {
            return Ok(Loaded {
                added: 0,
                action: ViewportAction::None,
            });
        }
        let page = state.page_cursor();

        let fetched = history::fetch_page(
            &self.backend,
            room_id,
            page,
            self.config.page_size,
            self.config.history_timeout,
        )
        .await
        .map_err(|e| self.surface(e))?;

        let added = history::apply_page(&mut self.store, fetched);
        debug!(%room_id, page, added, "loaded older messages");

        // Page 0 is the initial seed after a failed entry fetch, not older history
        let action = match self.store.get(&room_id) {
            Some(_) if page == 0 => ViewportAction::ScrollToBottom,
            Some(state) => state.viewport().on_older_page(added),
            None => ViewportAction::None,
        };
        Ok(Loaded { added, action })
    }

    // -- Sending --

    /// Show `content` in the active room right away, then persist it in
    /// the background. Blank content is ignored.
    ///
    /// If the write fails the message stays on screen and a
    /// `PersistenceWrite` notice is surfaced from `next_update`.
    pub fn send(&mut self, content: &str) -> Result<Option<Sent>, SyncError> {
        let room_id = self.active_room_id().ok_or(SyncError::NotInRoom)?;
        let me = self.me.as_ref().ok_or(SyncError::NotSignedIn)?;

        let Some(message) = echo::compose(room_id, me, content, Utc::now()) else {
            return Ok(None);
        };
        let message_id = message.id;
        let record = message.record();

        let state = self.store.entry(room_id);
        state.append(message);
        let action = state.viewport.on_arrivals(1);

        echo::spawn_write(&self.backend, record, self.config.write_timeout, self.writes_tx.clone());
        self.pending_writes += 1;
        debug!(%room_id, %message_id, "optimistic message shown");

        Ok(Some(Sent { message_id, action }))
    }

    // -- Viewport input --

    pub fn on_scroll(&mut self, distance_from_bottom: f64) {
        let epsilon = self.config.scroll_epsilon_px;
        if let Some(room_id) = self.active_room_id() {
            self.store.entry(room_id).viewport.on_scroll(distance_from_bottom, epsilon);
        }
    }

    pub fn jump_to_bottom(&mut self) -> ViewportAction {
        match self.active_room_id() {
            Some(room_id) => self.store.entry(room_id).viewport.jump_to_bottom(),
            None => ViewportAction::None,
        }
    }

    // -- Event loop --

    /// Wait for the next change worth showing. Returns `None` when no room
    /// is active and no writes or lookups are outstanding.
    ///
    /// Cancel safe: the only await is on channel receives, and anything
    /// taken off a channel is handled before the next await.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            let incoming = match self.active.as_mut() {
                Some(active) => tokio::select! {
                    raw = active.feed.recv() => Incoming::Feed(raw),
                    raw = recv_optional(&mut active.presence) => Incoming::Presence(raw),
                    Some(outcome) = self.writes_rx.recv() => Incoming::Write(outcome),
                    Some(resolved) = self.resolved_rx.recv() => Incoming::Resolved(resolved),
                },
                None if self.pending_writes + self.pending_lookups > 0 => tokio::select! {
                    Some(outcome) = self.writes_rx.recv() => Incoming::Write(outcome),
                    Some(resolved) = self.resolved_rx.recv() => Incoming::Resolved(resolved),
                    else => return None,
                },
                None => return None,
            };

            if let Some(update) = self.handle(incoming) {
                return Some(update);
            }
        }
    }

    fn handle(&mut self, incoming: Incoming) -> Option<SessionUpdate> {
        match incoming {
            Incoming::Feed(Some(raw)) => {
                self.on_feed_event(&raw);
                None
            }
            Incoming::Feed(None) => {
                let room_id = self.leave_room()?;
                self.report(&SyncError::Subscription {
                    room_id,
                    source: BackendError::ChannelClosed,
                });
                Some(SessionUpdate::RoomClosed { room_id })
            }
            Incoming::Presence(Some(raw)) => self.on_presence_event(&raw),
            Incoming::Presence(None) => {
                let active = self.active.as_mut()?;
                warn!(room_id = %active.room_id, "presence channel closed");
                active.presence = None;
                active.tracker.reset();
                Some(SessionUpdate::Presence {
                    room_id: active.room_id,
                    view: PresenceView::Unknown,
                })
            }
            Incoming::Write(outcome) => self.on_write_outcome(outcome),
            Incoming::Resolved(resolved) => self.on_resolved(resolved),
        }
    }

    fn on_feed_event(&mut self, raw: &str) {
        let Some(room_id) = self.active_room_id() else {
            return;
        };
        let record = match feed::decode(room_id, raw) {
            Ok(FeedEvent::Insert { record }) => record,
            Ok(FeedEvent::PresenceSync { .. }) => {
                debug!(%room_id, "ignoring presence sync on insert feed");
                return;
            }
            Err(rejection) => {
                warn!(%room_id, "dropping feed payload: {}", rejection);
                return;
            }
        };

        if self.store.get(&room_id).is_some_and(|state| state.contains(&record.id)) {
            debug!(%room_id, message_id = %record.id, "live event already shown");
            return;
        }
        feed::spawn_resolve(&self.backend, record, self.config.lookup_timeout, self.resolved_tx.clone());
        self.pending_lookups += 1;
    }

    fn on_resolved(&mut self, resolved: ResolvedInsert) -> Option<SessionUpdate> {
        self.pending_lookups = self.pending_lookups.saturating_sub(1);
        let ResolvedInsert { room_id, result } = resolved;

        let message = match result {
            Ok(message) => message,
            Err(e) => return Some(SessionUpdate::Notice(self.report(&e))),
        };

        let message_id = message.id;
        // A room forgotten while the lookup ran is not brought back
        let Some(state) = self.store.get_mut(&room_id) else {
            debug!(%room_id, %message_id, "room no longer cached, dropping resolved insert");
            return None;
        };
        if !state.append(message) {
            debug!(%room_id, %message_id, "live event already shown");
            return None;
        }
        let action = state.viewport.on_arrivals(1);
        Some(SessionUpdate::Messages {
            room_id,
            added: 1,
            action,
        })
    }

    fn on_presence_event(&mut self, raw: &str) -> Option<SessionUpdate> {
        let active = self.active.as_mut()?;
        let room_id = active.room_id;
        match feed::decode(room_id, raw) {
            Ok(FeedEvent::PresenceSync { state, .. }) => {
                let view = active.tracker.apply_sync(&state).clone();
                Some(SessionUpdate::Presence { room_id, view })
            }
            Ok(FeedEvent::Insert { .. }) => {
                debug!(%room_id, "ignoring insert on presence channel");
                None
            }
            Err(rejection) => {
                warn!(%room_id, "dropping presence payload: {}", rejection);
                None
            }
        }
    }

    fn on_write_outcome(&mut self, outcome: WriteOutcome) -> Option<SessionUpdate> {
        self.pending_writes = self.pending_writes.saturating_sub(1);
        let WriteOutcome {
            room_id,
            message_id,
            result,
        } = outcome;

        match result {
            Ok(()) => {
                debug!(%room_id, %message_id, "message persisted");
                None
            }
            Err(source) => {
                let notice = self.report(&SyncError::PersistenceWrite {
                    room_id,
                    message_id,
                    source,
                });
                Some(SessionUpdate::Notice(notice))
            }
        }
    }

    /// Hand an error to the notification sink and give it back.
    fn surface(&self, err: SyncError) -> SyncError {
        self.report(&err);
        err
    }

    fn report(&self, err: &SyncError) -> Notice {
        let notice = Notice::from(err);
        debug!(kind = %notice.kind, "surfacing: {}", notice.message);
        self.sink.notify(notice.clone());
        notice
    }
}

async fn recv_optional(channel: &mut Option<ChannelHandle>) -> Option<RawEvent> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}
