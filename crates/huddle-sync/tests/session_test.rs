use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use huddle_db::Database;
use huddle_gateway::Dispatcher;
use huddle_sync::backend::{ChangeFeed, IdentityService, MessageStore, PresenceChannels, RawEvent};
use huddle_sync::viewport::ViewportPhase;
use huddle_sync::{
    Backend, BackendError, ChannelHandle, Loaded, LocalBackend, Notice, NoticeKind, NotificationSink, PresenceView,
    SessionUpdate, SyncConfig, SyncError, SyncSession, ViewportAction,
};
use huddle_types::models::{Author, Message, MessageRecord, PresenceMeta};

#[derive(Default)]
struct CollectingSink(Mutex<Vec<Notice>>);

impl CollectingSink {
    fn kinds(&self) -> Vec<NoticeKind> {
        self.0.lock().unwrap().iter().map(|n| n.kind).collect()
    }
}

impl NotificationSink for CollectingSink {
    fn notify(&self, notice: Notice) {
        self.0.lock().unwrap().push(notice);
    }
}

/// Switches for injecting backend failures at runtime.
#[derive(Default)]
struct Faults {
    history: AtomicBool,
    writes: AtomicBool,
    subscribe: AtomicBool,
    presence: AtomicBool,
    /// Serve the insert feed from a test-owned channel instead of the dispatcher.
    manual_feed: AtomicBool,
}

/// Local backend with switchable failures and delays.
#[derive(Clone)]
struct Faulty {
    inner: LocalBackend,
    faults: Arc<Faults>,
    history_delay: Option<Duration>,
    lookup_delay: Option<Duration>,
    feed_tx: Arc<Mutex<Option<mpsc::UnboundedSender<RawEvent>>>>,
}

impl Faulty {
    fn new(inner: LocalBackend) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
            history_delay: None,
            lookup_delay: None,
            feed_tx: Arc::new(Mutex::new(None)),
        }
    }

    fn with_history_delay(mut self, delay: Duration) -> Self {
        self.history_delay = Some(delay);
        self
    }

    fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = Some(delay);
        self
    }

    fn fail(flag: &AtomicBool) -> Result<(), BackendError> {
        if flag.load(Ordering::SeqCst) {
            Err(BackendError::Storage(anyhow::anyhow!("injected failure")))
        } else {
            Ok(())
        }
    }

    /// Drop the sending side of a manual feed, closing the session's channel.
    fn close_feed(&self) {
        self.feed_tx.lock().unwrap().take();
    }
}

impl MessageStore for Faulty {
    async fn insert_message(&self, record: MessageRecord) -> Result<(), BackendError> {
        Self::fail(&self.faults.writes)?;
        self.inner.insert_message(record).await
    }

    async fn query_messages(&self, room_id: Uuid, from: u32, to: u32) -> Result<Vec<Message>, BackendError> {
        if let Some(delay) = self.history_delay {
            tokio::time::sleep(delay).await;
        }
        Self::fail(&self.faults.history)?;
        self.inner.query_messages(room_id, from, to).await
    }
}

impl ChangeFeed for Faulty {
    async fn subscribe_inserts(&self, room_id: Uuid) -> Result<ChannelHandle, BackendError> {
        Self::fail(&self.faults.subscribe)?;
        if self.faults.manual_feed.load(Ordering::SeqCst) {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.feed_tx.lock().unwrap() = Some(tx);
            return Ok(ChannelHandle::new(room_id, Uuid::new_v4(), rx, || {}));
        }
        self.inner.subscribe_inserts(room_id).await
    }
}

impl PresenceChannels for Faulty {
    async fn join_presence(&self, room_id: Uuid) -> Result<ChannelHandle, BackendError> {
        Self::fail(&self.faults.presence)?;
        self.inner.join_presence(room_id).await
    }

    async fn track(&self, room_id: Uuid, conn_id: Uuid, meta: PresenceMeta) -> Result<(), BackendError> {
        self.inner.track(room_id, conn_id, meta).await
    }
}

impl IdentityService for Faulty {
    async fn current_user(&self) -> Result<Option<Author>, BackendError> {
        self.inner.current_user().await
    }

    async fn lookup_profile(&self, user_id: Uuid) -> Result<Author, BackendError> {
        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.lookup_profile(user_id).await
    }
}

struct World {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl World {
    fn new() -> Self {
        Self {
            db: Arc::new(Database::open_in_memory().unwrap()),
            dispatcher: Dispatcher::new(),
        }
    }

    fn user(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.db.upsert_profile(&id, name, None).unwrap();
        id
    }

    fn anonymous(&self) -> LocalBackend {
        LocalBackend::new(self.db.clone(), self.dispatcher.clone())
    }

    fn backend(&self, user_id: Uuid) -> LocalBackend {
        self.anonymous().signed_in(user_id)
    }

    fn seed(&self, room_id: Uuid, sender_id: Uuid, count: i64) {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        for seq in 0..count {
            let record = MessageRecord {
                id: Uuid::new_v4(),
                room_id,
                sender_id,
                content: format!("message {}", seq),
                created_at: base + chrono::Duration::seconds(seq),
            };
            self.db.insert_message(&record).unwrap();
        }
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        page_size: 50,
        ..SyncConfig::default()
    }
}

async fn session<B: Backend>(backend: B, sink: &Arc<CollectingSink>) -> SyncSession<B> {
    SyncSession::connect(backend, config(), sink.clone()).await
}

/// Collect updates until the session stays quiet for `quiet`.
async fn drain_for<B: Backend>(session: &mut SyncSession<B>, quiet: Duration) -> Vec<SessionUpdate> {
    let mut updates = Vec::new();
    while let Ok(Some(update)) = tokio::time::timeout(quiet, session.next_update()).await {
        updates.push(update);
    }
    updates
}

async fn drain<B: Backend>(session: &mut SyncSession<B>) -> Vec<SessionUpdate> {
    drain_for(session, Duration::from_millis(200)).await
}

fn contents<B: Backend>(session: &SyncSession<B>) -> Vec<String> {
    session
        .active_room()
        .map(|room| room.messages().iter().map(|m| m.content.clone()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn sent_message_is_visible_before_the_write_lands() {
    let world = World::new();
    let ada = world.user("ada");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let mut s = session(world.backend(ada), &sink).await;
    s.enter_room(room).await.unwrap();

    let sent = s.send("  hello  ").unwrap().unwrap();
    assert_eq!(sent.action, ViewportAction::ScrollToBottom);
    assert_eq!(contents(&s), vec!["hello"]);
    assert_eq!(s.pending_writes(), 1);

    // The feed echoes our own insert back; it must not duplicate
    drain(&mut s).await;
    assert_eq!(contents(&s), vec!["hello"]);
    assert_eq!(s.pending_writes(), 0);
    assert!(sink.kinds().is_empty());

    let rows = world.db.get_messages(&room, 0, 10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, sent.message_id.to_string());
}

#[tokio::test]
async fn blank_send_is_ignored() {
    let world = World::new();
    let ada = world.user("ada");
    let sink = Arc::new(CollectingSink::default());

    let mut s = session(world.backend(ada), &sink).await;
    s.enter_room(Uuid::new_v4()).await.unwrap();

    assert!(s.send("   ").unwrap().is_none());
    assert!(contents(&s).is_empty());
    assert_eq!(s.pending_writes(), 0);
}

#[tokio::test]
async fn send_requires_room_and_identity() {
    let world = World::new();
    let ada = world.user("ada");
    let sink = Arc::new(CollectingSink::default());

    let mut s = session(world.backend(ada), &sink).await;
    assert!(matches!(s.send("hi"), Err(SyncError::NotInRoom)));

    let mut anon = session(world.anonymous(), &sink).await;
    assert!(anon.identity().is_none());
    anon.enter_room(Uuid::new_v4()).await.unwrap();
    assert!(matches!(anon.send("hi"), Err(SyncError::NotSignedIn)));
}

#[tokio::test]
async fn live_messages_from_others_arrive() {
    let world = World::new();
    let ada = world.user("ada");
    let bob = world.user("bob");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    let mut b = session(world.backend(bob), &sink).await;
    a.enter_room(room).await.unwrap();
    b.enter_room(room).await.unwrap();

    b.send("hi ada").unwrap();
    drain(&mut b).await;

    let updates = drain(&mut a).await;
    assert!(updates.iter().any(|u| matches!(
        u,
        SessionUpdate::Messages { room_id, added: 1, .. } if *room_id == room
    )));
    assert_eq!(contents(&a), vec!["hi ada"]);
    assert_eq!(a.active_room().unwrap().messages()[0].author.display_name, "bob");
}

#[tokio::test]
async fn left_room_receives_nothing() {
    let world = World::new();
    let ada = world.user("ada");
    let bob = world.user("bob");
    let r = Uuid::new_v4();
    let s_room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    a.enter_room(r).await.unwrap();
    a.enter_room(s_room).await.unwrap();
    assert_eq!(a.active_room_id(), Some(s_room));
    assert_eq!(world.dispatcher.feed_subscriber_count(r), 0);

    let mut b = session(world.backend(bob), &sink).await;
    b.enter_room(r).await.unwrap();
    b.send("only for r").unwrap();
    drain(&mut b).await;

    drain(&mut a).await;
    assert!(contents(&a).is_empty());
    assert!(a.room(&r).unwrap().is_empty());
}

#[tokio::test]
async fn entering_the_active_room_again_is_a_no_op() {
    let world = World::new();
    let ada = world.user("ada");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    a.enter_room(room).await.unwrap();
    a.enter_room(room).await.unwrap();
    assert_eq!(world.dispatcher.feed_subscriber_count(room), 1);

    assert_eq!(a.leave_room(), Some(room));
    assert_eq!(world.dispatcher.feed_subscriber_count(room), 0);
    assert_eq!(a.leave_room(), None);
}

#[tokio::test]
async fn pages_extend_history_backwards() {
    let world = World::new();
    let ada = world.user("ada");
    let room = Uuid::new_v4();
    world.seed(room, ada, 120);
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    a.enter_room(room).await.unwrap();

    let state = a.active_room().unwrap();
    assert_eq!(state.len(), 51);
    assert!(state.has_more());
    assert_eq!(state.newest().unwrap().content, "message 119");
    let first_oldest = state.oldest().unwrap().created_at;

    let preserved = |added| Loaded {
        added,
        action: ViewportAction::PreservePosition,
    };

    assert_eq!(a.load_more().await.unwrap(), preserved(51));
    let state = a.active_room().unwrap();
    assert!(state.oldest().unwrap().created_at < first_oldest);
    assert!(state.has_more());

    // The last window overlaps one already-known row
    assert_eq!(a.load_more().await.unwrap(), preserved(18));
    let state = a.active_room().unwrap();
    assert_eq!(state.len(), 120);
    assert!(!state.has_more());
    assert_eq!(state.oldest().unwrap().content, "message 0");

    assert_eq!(
        a.load_more().await.unwrap(),
        Loaded {
            added: 0,
            action: ViewportAction::None,
        }
    );

    let messages = a.active_room().unwrap().messages();
    assert!(messages.windows(2).all(|w| w[0].order_key() < w[1].order_key()));
}

#[tokio::test]
async fn message_with_unknown_author_is_dropped() {
    let world = World::new();
    let ada = world.user("ada");
    let ghost = Uuid::new_v4();
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    a.enter_room(room).await.unwrap();

    let record = MessageRecord {
        id: Uuid::new_v4(),
        room_id: room,
        sender_id: ghost,
        content: "boo".into(),
        created_at: Utc::now(),
    };
    world.anonymous().insert_message(record).await.unwrap();

    let updates = drain(&mut a).await;
    assert!(updates.iter().any(|u| matches!(u, SessionUpdate::Notice(n) if n.kind == NoticeKind::AuthorLookup)));
    assert!(contents(&a).is_empty());
    assert_eq!(sink.kinds(), vec![NoticeKind::AuthorLookup]);
}

#[tokio::test]
async fn failed_write_keeps_the_optimistic_message() {
    let world = World::new();
    let ada = world.user("ada");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let backend = Faulty::new(world.backend(ada));
    backend.faults.writes.store(true, Ordering::SeqCst);
    let mut a = session(backend, &sink).await;
    a.enter_room(room).await.unwrap();
    let sent = a.send("unsaved").unwrap().unwrap();

    let updates = drain(&mut a).await;
    assert!(updates.iter().any(|u| matches!(u, SessionUpdate::Notice(n) if n.kind == NoticeKind::PersistenceWrite)));
    assert_eq!(contents(&a), vec!["unsaved"]);
    assert!(a.active_room().unwrap().contains(&sent.message_id));
    assert_eq!(a.pending_writes(), 0);
    assert!(world.db.get_messages(&room, 0, 10).unwrap().is_empty());
}

#[tokio::test]
async fn presence_counts_distinct_participants() {
    let world = World::new();
    let ada = world.user("ada");
    let bob = world.user("bob");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    a.enter_room(room).await.unwrap();
    drain(&mut a).await;
    assert_eq!(a.presence(), PresenceView::Online(1));

    // A second tab for ada does not change the count
    let mut a2 = session(world.backend(ada), &sink).await;
    a2.enter_room(room).await.unwrap();
    let mut b = session(world.backend(bob), &sink).await;
    b.enter_room(room).await.unwrap();

    drain(&mut a).await;
    assert_eq!(a.presence(), PresenceView::Online(2));

    drop(b);
    drain(&mut a).await;
    assert_eq!(a.presence(), PresenceView::Online(1));
}

#[tokio::test]
async fn presence_unknown_without_identity() {
    let world = World::new();
    let sink = Arc::new(CollectingSink::default());

    let mut anon = session(world.anonymous(), &sink).await;
    anon.enter_room(Uuid::new_v4()).await.unwrap();
    drain(&mut anon).await;
    assert_eq!(anon.presence(), PresenceView::Unknown);
}

#[tokio::test]
async fn arrivals_count_as_unread_while_scrolled_up() {
    let world = World::new();
    let ada = world.user("ada");
    let bob = world.user("bob");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    let mut b = session(world.backend(bob), &sink).await;
    a.enter_room(room).await.unwrap();
    b.enter_room(room).await.unwrap();

    a.on_scroll(500.0);
    b.send("one").unwrap();
    b.send("two").unwrap();
    drain(&mut b).await;

    let updates = drain(&mut a).await;
    let actions: Vec<ViewportAction> = updates
        .iter()
        .filter_map(|u| match u {
            SessionUpdate::Messages { action, .. } => Some(*action),
            _ => None,
        })
        .collect();
    assert_eq!(actions, vec![ViewportAction::None, ViewportAction::None]);
    assert_eq!(a.active_room().unwrap().viewport().unread_count(), 2);

    assert_eq!(a.jump_to_bottom(), ViewportAction::ScrollToBottom);
    assert_eq!(a.active_room().unwrap().viewport().unread_count(), 0);
}

#[tokio::test]
async fn re_entering_a_room_catches_up() {
    let world = World::new();
    let ada = world.user("ada");
    let bob = world.user("bob");
    let room = Uuid::new_v4();
    let other = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    a.enter_room(room).await.unwrap();
    a.send("before").unwrap();
    drain(&mut a).await;
    a.enter_room(other).await.unwrap();

    let mut b = session(world.backend(bob), &sink).await;
    b.enter_room(room).await.unwrap();
    b.send("while away").unwrap();
    drain(&mut b).await;

    a.enter_room(room).await.unwrap();
    assert_eq!(contents(&a), vec!["before", "while away"]);
}

#[tokio::test]
async fn forgetting_a_room_drops_its_state() {
    let world = World::new();
    let ada = world.user("ada");
    let room = Uuid::new_v4();
    world.seed(room, ada, 3);
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    a.enter_room(room).await.unwrap();
    assert_eq!(a.cached_rooms(), 1);

    assert!(a.forget_room(room));
    assert_eq!(a.active_room_id(), None);
    assert!(a.room(&room).is_none());
    assert!(a.next_update().await.is_none());
}

#[tokio::test]
async fn dropped_poll_does_not_lose_a_live_message() {
    let world = World::new();
    let ada = world.user("ada");
    let bob = world.user("bob");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let backend = Faulty::new(world.backend(ada)).with_lookup_delay(Duration::from_millis(300));
    let mut a = session(backend, &sink).await;
    a.enter_room(room).await.unwrap();
    drain(&mut a).await;

    let record = MessageRecord {
        id: Uuid::new_v4(),
        room_id: room,
        sender_id: bob,
        content: "from bob".into(),
        created_at: Utc::now(),
    };
    world.anonymous().insert_message(record).await.unwrap();

    // Give up on the poll while the author lookup is still running
    let early = tokio::time::timeout(Duration::from_millis(50), a.next_update()).await;
    assert!(early.is_err());
    assert_eq!(a.pending_lookups(), 1);

    drain_for(&mut a, Duration::from_millis(800)).await;
    assert_eq!(contents(&a), vec!["from bob"]);
    assert_eq!(a.pending_lookups(), 0);
}

#[tokio::test]
async fn failed_history_on_entry_is_retried_by_load_more() {
    let world = World::new();
    let ada = world.user("ada");
    let room = Uuid::new_v4();
    world.seed(room, ada, 3);
    let sink = Arc::new(CollectingSink::default());

    let backend = Faulty::new(world.backend(ada));
    backend.faults.history.store(true, Ordering::SeqCst);
    let mut a = session(backend.clone(), &sink).await;

    a.enter_room(room).await.unwrap();
    assert_eq!(a.active_room_id(), Some(room));
    assert_eq!(sink.kinds(), vec![NoticeKind::HistoryFetch]);
    let state = a.active_room().unwrap();
    assert!(state.is_empty());
    assert!(state.has_more());
    assert_eq!(state.page_cursor(), 0);

    assert!(matches!(
        a.load_more().await,
        Err(SyncError::HistoryFetch { page: 0, .. })
    ));
    assert!(a.active_room().unwrap().is_empty());

    backend.faults.history.store(false, Ordering::SeqCst);
    assert_eq!(
        a.load_more().await.unwrap(),
        Loaded {
            added: 3,
            action: ViewportAction::ScrollToBottom,
        }
    );
    assert_eq!(contents(&a), vec!["message 0", "message 1", "message 2"]);
    assert!(!a.active_room().unwrap().has_more());
}

#[tokio::test]
async fn slow_history_times_out() {
    let world = World::new();
    let ada = world.user("ada");
    let sink = Arc::new(CollectingSink::default());
    let limit = Duration::from_millis(50);

    let backend = Faulty::new(world.backend(ada)).with_history_delay(Duration::from_millis(300));
    let config = SyncConfig {
        history_timeout: limit,
        ..config()
    };
    let mut a = SyncSession::connect(backend, config, sink.clone()).await;

    a.enter_room(Uuid::new_v4()).await.unwrap();
    assert_eq!(sink.kinds(), vec![NoticeKind::HistoryFetch]);

    match a.load_more().await {
        Err(SyncError::HistoryFetch {
            source: BackendError::Timeout(elapsed),
            ..
        }) => assert_eq!(elapsed, limit),
        other => panic!("expected a history timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn failed_feed_subscription_fails_entry() {
    let world = World::new();
    let ada = world.user("ada");
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let backend = Faulty::new(world.backend(ada));
    let mut a = session(backend.clone(), &sink).await;
    a.enter_room(first).await.unwrap();

    backend.faults.subscribe.store(true, Ordering::SeqCst);
    match a.enter_room(second).await {
        Err(SyncError::Subscription { room_id, .. }) => assert_eq!(room_id, second),
        other => panic!("expected a subscription error, got {:?}", other),
    }

    assert_eq!(a.active_room_id(), None);
    assert_eq!(world.dispatcher.feed_subscriber_count(first), 0);
    assert!(world.dispatcher.presence_state(first).0.is_empty());
    assert_eq!(sink.kinds(), vec![NoticeKind::Subscription]);
}

#[tokio::test]
async fn failed_presence_join_releases_the_feed() {
    let world = World::new();
    let ada = world.user("ada");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let backend = Faulty::new(world.backend(ada));
    backend.faults.presence.store(true, Ordering::SeqCst);
    let mut a = session(backend, &sink).await;

    assert!(matches!(
        a.enter_room(room).await,
        Err(SyncError::Subscription { .. })
    ));
    assert_eq!(a.active_room_id(), None);
    assert_eq!(world.dispatcher.feed_subscriber_count(room), 0);
}

#[tokio::test]
async fn closed_feed_leaves_the_room() {
    let world = World::new();
    let ada = world.user("ada");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let backend = Faulty::new(world.backend(ada));
    backend.faults.manual_feed.store(true, Ordering::SeqCst);
    let mut a = session(backend.clone(), &sink).await;
    a.enter_room(room).await.unwrap();

    backend.close_feed();
    let updates = drain(&mut a).await;
    assert!(updates.contains(&SessionUpdate::RoomClosed { room_id: room }));
    assert_eq!(a.active_room_id(), None);
    assert!(world.dispatcher.presence_state(room).0.is_empty());
    assert_eq!(sink.kinds(), vec![NoticeKind::Subscription]);
}

#[tokio::test]
async fn re_entering_starts_with_a_fresh_viewport() {
    let world = World::new();
    let ada = world.user("ada");
    let bob = world.user("bob");
    let room = Uuid::new_v4();
    let sink = Arc::new(CollectingSink::default());

    let mut a = session(world.backend(ada), &sink).await;
    let mut b = session(world.backend(bob), &sink).await;
    a.enter_room(room).await.unwrap();
    b.enter_room(room).await.unwrap();

    a.on_scroll(500.0);
    b.send("missed").unwrap();
    drain(&mut b).await;
    drain(&mut a).await;
    assert_eq!(a.active_room().unwrap().viewport().unread_count(), 1);

    a.enter_room(Uuid::new_v4()).await.unwrap();
    a.enter_room(room).await.unwrap();

    let viewport = a.active_room().unwrap().viewport();
    assert_eq!(viewport.phase(), ViewportPhase::Ready);
    assert!(!viewport.user_scrolled_up());
    assert_eq!(viewport.unread_count(), 0);
}
