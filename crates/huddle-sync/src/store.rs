//! Per-room message lists and the bounded cache that holds them.
//!
//! Every producer (history, live feed, optimistic echo) goes through the
//! operations here. `append` and `append_page` never admit a second entry
//! with an id the room already holds.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use huddle_types::models::Message;

use crate::viewport::Viewport;

pub struct RoomState {
    room_id: Uuid,
    /// Ascending by `(created_at, id)`.
    messages: Vec<Message>,
    ids: HashSet<Uuid>,
    page_cursor: u32,
    has_more: bool,
    initialized: bool,
    pub(crate) viewport: Viewport,
}

impl RoomState {
    pub fn new(room_id: Uuid) -> Self {
        Self {
            room_id,
            messages: Vec::new(),
            ids: HashSet::new(),
            page_cursor: 0,
            has_more: true,
            initialized: false,
            viewport: Viewport::new(),
        }
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    /// Number of history pages fetched so far.
    pub fn page_cursor(&self) -> u32 {
        self.page_cursor
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Seed the room with its first history page. Entries already present
    /// are kept; the batch is merged around them.
    pub fn initialize(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.append(message);
        }
        self.initialized = true;
    }

    /// Idempotent merge of one message. Returns false if the id was
    /// already present, in which case nothing changes.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let key = message.order_key();
        let pos = self.messages.partition_point(|m| m.order_key() <= key);
        self.messages.insert(pos, message);
        true
    }

    /// Merge an ascending batch of older messages in front of the current
    /// earliest entry. Returns how many were new.
    pub fn append_page(&mut self, older: Vec<Message>) -> usize {
        let mut fresh = Vec::with_capacity(older.len());
        for message in older {
            if self.ids.insert(message.id) {
                fresh.push(message);
            }
        }
        let added = fresh.len();

        let fits_in_front = match (fresh.last(), self.messages.first()) {
            (Some(last), Some(first)) => last.order_key() <= first.order_key(),
            _ => true,
        };
        let sorted = fresh.windows(2).all(|w| w[0].order_key() <= w[1].order_key());

        if fits_in_front && sorted {
            self.messages.splice(0..0, fresh);
        } else {
            debug!(room_id = %self.room_id, "older page overlaps current list, merging in order");
            for message in fresh {
                let key = message.order_key();
                let pos = self.messages.partition_point(|m| m.order_key() <= key);
                self.messages.insert(pos, message);
            }
        }
        added
    }

    pub fn set_has_more(&mut self, has_more: bool) {
        self.has_more = has_more;
    }

    pub fn set_page_cursor(&mut self, pages: u32) {
        self.page_cursor = pages;
    }
}

struct Slot {
    state: RoomState,
    last_used: u64,
}

/// Bounded room cache: an arena of room states plus an id index. When full,
/// the least recently used room that is not pinned is evicted.
pub struct RoomStore {
    capacity: usize,
    slots: Vec<Slot>,
    index: HashMap<Uuid, usize>,
    clock: u64,
    pinned: Option<Uuid>,
}

impl RoomStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: Vec::new(),
            index: HashMap::new(),
            clock: 0,
            pinned: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, room_id: &Uuid) -> bool {
        self.index.contains_key(room_id)
    }

    /// Protect one room (the one on screen) from eviction.
    pub fn pin(&mut self, room_id: Option<Uuid>) {
        self.pinned = room_id;
    }

    pub fn get(&self, room_id: &Uuid) -> Option<&RoomState> {
        self.index.get(room_id).map(|&idx| &self.slots[idx].state)
    }

    pub fn get_mut(&mut self, room_id: &Uuid) -> Option<&mut RoomState> {
        let idx = *self.index.get(room_id)?;
        self.clock += 1;
        let slot = &mut self.slots[idx];
        slot.last_used = self.clock;
        Some(&mut slot.state)
    }

    /// Get a room's state, creating it (and evicting if full) when absent.
    pub fn entry(&mut self, room_id: Uuid) -> &mut RoomState {
        self.clock += 1;
        let idx = match self.index.get(&room_id) {
            Some(&idx) => idx,
            None => {
                while self.slots.len() >= self.capacity && self.evict_lru() {}
                if self.slots.len() >= self.capacity {
                    debug!(%room_id, "room cache full of pinned rooms, growing");
                }
                self.slots.push(Slot {
                    state: RoomState::new(room_id),
                    last_used: 0,
                });
                let idx = self.slots.len() - 1;
                self.index.insert(room_id, idx);
                idx
            }
        };
        let slot = &mut self.slots[idx];
        slot.last_used = self.clock;
        &mut slot.state
    }

    /// Explicitly drop a room's state.
    pub fn forget(&mut self, room_id: &Uuid) -> Option<RoomState> {
        let idx = self.index.remove(room_id)?;
        let slot = self.slots.swap_remove(idx);
        if let Some(moved) = self.slots.get(idx) {
            self.index.insert(moved.state.room_id, idx);
        }
        if self.pinned == Some(*room_id) {
            self.pinned = None;
        }
        Some(slot.state)
    }

    fn evict_lru(&mut self) -> bool {
        let victim = self
            .slots
            .iter()
            .filter(|slot| Some(slot.state.room_id) != self.pinned)
            .min_by_key(|slot| slot.last_used)
            .map(|slot| slot.state.room_id);

        match victim {
            Some(room_id) => {
                self.forget(&room_id);
                debug!(%room_id, "evicted least recently used room");
                true
            }
            None => false,
        }
    }

    // -- Idempotent store operations, addressed by room --

    pub fn initialize(&mut self, room_id: Uuid, messages: Vec<Message>) {
        self.entry(room_id).initialize(messages);
    }

    pub fn append(&mut self, room_id: Uuid, message: Message) -> bool {
        self.entry(room_id).append(message)
    }

    pub fn append_page(&mut self, room_id: Uuid, older: Vec<Message>) -> usize {
        self.entry(room_id).append_page(older)
    }

    pub fn set_has_more(&mut self, room_id: Uuid, has_more: bool) {
        self.entry(room_id).set_has_more(has_more);
    }

    pub fn set_page_cursor(&mut self, room_id: Uuid, pages: u32) {
        self.entry(room_id).set_page_cursor(pages);
    }
}
