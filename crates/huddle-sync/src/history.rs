//! Paginated history fetches.
//!
//! Page 0 covers offsets `[0, L]`, page `k > 0` covers `[k*L + 1, k*L + 1 + L]`.
//! Both ranges are inclusive. Page 0 is one row wider than later pages, and
//! from page 2 onwards consecutive windows share a boundary row; the store's
//! id check absorbs that overlap.

use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use huddle_types::models::Message;

use crate::backend::{MessageStore, with_timeout};
use crate::error::SyncError;
use crate::store::RoomStore;

/// One fetched window, already in ascending order.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub room_id: Uuid,
    pub page: u32,
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Inclusive `(from, to)` offsets for a page.
pub fn page_window(page: u32, page_size: u32) -> (u32, u32) {
    if page == 0 {
        (0, page_size)
    } else {
        let from = page.saturating_mul(page_size).saturating_add(1);
        (from, from.saturating_add(page_size))
    }
}

pub async fn fetch_page<S: MessageStore>(
    store: &S,
    room_id: Uuid,
    page: u32,
    page_size: u32,
    timeout: Duration,
) -> Result<HistoryPage, SyncError> {
    let (from, to) = page_window(page, page_size);
    debug!(%room_id, page, from, to, "fetching history page");

    let mut messages = with_timeout(timeout, store.query_messages(room_id, from, to))
        .await
        .map_err(|source| SyncError::HistoryFetch {
            room_id,
            page,
            source,
        })?;

    // Rows arrive newest-first
    messages.reverse();
    let has_more = messages.len() >= page_size as usize;

    Ok(HistoryPage {
        room_id,
        page,
        messages,
        has_more,
    })
}

/// Merge a fetched page. Page 0 seeds the room, later pages extend it
/// backwards. Returns how many messages were new.
pub fn apply_page(store: &mut RoomStore, page: HistoryPage) -> usize {
    let HistoryPage {
        room_id,
        page,
        messages,
        has_more,
    } = page;

    let added = if page == 0 {
        let state = store.entry(room_id);
        let before = state.len();
        state.initialize(messages);
        state.len() - before
    } else {
        store.append_page(room_id, messages)
    };

    store.set_has_more(room_id, has_more);
    store.set_page_cursor(room_id, page + 1);
    added
}
