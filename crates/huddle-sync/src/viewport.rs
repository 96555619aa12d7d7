/// What the view should do with its scroll position after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportAction {
    None,
    ScrollToBottom,
    /// Content was added above; keep the visible messages where they are.
    PreservePosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportPhase {
    Loading,
    Ready,
}

/// Auto-scroll and unread bookkeeping for one room.
#[derive(Debug, Clone)]
pub struct Viewport {
    phase: ViewportPhase,
    user_scrolled_up: bool,
    unread_count: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new()
    }
}

impl Viewport {
    pub fn new() -> Self {
        Self {
            phase: ViewportPhase::Loading,
            user_scrolled_up: false,
            unread_count: 0,
        }
    }

    pub fn phase(&self) -> ViewportPhase {
        self.phase
    }

    pub fn user_scrolled_up(&self) -> bool {
        self.user_scrolled_up
    }

    pub fn unread_count(&self) -> u32 {
        self.unread_count
    }

    /// Initial history is in place.
    pub fn mark_ready(&mut self) -> ViewportAction {
        if self.phase == ViewportPhase::Ready {
            return ViewportAction::None;
        }
        self.phase = ViewportPhase::Ready;
        if self.user_scrolled_up {
            ViewportAction::None
        } else {
            ViewportAction::ScrollToBottom
        }
    }

    /// `count` new messages landed at the bottom of the list.
    pub fn on_arrivals(&mut self, count: usize) -> ViewportAction {
        if count == 0 || self.phase == ViewportPhase::Loading {
            return ViewportAction::None;
        }
        if self.user_scrolled_up {
            self.unread_count = self.unread_count.saturating_add(count as u32);
            ViewportAction::None
        } else {
            ViewportAction::ScrollToBottom
        }
    }

    /// Older messages were prepended.
    pub fn on_older_page(&self, count: usize) -> ViewportAction {
        if count == 0 {
            ViewportAction::None
        } else {
            ViewportAction::PreservePosition
        }
    }

    /// User scroll input. `distance_from_bottom` is in pixels.
    pub fn on_scroll(&mut self, distance_from_bottom: f64, epsilon: f64) {
        if distance_from_bottom <= epsilon {
            self.reset();
        } else {
            self.user_scrolled_up = true;
        }
    }

    pub fn jump_to_bottom(&mut self) -> ViewportAction {
        self.reset();
        ViewportAction::ScrollToBottom
    }

    fn reset(&mut self) {
        self.user_scrolled_up = false;
        self.unread_count = 0;
    }
}
