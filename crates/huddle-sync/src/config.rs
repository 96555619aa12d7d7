use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Upper bound for `page_size`, so history windows stay well inside `u32`.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Engine tuning knobs. `Default` matches the documented defaults;
/// `from_env` overlays `HUDDLE_*` variables on top.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// History page size L.
    pub page_size: u32,
    pub history_timeout: Duration,
    pub write_timeout: Duration,
    pub lookup_timeout: Duration,
    pub subscribe_timeout: Duration,
    /// Maximum number of rooms whose state is cached.
    pub room_capacity: usize,
    /// Distance from the bottom (px) still treated as "at bottom".
    pub scroll_epsilon_px: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            history_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            lookup_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(10),
            room_capacity: 32,
            scroll_epsilon_px: 10.0,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_size: env_or("HUDDLE_PAGE_SIZE", defaults.page_size).clamp(1, MAX_PAGE_SIZE),
            history_timeout: env_millis("HUDDLE_HISTORY_TIMEOUT_MS", defaults.history_timeout),
            write_timeout: env_millis("HUDDLE_WRITE_TIMEOUT_MS", defaults.write_timeout),
            lookup_timeout: env_millis("HUDDLE_LOOKUP_TIMEOUT_MS", defaults.lookup_timeout),
            subscribe_timeout: env_millis("HUDDLE_SUBSCRIBE_TIMEOUT_MS", defaults.subscribe_timeout),
            room_capacity: env_or("HUDDLE_ROOM_CAPACITY", defaults.room_capacity).max(1),
            scroll_epsilon_px: env_or("HUDDLE_SCROLL_EPSILON_PX", defaults.scroll_epsilon_px),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}
