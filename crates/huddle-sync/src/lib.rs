//! Client-side conversation sync: room history, live inserts, optimistic
//! sends and presence, reconciled into one ordered list per room.

pub mod backend;
pub mod config;
pub mod echo;
pub mod error;
pub mod feed;
pub mod history;
pub mod local;
pub mod notify;
pub mod presence;
pub mod session;
pub mod store;
pub mod viewport;

pub use backend::{Backend, ChannelHandle};
pub use config::SyncConfig;
pub use error::{BackendError, SyncError};
pub use local::LocalBackend;
pub use notify::{Notice, NoticeKind, NotificationSink, NullSink, TracingSink};
pub use presence::PresenceView;
pub use session::{Loaded, SessionUpdate, Sent, SyncSession};
pub use viewport::ViewportAction;
