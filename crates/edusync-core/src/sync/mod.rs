//! Sync manager and its collaborators
//!
//! ## Components
//!
//! - [`SyncManager`]: sync passes, push continuations, remote change feeds
//! - [`ConnectivityMonitor`]: online/offline state, optionally probed
//! - [`EventBus`]: `sync-start`, `sync-complete`, `sync-error`, `online`,
//!   `offline` notifications
//! - [`conflict`]: whole-record resolution policies
//! - [`retry`]: per-record backoff after failed pushes

pub mod conflict;
mod connectivity;
mod events;
mod manager;
mod report;
pub mod retry;

pub use conflict::{ConflictResolution, Resolution};
pub use connectivity::ConnectivityMonitor;
pub use events::{EventBus, EventHandler, EventKind, SyncEvent};
pub use manager::{ManagerStatus, PushOutcome, SyncManager, SyncState};
pub use report::SyncReport;
pub use retry::{Backoff, RetryPolicy};
