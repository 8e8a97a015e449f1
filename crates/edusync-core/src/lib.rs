//! EduSync Core Library
//!
//! Offline-first synchronization engine for the EduSync school dashboard.
//! Every read and write goes to a local SQLite store first; a background
//! sync manager reconciles it with a remote document store whenever the
//! network allows.
//!
//! # Architecture
//!
//! - **LocalStore**: SQLite tables per collection, the source of truth for reads
//! - **RemoteAdapter**: document store behind `collection/id` paths
//!   (WebSocket client, or in-memory for tests)
//! - **SyncManager**: pull-then-push passes, conflict resolution, retries
//! - **ConnectivityMonitor**: online/offline transitions that drive sync
//!
//! # Quick Start
//!
//! ```text
//! let engine = SyncEngine::new(EngineConfig::from_config(&config), remote);
//! engine.init()?;
//!
//! let students = engine.entities::<Student>()?;
//! let id = students.create(&Student::new("Ada").in_class(&class_id))?;
//! let class = students.query_by("classId", &class_id)?;
//! ```
//!
//! # Modules
//!
//! - `engine`: lifecycle entry point (main entry point)
//! - `collection`: typed CRUD, queries and live subscriptions
//! - `record`: record envelope and sync metadata
//! - `storage`: SQLite local store
//! - `remote`: remote adapters and the WebSocket protocol
//! - `sync`: sync manager, conflict policy, connectivity and events
//! - `models`: school dashboard entities
//! - `config`: application configuration

pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod record;
pub mod remote;
pub mod storage;
pub mod subscription;
pub mod sync;

pub use collection::Collection;
pub use config::{Config, SyncConfig};
pub use engine::{EngineConfig, EngineStatus, StoreLocation, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use models::Entity;
pub use record::{Fields, MonotonicClock, Record, SyncStatus};
pub use remote::{MemoryRemote, RemoteAdapter, RemoteError, WsRemote};
pub use storage::{CollectionSchema, LocalStore, StorageError};
pub use subscription::Subscription;
pub use sync::{
    ConflictResolution, ConnectivityMonitor, EventKind, SyncEvent, SyncManager, SyncReport,
    SyncState,
};
