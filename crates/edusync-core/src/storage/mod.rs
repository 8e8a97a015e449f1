//! Storage layer
//!
//! Durable local cache of records, one SQLite table per collection.
//!
//! ## Architecture
//!
//! - **SQLite**: source of truth for everything the engine knows locally
//! - **Change feed**: a broadcast of committed mutations for observers
//!
//! The remote store is never consulted from here; reads have predictable
//! latency regardless of connectivity.

pub mod error;
pub mod local;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use local::{ChangeKind, LocalStore, StoreChange};
pub use schema::{school_collections, CollectionSchema, SCHEMA_VERSION};
