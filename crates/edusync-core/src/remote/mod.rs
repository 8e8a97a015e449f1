//! Remote adapter
//!
//! Isolates all knowledge of the authoritative store. The rest of the engine
//! sees an opaque keyed document store addressed by `{collection}/{id}` with
//! point writes, point removals, a full collection read and a change feed.
//!
//! ## Implementations
//!
//! - [`MemoryRemote`]: in-process store, also the backing table of the server
//! - [`WsRemote`]: WebSocket client for [`server::serve`]

mod client;
mod memory;
pub mod message;
pub mod server;
pub mod transform;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{Fields, Record};
use crate::subscription::Subscription;

pub use client::WsRemote;
pub use memory::MemoryRemote;
pub use transform::{from_remote, parse_path, remote_path, to_remote};

/// Errors from the remote store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// No network path to the remote store
    #[error("Remote store is unavailable")]
    Unavailable,

    /// Request sent but not answered in time
    #[error("Remote request timed out after {0:?}")]
    Timeout(Duration),

    /// Remote refused the request (permission, validation)
    #[error("Remote store rejected the request: {0}")]
    Rejected(String),

    /// Unexpected or undecodable message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection-level failure
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// A record as the remote store holds it
///
/// Engine bookkeeping (`syncStatus`, `lastSyncedAt`, `_deleted`) never leaves
/// the device; `modifiedAt` carries the writer's `local_updated_at` for
/// conflict comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    pub id: String,
    #[serde(flatten)]
    pub fields: Fields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub modified_at: i64,
}

/// A change observed on the remote store
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub collection: String,
    pub id: String,
    /// `None` when the document was removed
    pub document: Option<RemoteDocument>,
}

/// Callback invoked for every remote change in a subscribed collection
pub type ChangeHandler = Arc<dyn Fn(RemoteChange) + Send + Sync>;

/// Transport to the authoritative store
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    /// Full replace of `{collection}/{doc.id}`
    async fn set(&self, collection: &str, doc: RemoteDocument) -> RemoteResult<()>;

    /// Remove `{collection}/{id}`; removing a missing document succeeds
    async fn remove(&self, collection: &str, id: &str) -> RemoteResult<()>;

    /// Every document currently in the collection
    async fn fetch_all(&self, collection: &str) -> RemoteResult<Vec<RemoteDocument>>;

    /// Register `handler` for changes to the collection
    async fn subscribe(&self, collection: &str, handler: ChangeHandler)
        -> RemoteResult<Subscription>;

    /// Cheap reachability check
    async fn ping(&self) -> RemoteResult<()>;

    /// Write a local record to the remote store
    ///
    /// Tombstones become removals, everything else a full replace of the
    /// transformed record. Replaying the same push yields the same state.
    async fn push(&self, collection: &str, id: &str, record: &Record) -> RemoteResult<()> {
        if record.deleted {
            self.remove(collection, id).await
        } else {
            self.set(collection, to_remote(record)).await
        }
    }
}
