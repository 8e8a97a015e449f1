//! Engine error types
//!
//! Local-path failures (store open, missing records) are returned to the
//! caller. Remote-path failures are absorbed into the pending-retry
//! mechanism and only ever reported through logs and `sync-error` events.

use thiserror::Error;

use crate::remote::RemoteError;
use crate::storage::StorageError;

/// Errors surfaced by the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store failed to open; the engine is unusable until `init` succeeds
    #[error("Failed to initialize local store: {0}")]
    Initialization(#[source] StorageError),

    /// Operation attempted before `init` (or after `clear_local_data`)
    #[error("Sync engine is not initialized. Call init() first.")]
    NotInitialized,

    /// No live local record with this id
    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Manual sync requested without connectivity
    #[error("Cannot sync while offline")]
    Offline,

    /// Push or remove against the remote store failed
    #[error("Remote write failed for {path}: {source}")]
    RemoteWrite {
        path: String,
        #[source]
        source: RemoteError,
    },

    /// Pull or change feed from the remote store failed
    #[error("Remote read failed for '{collection}': {source}")]
    RemoteRead {
        collection: String,
        #[source]
        source: RemoteError,
    },

    /// Entity could not be converted to or from a record body
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local store operation failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        SyncError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    /// Remote failures are retried by later sync passes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteWrite { .. } | SyncError::RemoteRead { .. } | SyncError::Offline
        )
    }
}

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;
