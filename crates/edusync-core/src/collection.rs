//! Typed collection handle
//!
//! The application-facing surface for one collection. Writes land in the
//! local store before returning and are pushed to the remote store in the
//! background; reads never leave the device.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::record::{new_record_id, to_fields, with_sync_metadata, Record};
use crate::storage::LocalStore;
use crate::subscription::Subscription;
use crate::sync::{EventKind, SyncManager};

/// Handle on one collection of `T` entities
pub struct Collection<T> {
    name: String,
    manager: SyncManager,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            manager: self.manager.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(name: &str, manager: SyncManager) -> Self {
        Self {
            name: name.to_string(),
            manager,
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store a new entity, returning its id
    ///
    /// The id is returned whether or not the remote push succeeds.
    pub fn create(&self, entity: &T) -> SyncResult<String> {
        let data = to_fields(entity)?;
        let id = new_record_id();
        let record = with_sync_metadata(Record::new(id.clone(), data, Utc::now()), self.clock());

        self.store().put(&self.name, &record)?;
        debug!(collection = %self.name, id = %id, "Created record");

        self.manager.schedule_push(&self.name, &id);
        Ok(id)
    }

    /// Shallow-merge `patch` into an existing entity
    ///
    /// Top-level keys of `patch` replace those of the stored entity. The
    /// merged result must still decode as `T`.
    pub fn update<P: Serialize>(&self, id: &str, patch: &P) -> SyncResult<Record<T>> {
        let patch = to_fields(patch)?;
        let mut record = self.live(id)?;

        for (key, value) in patch {
            record.data.insert(key, value);
        }
        record.updated_at = Utc::now();
        let record = with_sync_metadata(record, self.clock());

        // Reject patches that break the entity before anything is written
        let typed = record.clone().into_typed::<T>()?;
        self.store().put(&self.name, &record)?;
        debug!(collection = %self.name, id, "Updated record");

        self.manager.schedule_push(&self.name, id);
        Ok(typed)
    }

    /// Delete an entity
    ///
    /// The record is tombstoned locally and purged once the remote removal
    /// succeeds.
    pub fn delete(&self, id: &str) -> SyncResult<()> {
        let mut record = self.live(id)?;
        record.tombstone();
        record.updated_at = Utc::now();
        let record = with_sync_metadata(record, self.clock());

        self.store().put(&self.name, &record)?;
        debug!(collection = %self.name, id, "Deleted record");

        self.manager.schedule_push(&self.name, id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> SyncResult<Option<Record<T>>> {
        match self.store().get(&self.name, id)? {
            Some(record) if !record.deleted => Ok(Some(record.into_typed()?)),
            _ => Ok(None),
        }
    }

    /// Every live entity, oldest first
    pub fn get_all(&self) -> SyncResult<Vec<Record<T>>> {
        typed_live(self.store().get_all(&self.name)?)
    }

    /// Entities whose indexed field equals `value`
    pub fn query_by<V: Serialize>(&self, index: &str, value: &V) -> SyncResult<Vec<Record<T>>> {
        let value = serde_json::to_value(value)?;
        typed_live(self.store().query_by_index(&self.name, index, &value)?)
    }

    /// Number of live entities
    pub fn count(&self) -> SyncResult<usize> {
        Ok(self
            .store()
            .get_all(&self.name)?
            .iter()
            .filter(|record| !record.deleted)
            .count())
    }

    /// Observe the collection
    ///
    /// `callback` runs immediately with the current snapshot, then again
    /// after every local change to the collection and after every completed
    /// sync pass.
    pub fn subscribe(
        &self,
        callback: impl Fn(Vec<Record<T>>) + Send + Sync + 'static,
    ) -> SyncResult<Subscription> {
        let callback = Arc::new(callback);
        callback(self.get_all()?);

        let Ok(handle) = Handle::try_current() else {
            warn!(collection = %self.name, "No async runtime; only the initial snapshot is delivered");
            return Ok(Subscription::noop());
        };

        let synced = Arc::new(Notify::new());
        let on_sync = {
            let synced = synced.clone();
            self.manager
                .on(EventKind::SyncComplete, move |_| synced.notify_one())
        };

        let mut changes = self.store().subscribe();
        let collection = self.clone();
        let task = handle.spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) if change.collection != collection.name => continue,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = synced.notified() => {}
                }

                match collection.get_all() {
                    Ok(snapshot) => callback(snapshot),
                    Err(e) => warn!(collection = %collection.name, "Failed to refresh subscriber: {}", e),
                }
            }
        });

        Ok(Subscription::new(move || {
            task.abort();
            drop(on_sync);
        }))
    }

    /// Live record or `NotFound`
    fn live(&self, id: &str) -> SyncResult<Record> {
        match self.store().get(&self.name, id)? {
            Some(record) if !record.deleted => Ok(record),
            _ => Err(SyncError::not_found(&self.name, id)),
        }
    }

    fn store(&self) -> &LocalStore {
        self.manager.store()
    }

    fn clock(&self) -> &crate::record::MonotonicClock {
        self.manager.clock()
    }
}

fn typed_live<T: DeserializeOwned>(records: Vec<Record>) -> SyncResult<Vec<Record<T>>> {
    records
        .into_iter()
        .filter(|record| !record.deleted)
        .map(|record| record.into_typed().map_err(SyncError::from))
        .collect()
}
