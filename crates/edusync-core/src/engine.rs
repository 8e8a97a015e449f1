//! Sync engine
//!
//! The lifecycle surface a host application drives: initialize once,
//! hand out typed collections, report status, sync on demand and reset on
//! logout. Engines are plain values; a process may run several.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info};

use crate::collection::Collection;
use crate::config::{Config, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::models::Entity;
use crate::record::MonotonicClock;
use crate::remote::RemoteAdapter;
use crate::storage::{school_collections, CollectionSchema, LocalStore, StorageError};
use crate::subscription::Subscription;
use crate::sync::{
    ConnectivityMonitor, EventBus, EventKind, SyncEvent, SyncManager, SyncReport, SyncState,
};

/// Where the local store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    InMemory,
}

/// Everything needed to build an engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store: StoreLocation,
    pub collections: Vec<CollectionSchema>,
    pub sync: SyncConfig,
    /// Connectivity assumed before the first probe
    pub start_online: bool,
    /// Ping the remote store to track connectivity
    pub probe_remote: bool,
}

impl EngineConfig {
    /// On-disk store with the school collections
    pub fn from_config(config: &Config) -> Self {
        Self {
            store: StoreLocation::File(config.sqlite_path()),
            collections: school_collections(),
            sync: config.sync.clone(),
            start_online: true,
            probe_remote: true,
        }
    }

    /// In-memory store with the school collections and no background timers
    pub fn in_memory() -> Self {
        Self {
            store: StoreLocation::InMemory,
            collections: school_collections(),
            sync: SyncConfig {
                auto_sync: false,
                ..SyncConfig::default()
            },
            start_online: true,
            probe_remote: false,
        }
    }

    pub fn with_collection(mut self, schema: CollectionSchema) -> Self {
        self.collections.retain(|existing| existing.name != schema.name);
        self.collections.push(schema);
        self
    }
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub state: SyncState,
    pub online: bool,
    pub initialized: bool,
    /// Records with unconfirmed local changes, across all collections
    pub pending: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub auto_sync: bool,
}

/// Offline-first sync engine
pub struct SyncEngine {
    config: EngineConfig,
    remote: Arc<dyn RemoteAdapter>,
    clock: Arc<MonotonicClock>,
    connectivity: ConnectivityMonitor,
    events: EventBus,
    manager: Mutex<Option<SyncManager>>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, remote: Arc<dyn RemoteAdapter>) -> Self {
        let connectivity = ConnectivityMonitor::new(config.start_online);
        Self {
            config,
            remote,
            clock: Arc::new(MonotonicClock::new()),
            connectivity,
            events: EventBus::new(),
            manager: Mutex::new(None),
        }
    }

    /// Open the local store and start background sync
    ///
    /// Must precede every other operation. Calling it again is a no-op.
    pub fn init(&self) -> SyncResult<()> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Ok(());
        }

        let store = self.open_store().map_err(|e| {
            error!("Failed to open local store: {}", e);
            SyncError::Initialization(e)
        })?;

        let manager = SyncManager::new(
            store,
            self.remote.clone(),
            self.clock.clone(),
            self.connectivity.clone(),
            self.events.clone(),
            self.config.sync.clone(),
        );
        manager.start(self.config.probe_remote);
        *slot = Some(manager);

        info!(
            collections = self.config.collections.len(),
            online = self.connectivity.is_online(),
            "Sync engine initialized"
        );
        Ok(())
    }

    fn open_store(&self) -> Result<LocalStore, StorageError> {
        match &self.config.store {
            StoreLocation::File(path) => LocalStore::open(path, &self.config.collections),
            StoreLocation::InMemory => LocalStore::open_in_memory(&self.config.collections),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.slot().is_some()
    }

    pub fn status(&self) -> EngineStatus {
        let online = self.connectivity.is_online();
        let Some(manager) = self.slot().clone() else {
            return EngineStatus {
                state: SyncState::Idle,
                online,
                initialized: false,
                pending: 0,
                last_sync_at: None,
                last_error: None,
                auto_sync: false,
            };
        };

        let pending = manager
            .store()
            .collections()
            .iter()
            .filter_map(|collection| manager.store().pending_count(collection).ok())
            .map(|count| count.max(0) as u64)
            .sum();
        let status = manager.status();

        EngineStatus {
            state: status.state,
            online,
            initialized: true,
            pending,
            last_sync_at: status.last_sync_at,
            last_error: status.last_error,
            auto_sync: status.auto_sync,
        }
    }

    /// Run a full pass now, retrying records that are backing off
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        let manager = self.manager()?;
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        manager.sync_now().await
    }

    /// Wipe the local store and start over
    pub fn clear_local_data(&self) -> SyncResult<()> {
        let manager = self.manager()?;
        manager.clear_all_local_data()?;
        *self.slot() = None;
        info!("Local data cleared; reinitializing");
        self.init()
    }

    /// Register a lifecycle event handler
    ///
    /// Handlers survive `clear_local_data`.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.on(kind, handler)
    }

    /// Typed handle on a registered collection
    pub fn collection<T>(&self, name: &str) -> SyncResult<Collection<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let manager = self.manager()?;
        if manager.store().schema(name).is_none() {
            return Err(StorageError::UnknownCollection(name.to_string()).into());
        }
        Ok(Collection::new(name, manager))
    }

    /// Typed handle on an entity's own collection
    pub fn entities<E: Entity>(&self) -> SyncResult<Collection<E>> {
        self.collection(E::COLLECTION)
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// The running sync manager
    pub fn manager(&self) -> SyncResult<SyncManager> {
        self.slot().clone().ok_or(SyncError::NotInitialized)
    }

    /// Wait for background pushes to finish
    pub async fn settle(&self) {
        if let Ok(manager) = self.manager() {
            manager.settle().await;
        }
    }

    /// Stop all background work
    ///
    /// The engine must be initialized again before further use.
    pub fn shutdown(&self) {
        if let Some(manager) = self.slot().take() {
            manager.shutdown();
            info!("Sync engine shut down");
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<SyncManager>> {
        self.manager.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn engine() -> (SyncEngine, MemoryRemote) {
        let remote = MemoryRemote::new();
        let engine = SyncEngine::new(EngineConfig::in_memory(), Arc::new(remote.clone()));
        (engine, remote)
    }

    #[tokio::test]
    async fn test_operations_require_init() {
        let (engine, _remote) = engine();
        assert!(!engine.is_initialized());
        assert!(matches!(
            engine.collection::<Value>("students"),
            Err(SyncError::NotInitialized)
        ));
        assert!(matches!(engine.sync_now().await, Err(SyncError::NotInitialized)));
        assert!(!engine.status().initialized);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let (engine, _remote) = engine();
        engine.init().unwrap();
        engine.init().unwrap();
        assert!(engine.status().initialized);
    }

    #[tokio::test]
    async fn test_init_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            // A directory cannot be opened as a database
            store: StoreLocation::File(dir.path().to_path_buf()),
            ..EngineConfig::in_memory()
        };
        let engine = SyncEngine::new(config, Arc::new(MemoryRemote::new()));

        assert!(matches!(engine.init(), Err(SyncError::Initialization(_))));
        assert!(!engine.is_initialized());
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let (engine, _remote) = engine();
        engine.init().unwrap();
        assert!(matches!(
            engine.collection::<Value>("dragons"),
            Err(SyncError::Storage(StorageError::UnknownCollection(_)))
        ));
    }

    #[tokio::test]
    async fn test_typed_entities() {
        use crate::models::Student;

        let (engine, _remote) = engine();
        engine.connectivity().set_online(false);
        engine.init().unwrap();

        let students = engine.entities::<Student>().unwrap();
        assert_eq!(students.name(), "students");
        let id = students.create(&Student::new("Ada").in_class("c1")).unwrap();

        let found = students.query_by("classId", &"c1").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert_eq!(found[0].data.name, "Ada");
    }

    #[tokio::test]
    async fn test_status_counts_pending() {
        let (engine, _remote) = engine();
        engine.connectivity().set_online(false);
        engine.init().unwrap();

        let students = engine.collection::<Value>("students").unwrap();
        students.create(&json!({"name": "Ada"})).unwrap();
        students.create(&json!({"name": "Bob"})).unwrap();

        let status = engine.status();
        assert_eq!(status.pending, 2);
        assert!(!status.online);
        assert_eq!(status.state, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_sync_now_offline() {
        let (engine, _remote) = engine();
        engine.init().unwrap();
        engine.connectivity().set_online(false);
        assert!(matches!(engine.sync_now().await, Err(SyncError::Offline)));
    }

    #[tokio::test]
    async fn test_clear_local_data_reinitializes() {
        let (engine, _remote) = engine();
        engine.connectivity().set_online(false);
        engine.init().unwrap();
        let students = engine.collection::<Value>("students").unwrap();
        students.create(&json!({"name": "Ada"})).unwrap();

        engine.clear_local_data().unwrap();
        assert!(engine.is_initialized());
        let students = engine.collection::<Value>("students").unwrap();
        assert!(students.get_all().unwrap().is_empty());
        assert_eq!(engine.status().pending, 0);
    }

    #[tokio::test]
    async fn test_on_disk_store_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            store: StoreLocation::File(dir.path().join("edusync.db")),
            start_online: false,
            ..EngineConfig::in_memory()
        };

        let id = {
            let engine = SyncEngine::new(config.clone(), Arc::new(MemoryRemote::new()));
            engine.init().unwrap();
            engine
                .collection::<Value>("teachers")
                .unwrap()
                .create(&json!({"name": "Grace"}))
                .unwrap()
        };

        let engine = SyncEngine::new(config, Arc::new(MemoryRemote::new()));
        engine.init().unwrap();
        let record = engine
            .collection::<Value>("teachers")
            .unwrap()
            .get(&id)
            .unwrap()
            .unwrap();
        assert_eq!(record.data["name"], json!("Grace"));
        assert!(record.is_pending());
    }
}
