//! In-process remote store
//!
//! Behaves like the authoritative store: keyed documents per collection,
//! point writes and a change feed. Availability can be switched off to
//! simulate a severed network path.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::trace;

use super::{ChangeHandler, RemoteAdapter, RemoteChange, RemoteDocument, RemoteError, RemoteResult};
use crate::subscription::Subscription;

type Collections = BTreeMap<String, BTreeMap<String, RemoteDocument>>;

/// Shared in-memory document store
///
/// Clones share the same documents and subscribers.
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

struct Inner {
    docs: Mutex<Collections>,
    handlers: Mutex<HashMap<String, Vec<(u64, ChangeHandler)>>>,
    next_handler_id: AtomicU64,
    available: AtomicBool,
    writes: AtomicU64,
    removes: AtomicU64,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                docs: Mutex::new(BTreeMap::new()),
                handlers: Mutex::new(HashMap::new()),
                next_handler_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
                writes: AtomicU64::new(0),
                removes: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate losing or regaining the network path
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Number of `set` calls accepted so far
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Number of `remove` calls accepted so far
    pub fn remove_count(&self) -> u64 {
        self.inner.removes.load(Ordering::SeqCst)
    }

    /// Current remote copy of `{collection}/{id}`
    pub fn document(&self, collection: &str, id: &str) -> Option<RemoteDocument> {
        self.docs()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Every document in a collection, ordered by id
    pub fn documents(&self, collection: &str) -> Vec<RemoteDocument> {
        self.docs()
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of active change handlers for a collection
    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.handlers()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Write a document, returning whether the stored value changed
    pub fn put_document(&self, collection: &str, doc: RemoteDocument) -> bool {
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        let changed = {
            let mut docs = self.docs();
            let slot = docs.entry(collection.to_string()).or_default();
            match slot.get(&doc.id) {
                Some(existing) if *existing == doc => false,
                _ => {
                    slot.insert(doc.id.clone(), doc.clone());
                    true
                }
            }
        };

        if changed {
            trace!(collection, id = %doc.id, "remote document written");
            self.notify(RemoteChange {
                collection: collection.to_string(),
                id: doc.id.clone(),
                document: Some(doc),
            });
        }
        changed
    }

    /// Remove a document, returning whether it existed
    pub fn remove_document(&self, collection: &str, id: &str) -> bool {
        self.inner.removes.fetch_add(1, Ordering::SeqCst);
        let existed = self
            .docs()
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some();

        if existed {
            trace!(collection, id, "remote document removed");
            self.notify(RemoteChange {
                collection: collection.to_string(),
                id: id.to_string(),
                document: None,
            });
        }
        existed
    }

    /// Register a change handler without the availability check
    pub fn add_handler(&self, collection: &str, handler: ChangeHandler) -> Subscription {
        let handler_id = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers()
            .entry(collection.to_string())
            .or_default()
            .push((handler_id, handler));

        let inner = Arc::downgrade(&self.inner);
        let collection = collection.to_string();
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut handlers = inner
                    .handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(list) = handlers.get_mut(&collection) {
                    list.retain(|(id, _)| *id != handler_id);
                    if list.is_empty() {
                        handlers.remove(&collection);
                    }
                }
            }
        })
    }

    fn notify(&self, change: RemoteChange) {
        // Handlers run outside the lock so they may call back into the store
        let handlers: Vec<ChangeHandler> = self
            .handlers()
            .get(&change.collection)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(change.clone());
        }
    }

    fn check_available(&self) -> RemoteResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable)
        }
    }

    fn docs(&self) -> MutexGuard<'_, Collections> {
        self.inner.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Vec<(u64, ChangeHandler)>>> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteAdapter for MemoryRemote {
    async fn set(&self, collection: &str, doc: RemoteDocument) -> RemoteResult<()> {
        self.check_available()?;
        self.put_document(collection, doc);
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> RemoteResult<()> {
        self.check_available()?;
        self.remove_document(collection, id);
        Ok(())
    }

    async fn fetch_all(&self, collection: &str) -> RemoteResult<Vec<RemoteDocument>> {
        self.check_available()?;
        Ok(self.documents(collection))
    }

    async fn subscribe(
        &self,
        collection: &str,
        handler: ChangeHandler,
    ) -> RemoteResult<Subscription> {
        self.check_available()?;
        Ok(self.add_handler(collection, handler))
    }

    async fn ping(&self) -> RemoteResult<()> {
        self.check_available()
    }
}
