//! Sync manager
//!
//! Orchestrates bidirectional sync between the local store and the remote
//! store: scheduled and manual passes, push continuations after local
//! writes, remote change feeds, and lifecycle events.
//!
//! ## Sync pass
//!
//! For every registered collection, in name order:
//!
//! 1. **Pull**: fetch the whole remote collection and resolve each document
//!    against the local copy. Synced local copies missing remotely are purged.
//! 2. **Push**: write every pending record (tombstones become removals and
//!    are purged once the removal succeeds).
//!
//! Pulling first means every pending record has already been compared with
//! the newest remote copy before it overwrites it.
//!
//! ## Remote writes
//!
//! Every push goes through one lock and re-reads the record first. A record
//! is only confirmed as synced if nothing touched it while the write was in
//! flight; otherwise it stays pending for the next push.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::conflict::{is_conflict, resolve, resolve_missing, Resolution};
use super::connectivity::ConnectivityMonitor;
use super::events::{EventBus, EventKind, SyncEvent};
use super::report::SyncReport;
use super::retry::{Backoff, RetryPolicy};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::record::{MonotonicClock, Record};
use crate::remote::{
    from_remote, remote_path, ChangeHandler, RemoteAdapter, RemoteChange, RemoteDocument,
};
use crate::storage::LocalStore;
use crate::subscription::Subscription;

/// Where the manager is in its pass cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the manager's progress
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub state: SyncState,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<SyncReport>,
    pub auto_sync: bool,
}

/// Outcome of pushing one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Written remotely and confirmed locally
    Pushed,
    /// Written remotely, but the record changed meanwhile and stays pending
    Superseded,
    /// Removed remotely and purged locally
    Removed,
    /// Nothing left to push
    Unchanged,
}

/// Coordinates the local and remote stores
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: LocalStore,
    remote: Arc<dyn RemoteAdapter>,
    clock: Arc<MonotonicClock>,
    connectivity: ConnectivityMonitor,
    events: EventBus,
    config: RwLock<SyncConfig>,
    backoff: Backoff,
    /// Serializes every remote write
    push_lock: tokio::sync::Mutex<()>,
    syncing: AtomicBool,
    rerun: AtomicBool,
    status: Mutex<ManagerStatus>,
    remote_feeds: Mutex<Vec<Subscription>>,
    tasks: Mutex<Tasks>,
    continuations: Mutex<JoinSet<()>>,
}

#[derive(Default)]
struct Tasks {
    auto_sync: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [self.auto_sync.take(), self.watcher.take(), self.probe.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

impl SyncManager {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteAdapter>,
        clock: Arc<MonotonicClock>,
        connectivity: ConnectivityMonitor,
        events: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                clock,
                connectivity,
                events,
                config: RwLock::new(config),
                backoff: Backoff::new(RetryPolicy::default()),
                push_lock: tokio::sync::Mutex::new(()),
                syncing: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                status: Mutex::new(ManagerStatus::default()),
                remote_feeds: Mutex::new(Vec::new()),
                tasks: Mutex::new(Tasks::default()),
                continuations: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<MonotonicClock> {
        &self.inner.clock
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn backoff(&self) -> &Backoff {
        &self.inner.backoff
    }

    pub fn config(&self) -> SyncConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ManagerStatus {
        let mut status = self.status_guard().clone();
        status.auto_sync = self.is_auto_syncing();
        status
    }

    /// Register an event handler
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.events.on(kind, handler)
    }

    // ==================== Lifecycle ====================

    /// Replace the sync policy, restarting the timer if it is running
    pub fn configure(&self, config: SyncConfig) {
        let restart = self.is_auto_syncing();
        *self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config.clone();

        if !config.auto_sync {
            self.stop_auto_sync();
        } else if restart {
            self.start_auto_sync();
        }
    }

    /// Start background work: auto-sync timer, connectivity watcher and,
    /// when `probe` is set, remote reachability probing
    ///
    /// If currently online the remote feeds are subscribed and a first pass
    /// runs in the background.
    pub fn start(&self, probe: bool) {
        let Ok(handle) = Handle::try_current() else {
            warn!("No async runtime; background sync is disabled");
            return;
        };

        if self.config().auto_sync {
            self.start_auto_sync();
        }
        self.watch_connectivity(&handle);

        if probe {
            let interval = self.config().probe_interval();
            let task = self
                .inner
                .connectivity
                .spawn_probe(self.inner.remote.clone(), interval);
            if let Some(old) = self.tasks().probe.replace(task) {
                old.abort();
            }
        }

        if self.is_online() {
            let manager = self.clone();
            self.continuations()
                .spawn_on(async move { manager.go_online().await }, &handle);
        }
    }

    /// Run a pass on a recurring timer
    pub fn start_auto_sync(&self) {
        let Ok(handle) = Handle::try_current() else {
            warn!("No async runtime; auto-sync is disabled");
            return;
        };

        let interval = self.config().sync_interval();
        let inner = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = upgrade(&inner) else {
                    break;
                };
                if !manager.is_online() {
                    continue;
                }
                if let Err(e) = manager.sync_all().await {
                    debug!("Scheduled sync did not run: {}", e);
                }
            }
        });

        if let Some(old) = self.tasks().auto_sync.replace(task) {
            old.abort();
        }
        info!(interval_ms = interval.as_millis() as u64, "Auto-sync started");
    }

    pub fn stop_auto_sync(&self) {
        if let Some(task) = self.tasks().auto_sync.take() {
            task.abort();
            info!("Auto-sync stopped");
        }
    }

    pub fn is_auto_syncing(&self) -> bool {
        self.tasks()
            .auto_sync
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop timers and watchers, drop remote feeds and abort in-flight pushes
    pub fn shutdown(&self) {
        self.tasks().abort_all();
        self.unsubscribe_from_all_remote_updates();
        self.continuations().abort_all();
        self.set_state(SyncState::Idle);
        info!("Sync manager shut down");
    }

    /// Wipe everything this device knows
    ///
    /// Background work stops; the caller must start the manager again.
    pub fn clear_all_local_data(&self) -> SyncResult<()> {
        self.shutdown();
        self.inner.store.clear()?;
        self.inner.backoff.clear();
        *self.status_guard() = ManagerStatus::default();
        info!("Cleared all local data");
        Ok(())
    }

    /// Wait for every spawned push continuation to finish
    pub async fn settle(&self) {
        loop {
            let mut running = std::mem::take(&mut *self.continuations());
            if running.is_empty() {
                break;
            }
            while running.join_next().await.is_some() {}
        }
    }

    // ==================== Connectivity ====================

    fn watch_connectivity(&self, handle: &Handle) {
        let mut online = self.inner.connectivity.subscribe();
        let inner = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                let Some(manager) = upgrade(&inner) else {
                    break;
                };
                if is_online {
                    manager.go_online().await;
                } else {
                    manager.go_offline();
                }
            }
        });

        if let Some(old) = self.tasks().watcher.replace(task) {
            old.abort();
        }
    }

    async fn go_online(&self) {
        self.inner.events.emit(SyncEvent::Online);
        if let Err(e) = self.subscribe_to_all_remote_updates().await {
            warn!("Failed to subscribe to remote changes: {}", e);
        }
        // Flush everything, including records still inside their backoff
        if let Err(e) = self.sync_now().await {
            debug!("Sync after reconnect did not run: {}", e);
        }
    }

    fn go_offline(&self) {
        self.inner.events.emit(SyncEvent::Offline);
        self.unsubscribe_from_all_remote_updates();
    }

    // ==================== Remote feeds ====================

    /// Follow remote changes for every registered collection
    ///
    /// Replaces any existing feeds. Collections whose feed could not be
    /// opened are skipped; the first failure is returned.
    pub async fn subscribe_to_all_remote_updates(&self) -> SyncResult<usize> {
        self.unsubscribe_from_all_remote_updates();

        let mut feeds = Vec::new();
        let mut first_error = None;
        for collection in self.inner.store.collections() {
            let inner = Arc::downgrade(&self.inner);
            let handler: ChangeHandler = Arc::new(move |change: RemoteChange| {
                if let Some(manager) = upgrade(&inner) {
                    manager.handle_remote_change(change);
                }
            });

            match self.inner.remote.subscribe(&collection, handler).await {
                Ok(feed) => feeds.push(feed),
                Err(source) => {
                    warn!(collection = %collection, "Remote subscription failed: {}", source);
                    first_error.get_or_insert(SyncError::RemoteRead { collection, source });
                }
            }
        }

        let count = feeds.len();
        self.feeds().extend(feeds);
        debug!(count, "Subscribed to remote changes");

        match first_error {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    pub fn unsubscribe_from_all_remote_updates(&self) {
        let feeds = std::mem::take(&mut *self.feeds());
        if !feeds.is_empty() {
            debug!(count = feeds.len(), "Unsubscribed from remote changes");
        }
        drop(feeds);
    }

    pub fn remote_feed_count(&self) -> usize {
        self.feeds().len()
    }

    fn handle_remote_change(&self, change: RemoteChange) {
        if self.inner.store.schema(&change.collection).is_none() {
            return;
        }

        let mut report = SyncReport::default();
        let result = match change.document {
            Some(doc) => self.apply_remote(&change.collection, doc, &mut report),
            None => match self.inner.store.get(&change.collection, &change.id) {
                Ok(Some(local)) => self.apply_missing(&change.collection, &local, &mut report),
                Ok(None) => Ok(()),
                Err(e) => Err(e.into()),
            },
        };

        match result {
            Ok(()) => debug!(
                collection = %change.collection,
                id = %change.id,
                pulled = report.pulled,
                purged = report.purged,
                "Applied remote change"
            ),
            Err(e) => warn!(
                collection = %change.collection,
                id = %change.id,
                "Failed to apply remote change: {}",
                e
            ),
        }
    }

    // ==================== Sync passes ====================

    /// Run a sync pass over every collection
    ///
    /// A call made while a pass is running returns a coalesced report at once
    /// and makes the running pass go around one more time. Records inside
    /// their retry backoff window are skipped.
    pub async fn sync_all(&self) -> SyncResult<SyncReport> {
        self.run(false).await
    }

    /// Like [`sync_all`](Self::sync_all), but retries every pending record
    /// regardless of backoff
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        self.run(true).await
    }

    async fn run(&self, force: bool) -> SyncResult<SyncReport> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }

        let Some(mut slot) = PassSlot::acquire(&self.inner) else {
            self.inner.rerun.store(true, Ordering::SeqCst);
            debug!("Sync already running; coalescing");
            return Ok(SyncReport::coalesced());
        };

        let mut total = SyncReport::default();
        let result = loop {
            self.inner.rerun.store(false, Ordering::SeqCst);
            match self.pass(force).await {
                Ok(report) => total.merge(&report),
                Err(e) => break Err(e),
            }

            if self.inner.rerun.load(Ordering::SeqCst) && self.is_online() {
                continue;
            }
            slot.release();
            // A request may have landed between the check and the release
            if self.inner.rerun.load(Ordering::SeqCst) && self.is_online() && slot.reacquire() {
                continue;
            }
            break Ok(total);
        };

        if let Err(e) = &result {
            slot.release();
            self.fail_pass(e);
        }
        result
    }

    async fn pass(&self, force: bool) -> SyncResult<SyncReport> {
        self.set_state(SyncState::Syncing);
        self.inner.events.emit(SyncEvent::SyncStart);

        let mut report = SyncReport::default();
        for collection in self.inner.store.collections() {
            if !self.is_online() {
                report.skipped += self.inner.store.pending_count(&collection)? as usize;
                continue;
            }

            if let Err(e) = self.pull(&collection, &mut report).await {
                report.failed += 1;
                warn!(collection = %collection, "Pull failed: {}", e);
                self.report_error(Some(collection.clone()), &e);
                // Pushing without a fresh pull could overwrite newer remote data
                report.skipped += self.inner.store.pending_count(&collection)? as usize;
                continue;
            }

            self.push_pending(&collection, force, &mut report).await?;
        }

        self.finish_pass(&report);
        Ok(report)
    }

    async fn pull(&self, collection: &str, report: &mut SyncReport) -> SyncResult<()> {
        let docs = self
            .inner
            .remote
            .fetch_all(collection)
            .await
            .map_err(|source| SyncError::RemoteRead {
                collection: collection.to_string(),
                source,
            })?;

        let mut seen = HashSet::with_capacity(docs.len());
        for doc in docs {
            seen.insert(doc.id.clone());
            self.apply_remote(collection, doc, report)?;
        }

        for local in self.inner.store.get_all(collection)? {
            if !seen.contains(&local.id) {
                self.apply_missing(collection, &local, report)?;
            }
        }
        Ok(())
    }

    /// Resolve one remote document against the local copy
    fn apply_remote(
        &self,
        collection: &str,
        doc: RemoteDocument,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        self.inner.clock.observe(doc.modified_at);

        let local = self.inner.store.get(collection, &doc.id)?;
        if local.as_ref().is_some_and(|l| is_conflict(l, &doc)) {
            report.conflicts += 1;
        }

        let policy = self.config().conflict_resolution;
        match resolve(local.as_ref(), &doc, policy) {
            Resolution::ApplyRemote => {
                let id = doc.id.clone();
                let expected = local.as_ref().map(|l| l.local_updated_at);
                let record = from_remote(doc, Utc::now().timestamp_millis());
                if self
                    .inner
                    .store
                    .put_if_unchanged(collection, &record, expected)?
                {
                    self.inner.backoff.record_success(collection, &id);
                    report.pulled += 1;
                    debug!(collection, id = %id, "Pulled remote copy");
                }
            }
            Resolution::KeepLocal => {
                if let Some(local) = &local {
                    self.inner.store.mark_pending(collection, &local.id)?;
                }
            }
            Resolution::Confirm => {
                if let Some(local) = &local {
                    self.inner.store.mark_synced_if_unchanged(
                        collection,
                        &local.id,
                        local.local_updated_at,
                        Utc::now().timestamp_millis(),
                    )?;
                }
            }
            Resolution::Purge | Resolution::Noop => {}
        }
        Ok(())
    }

    /// Resolve a local record the remote store does not have
    fn apply_missing(
        &self,
        collection: &str,
        local: &Record,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        if resolve_missing(local) != Resolution::Purge {
            return Ok(());
        }

        let purged = if local.deleted {
            self.inner
                .store
                .purge_if_unchanged(collection, &local.id, local.local_updated_at)?
        } else {
            self.inner
                .store
                .purge_synced_if_unchanged(collection, &local.id, local.local_updated_at)?
        };
        if purged {
            self.inner.backoff.record_success(collection, &local.id);
            report.purged += 1;
            debug!(collection, id = %local.id, "Purged record missing remotely");
        }
        Ok(())
    }

    async fn push_pending(
        &self,
        collection: &str,
        force: bool,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let pending = self.inner.store.pending(collection)?;
        let ids: HashSet<&str> = pending.iter().map(|r| r.id.as_str()).collect();
        self.inner.backoff.retain(collection, |id| ids.contains(id));

        for record in &pending {
            if !self.is_online() || (!force && !self.inner.backoff.is_ready(collection, &record.id))
            {
                report.skipped += 1;
                continue;
            }

            match self.push_record(collection, &record.id).await {
                Ok(PushOutcome::Pushed | PushOutcome::Superseded) => report.pushed += 1,
                Ok(PushOutcome::Removed) => report.removed += 1,
                Ok(PushOutcome::Unchanged) => {}
                Err(e) if e.is_retryable() => report.failed += 1,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ==================== Pushes ====================

    /// Push the latest local state of one record
    ///
    /// Remote failures leave the record pending, start its backoff and are
    /// reported through a `sync-error` event before being returned.
    pub async fn push_record(&self, collection: &str, id: &str) -> SyncResult<PushOutcome> {
        let _guard = self.inner.push_lock.lock().await;

        let Some(record) = self.inner.store.get(collection, id)? else {
            self.inner.backoff.record_success(collection, id);
            return Ok(PushOutcome::Unchanged);
        };
        if record.is_synced() {
            self.inner.backoff.record_success(collection, id);
            return Ok(PushOutcome::Unchanged);
        }

        match self.inner.remote.push(collection, id, &record).await {
            Ok(()) => {
                self.inner.backoff.record_success(collection, id);
                if record.deleted {
                    self.inner
                        .store
                        .purge_if_unchanged(collection, id, record.local_updated_at)?;
                    debug!(collection, id, "Removed record remotely");
                    return Ok(PushOutcome::Removed);
                }

                let confirmed = self.inner.store.mark_synced_if_unchanged(
                    collection,
                    id,
                    record.local_updated_at,
                    Utc::now().timestamp_millis(),
                )?;
                if confirmed {
                    debug!(collection, id, "Pushed record");
                    Ok(PushOutcome::Pushed)
                } else {
                    debug!(collection, id, "Record changed during push; left pending");
                    Ok(PushOutcome::Superseded)
                }
            }
            Err(source) => {
                let retry_in = self.inner.backoff.record_failure(collection, id);
                warn!(
                    collection,
                    id,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Push failed: {}",
                    source
                );
                let err = SyncError::RemoteWrite {
                    path: remote_path(collection, id),
                    source,
                };
                self.report_error(Some(remote_path(collection, id)), &err);
                Err(err)
            }
        }
    }

    /// Push a record in the background after a local write
    ///
    /// Does nothing while offline; the next pass picks the record up.
    pub fn schedule_push(&self, collection: &str, id: &str) {
        if !self.is_online() {
            debug!(collection, id, "Offline; push deferred to next sync");
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            debug!(collection, id, "No async runtime; push deferred to next sync");
            return;
        };

        let manager = self.clone();
        let collection = collection.to_string();
        let id = id.to_string();
        let mut continuations = self.continuations();
        // Reap finished continuations
        while continuations.try_join_next().is_some() {}
        continuations.spawn_on(
            async move {
                // Failures are already logged and reported
                let _ = manager.push_record(&collection, &id).await;
            },
            &handle,
        );
    }

    // ==================== Status ====================

    fn set_state(&self, state: SyncState) {
        self.status_guard().state = state;
    }

    fn finish_pass(&self, report: &SyncReport) {
        {
            let mut status = self.status_guard();
            status.last_report = Some(report.clone());
            if report.is_clean() {
                status.state = SyncState::Synced;
                status.last_sync_at = Some(Utc::now());
                status.last_error = None;
            } else {
                status.state = SyncState::Error;
            }
        }

        info!(
            pushed = report.pushed,
            removed = report.removed,
            pulled = report.pulled,
            purged = report.purged,
            conflicts = report.conflicts,
            failed = report.failed,
            skipped = report.skipped,
            "Sync pass complete"
        );
        self.inner
            .events
            .emit(SyncEvent::SyncComplete(report.clone()));
    }

    fn fail_pass(&self, error: &SyncError) {
        warn!("Sync pass aborted: {}", error);
        {
            let mut status = self.status_guard();
            status.state = SyncState::Error;
            status.last_error = Some(error.to_string());
        }
        self.inner.events.emit(SyncEvent::SyncError {
            target: None,
            message: error.to_string(),
        });
    }

    fn report_error(&self, target: Option<String>, error: &SyncError) {
        self.status_guard().last_error = Some(error.to_string());
        self.inner.events.emit(SyncEvent::SyncError {
            target,
            message: error.to_string(),
        });
    }

    // ==================== Internals ====================

    fn status_guard(&self) -> MutexGuard<'_, ManagerStatus> {
        lock(&self.inner.status)
    }

    fn feeds(&self) -> MutexGuard<'_, Vec<Subscription>> {
        lock(&self.inner.remote_feeds)
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        lock(&self.inner.tasks)
    }

    fn continuations(&self) -> MutexGuard<'_, JoinSet<()>> {
        lock(&self.inner.continuations)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        lock(&self.tasks).abort_all();
    }
}

/// Exclusive right to run a pass
///
/// Dropping a held slot, as happens when the task running the pass is
/// aborted, releases it and takes the state out of `Syncing`.
struct PassSlot<'a> {
    inner: &'a Inner,
    held: bool,
}

impl<'a> PassSlot<'a> {
    fn acquire(inner: &'a Inner) -> Option<Self> {
        let mut slot = Self { inner, held: false };
        slot.reacquire().then_some(slot)
    }

    fn reacquire(&mut self) -> bool {
        if !self.held {
            self.held = !self.inner.syncing.swap(true, Ordering::SeqCst);
        }
        self.held
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.held) {
            self.inner.syncing.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for PassSlot<'_> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        self.inner.rerun.store(false, Ordering::SeqCst);
        {
            let mut status = lock(&self.inner.status);
            if status.state == SyncState::Syncing {
                status.state = SyncState::Idle;
            }
        }
        self.release();
        debug!("Sync pass cancelled");
    }
}

fn upgrade(inner: &Weak<Inner>) -> Option<SyncManager> {
    inner.upgrade().map(|inner| SyncManager { inner })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{with_sync_metadata, Fields};
    use crate::remote::{to_remote, MemoryRemote};
    use crate::storage::school_collections;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Harness {
        manager: SyncManager,
        remote: MemoryRemote,
    }

    fn harness() -> Harness {
        harness_with(SyncConfig::default())
    }

    fn harness_with(config: SyncConfig) -> Harness {
        let store = LocalStore::open_in_memory(&school_collections()).unwrap();
        let remote = MemoryRemote::new();
        let manager = SyncManager::new(
            store,
            Arc::new(remote.clone()),
            Arc::new(MonotonicClock::new()),
            ConnectivityMonitor::new(true),
            EventBus::new(),
            config,
        );
        Harness { manager, remote }
    }

    fn fields(body: Value) -> Fields {
        let Value::Object(map) = body else {
            panic!("expected object");
        };
        map
    }

    impl Harness {
        fn write_local(&self, collection: &str, id: &str, body: Value) -> Record {
            let existing = self.manager.store().get(collection, id).unwrap();
            let record = match existing {
                Some(mut record) => {
                    record.data = fields(body);
                    record
                }
                None => Record::new(id, fields(body), Utc::now()),
            };
            let record = with_sync_metadata(record, self.manager.clock());
            self.manager.store().put(collection, &record).unwrap();
            record
        }

        fn local(&self, collection: &str, id: &str) -> Option<Record> {
            self.manager.store().get(collection, id).unwrap()
        }
    }

    /// Poll `check` until it holds or five seconds pass
    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn remote_doc(id: &str, body: Value, modified_at: i64) -> RemoteDocument {
        let mut doc = to_remote(&Record::new(id, fields(body), Utc::now()));
        doc.modified_at = modified_at;
        doc
    }

    #[tokio::test]
    async fn test_push_pending_records() {
        let h = harness();
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.write_local("teachers", "t1", json!({"name": "Grace"}));

        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.pushed, 2);
        assert!(report.is_clean());
        assert!(h.local("students", "s1").unwrap().is_synced());
        assert_eq!(
            h.remote.document("teachers", "t1").unwrap().fields["name"],
            json!("Grace")
        );
        assert_eq!(h.manager.status().state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let h = harness();
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.manager.sync_all().await.unwrap();
        let writes = h.remote.write_count();

        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.remote_writes(), 0);
        assert_eq!(h.remote.write_count(), writes);
    }

    #[tokio::test]
    async fn test_pull_applies_remote_documents() {
        let h = harness();
        h.remote
            .put_document("students", remote_doc("s9", json!({"name": "Remote"}), 1_000));

        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.pulled, 1);
        let local = h.local("students", "s9").unwrap();
        assert!(local.is_synced());
        assert_eq!(local.data["name"], json!("Remote"));
        assert!(h.manager.clock().last() >= 1_000);
    }

    #[tokio::test]
    async fn test_newer_remote_beats_pending_local() {
        let h = harness();
        let local = h.write_local("students", "s1", json!({"name": "Local"}));
        h.remote.put_document(
            "students",
            remote_doc("s1", json!({"name": "Remote"}), local.local_updated_at + 10),
        );

        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.pushed, 0);
        assert_eq!(h.local("students", "s1").unwrap().data["name"], json!("Remote"));
        assert_eq!(
            h.remote.document("students", "s1").unwrap().fields["name"],
            json!("Remote")
        );
    }

    #[tokio::test]
    async fn test_newer_local_overwrites_remote() {
        let h = harness();
        h.remote
            .put_document("students", remote_doc("s1", json!({"name": "Remote"}), 1));
        h.write_local("students", "s1", json!({"name": "Local"}));

        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(
            h.remote.document("students", "s1").unwrap().fields["name"],
            json!("Local")
        );
    }

    #[tokio::test]
    async fn test_prefer_remote_policy() {
        let h = harness_with(SyncConfig {
            conflict_resolution: crate::sync::ConflictResolution::PreferRemote,
            ..SyncConfig::default()
        });
        h.remote
            .put_document("students", remote_doc("s1", json!({"name": "Remote"}), 1));
        h.write_local("students", "s1", json!({"name": "Local"}));

        h.manager.sync_all().await.unwrap();
        assert_eq!(h.local("students", "s1").unwrap().data["name"], json!("Remote"));
    }

    #[tokio::test]
    async fn test_remote_removal_purges_synced_copy() {
        let h = harness();
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.write_local("students", "s2", json!({"name": "Bob"}));
        h.manager.sync_all().await.unwrap();

        h.remote.remove_document("students", "s1");
        // Unsynced edit survives a remote removal and is re-pushed
        h.remote.remove_document("students", "s2");
        h.write_local("students", "s2", json!({"name": "Bobby"}));

        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(h.local("students", "s1").is_none());
        assert_eq!(
            h.remote.document("students", "s2").unwrap().fields["name"],
            json!("Bobby")
        );
    }

    #[tokio::test]
    async fn test_tombstone_is_removed_then_purged() {
        let h = harness();
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.manager.sync_all().await.unwrap();

        let mut record = h.local("students", "s1").unwrap();
        record.tombstone();
        let record = with_sync_metadata(record, h.manager.clock());
        h.manager.store().put("students", &record).unwrap();

        let report = h.manager.sync_all().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(h.remote.document("students", "s1").is_none());
        assert!(h.local("students", "s1").is_none());
    }

    #[tokio::test]
    async fn test_failed_push_backs_off() {
        let h = harness();
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.remote.put_document("teachers", remote_doc("t1", json!({}), 1));

        // Reads work, writes do not: simulate by failing the push only
        let failing = SyncManager::new(
            h.manager.store().clone(),
            Arc::new(WriteFailingRemote(h.remote.clone())),
            h.manager.clock().clone(),
            ConnectivityMonitor::new(true),
            EventBus::new(),
            SyncConfig::default(),
        );
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let _sub = failing.on(EventKind::SyncError, move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        let report = failing.sync_all().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(h.local("students", "s1").unwrap().is_pending());
        assert_eq!(failing.backoff().failures("students", "s1"), 1);
        assert_eq!(failing.status().state, SyncState::Error);
        assert_eq!(errors.lock().unwrap().len(), 1);

        // Inside the backoff window the record is skipped
        let report = failing.sync_all().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 1);

        // A forced pass ignores backoff
        let report = failing.sync_now().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(failing.backoff().failures("students", "s1"), 2);
    }

    struct WriteFailingRemote(MemoryRemote);

    #[async_trait::async_trait]
    impl RemoteAdapter for WriteFailingRemote {
        async fn set(&self, _: &str, _: RemoteDocument) -> crate::remote::RemoteResult<()> {
            Err(crate::remote::RemoteError::Rejected("read only".to_string()))
        }

        async fn remove(&self, _: &str, _: &str) -> crate::remote::RemoteResult<()> {
            Err(crate::remote::RemoteError::Rejected("read only".to_string()))
        }

        async fn fetch_all(&self, collection: &str) -> crate::remote::RemoteResult<Vec<RemoteDocument>> {
            self.0.fetch_all(collection).await
        }

        async fn subscribe(
            &self,
            collection: &str,
            handler: ChangeHandler,
        ) -> crate::remote::RemoteResult<Subscription> {
            self.0.subscribe(collection, handler).await
        }

        async fn ping(&self) -> crate::remote::RemoteResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unreachable_remote_skips_push() {
        let h = harness();
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.remote.set_available(false);

        let report = h.manager.sync_all().await.unwrap();
        assert!(report.failed > 0);
        assert_eq!(report.pushed, 0);
        assert_eq!(report.skipped, 1);
        assert!(h.local("students", "s1").unwrap().is_pending());
        assert!(h.manager.status().last_error.is_some());
    }

    #[tokio::test]
    async fn test_offline_sync_is_refused() {
        let h = harness();
        h.manager.connectivity().set_online(false);
        assert!(matches!(h.manager.sync_all().await, Err(SyncError::Offline)));
    }

    #[tokio::test]
    async fn test_remote_feed_applies_changes() {
        let h = harness();
        let count = h.manager.subscribe_to_all_remote_updates().await.unwrap();
        assert_eq!(count, school_collections().len());

        // Memory remote delivers changes synchronously
        h.remote
            .put_document("classes", remote_doc("c1", json!({"name": "7B"}), 5));
        assert_eq!(h.local("classes", "c1").unwrap().data["name"], json!("7B"));

        h.remote.remove_document("classes", "c1");
        assert!(h.local("classes", "c1").is_none());

        h.manager.unsubscribe_from_all_remote_updates();
        assert_eq!(h.manager.remote_feed_count(), 0);
        assert_eq!(h.remote.subscriber_count("classes"), 0);
    }

    #[tokio::test]
    async fn test_push_record_confirms_only_unchanged() {
        let h = harness();
        let record = h.write_local("students", "s1", json!({"name": "Ada"}));

        assert_eq!(
            h.manager.push_record("students", "s1").await.unwrap(),
            PushOutcome::Pushed
        );
        assert_eq!(
            h.manager.push_record("students", "s1").await.unwrap(),
            PushOutcome::Unchanged
        );
        assert!(h.local("students", "s1").unwrap().last_synced_at.unwrap() >= record.local_updated_at);
    }

    #[tokio::test]
    async fn test_schedule_push_and_settle() {
        let h = harness();
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.manager.schedule_push("students", "s1");
        h.manager.settle().await;

        assert!(h.remote.document("students", "s1").is_some());
        assert!(h.local("students", "s1").unwrap().is_synced());
    }

    #[tokio::test]
    async fn test_events_bracket_a_pass() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Vec::new();
        for kind in [EventKind::SyncStart, EventKind::SyncComplete] {
            let sink = seen.clone();
            subs.push(h.manager.on(kind, move |event| {
                sink.lock().unwrap().push(event.kind());
            }));
        }

        h.manager.sync_all().await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::SyncStart, EventKind::SyncComplete]
        );
    }

    #[tokio::test]
    async fn test_clear_all_local_data() {
        let h = harness();
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.manager.subscribe_to_all_remote_updates().await.unwrap();

        h.manager.clear_all_local_data().unwrap();
        assert!(h.local("students", "s1").is_none());
        assert_eq!(h.manager.remote_feed_count(), 0);
        assert_eq!(h.manager.status().state, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_configure_toggles_timer() {
        let h = harness();
        h.manager.start_auto_sync();
        assert!(h.manager.is_auto_syncing());

        h.manager.configure(SyncConfig {
            auto_sync: false,
            ..SyncConfig::default()
        });
        assert!(!h.manager.is_auto_syncing());
        assert!(!h.manager.status().auto_sync);
    }

    /// Fetches stall while `slow` is set
    struct SlowRemote {
        remote: MemoryRemote,
        slow: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl RemoteAdapter for SlowRemote {
        async fn set(&self, collection: &str, doc: RemoteDocument) -> crate::remote::RemoteResult<()> {
            self.remote.set(collection, doc).await
        }

        async fn remove(&self, collection: &str, id: &str) -> crate::remote::RemoteResult<()> {
            self.remote.remove(collection, id).await
        }

        async fn fetch_all(&self, collection: &str) -> crate::remote::RemoteResult<Vec<RemoteDocument>> {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.remote.fetch_all(collection).await
        }

        async fn subscribe(
            &self,
            collection: &str,
            handler: ChangeHandler,
        ) -> crate::remote::RemoteResult<Subscription> {
            self.remote.subscribe(collection, handler).await
        }

        async fn ping(&self) -> crate::remote::RemoteResult<()> {
            self.remote.ping().await
        }
    }

    #[tokio::test]
    async fn test_aborted_pass_releases_the_slot() {
        let remote = MemoryRemote::new();
        let slow = Arc::new(AtomicBool::new(true));
        let manager = SyncManager::new(
            LocalStore::open_in_memory(&school_collections()).unwrap(),
            Arc::new(SlowRemote {
                remote: remote.clone(),
                slow: slow.clone(),
            }),
            Arc::new(MonotonicClock::new()),
            ConnectivityMonitor::new(true),
            EventBus::new(),
            SyncConfig {
                auto_sync: false,
                ..SyncConfig::default()
            },
        );
        let h = Harness { manager, remote };

        // The connect-time pass is stuck in its first fetch when shut down
        h.manager.start(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.manager.is_syncing());
        h.manager.shutdown();
        wait_until(|| !h.manager.is_syncing()).await;
        assert_eq!(h.manager.status().state, SyncState::Idle);

        slow.store(false, Ordering::SeqCst);
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.manager.start(false);
        h.manager.settle().await;

        let report = h.manager.sync_all().await.unwrap();
        assert!(!report.coalesced);
        assert!(!h.manager.is_syncing());
        assert!(h.remote.document("students", "s1").is_some());
        assert!(h.local("students", "s1").unwrap().is_synced());
        assert_eq!(h.manager.status().state, SyncState::Synced);
        h.manager.shutdown();
    }

    #[tokio::test]
    async fn test_reconnect_flushes_backed_off_records() {
        let h = harness_with(SyncConfig {
            auto_sync: false,
            ..SyncConfig::default()
        });
        h.write_local("students", "s1", json!({"name": "Ada"}));

        h.remote.set_available(false);
        for _ in 0..4 {
            assert!(h.manager.push_record("students", "s1").await.is_err());
        }
        assert!(!h.manager.backoff().is_ready("students", "s1"));

        h.manager.connectivity().set_online(false);
        h.manager.start(false);
        h.remote.set_available(true);
        h.manager.connectivity().set_online(true);

        wait_until(|| h.local("students", "s1").unwrap().is_synced()).await;
        assert_eq!(
            h.remote.document("students", "s1").unwrap().fields["name"],
            json!("Ada")
        );
        assert_eq!(h.manager.backoff().failures("students", "s1"), 0);
        h.manager.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let h = harness();
        h.manager.start(false);
        h.manager.settle().await;
        assert!(h.manager.is_auto_syncing());
        assert_eq!(h.manager.remote_feed_count(), school_collections().len());
        assert_eq!(h.remote.subscriber_count("students"), 1);

        h.manager.shutdown();
        assert!(!h.manager.is_auto_syncing());
        assert_eq!(h.manager.remote_feed_count(), 0);
        for schema in school_collections() {
            assert_eq!(h.remote.subscriber_count(&schema.name), 0);
        }
        assert!(tokio::time::timeout(Duration::from_millis(100), h.manager.settle())
            .await
            .is_ok());
        assert_eq!(h.manager.status().state, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_pass_prunes_stale_backoff() {
        let h = harness();
        h.write_local("students", "s1", json!({"name": "Ada"}));
        h.manager.backoff().record_failure("students", "s1");
        // Purged elsewhere; never pending again
        h.manager.backoff().record_failure("students", "gone");
        h.manager.backoff().record_failure("teachers", "t1");

        let report = h.manager.sync_now().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert!(h.manager.backoff().is_empty());
    }
}
