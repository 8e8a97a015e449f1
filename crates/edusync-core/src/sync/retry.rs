//! Per-record retry backoff
//!
//! A record whose push failed is skipped by automatic passes until its
//! backoff window has elapsed. Each consecutive failure doubles the window.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Initial delay after the first failure
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on the delay between attempts
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures - 1);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    failures: u32,
    retry_at: Instant,
}

/// Failure bookkeeping keyed by `(collection, id)`
#[derive(Debug, Default)]
pub struct Backoff {
    policy: RetryPolicy,
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failed attempt, returning the delay until the next one
    pub fn record_failure(&self, collection: &str, id: &str) -> Duration {
        let mut entries = self.entries();
        let entry = entries
            .entry((collection.to_string(), id.to_string()))
            .or_insert(Entry {
                failures: 0,
                retry_at: Instant::now(),
            });
        entry.failures = entry.failures.saturating_add(1);
        let delay = self.policy.delay(entry.failures);
        entry.retry_at = Instant::now() + delay;
        delay
    }

    pub fn record_success(&self, collection: &str, id: &str) {
        self.entries()
            .remove(&(collection.to_string(), id.to_string()));
    }

    /// Drop the entries of `collection` whose id fails `keep`
    ///
    /// Records that were purged or confirmed without a push would
    /// otherwise keep their entry forever.
    pub fn retain(&self, collection: &str, keep: impl Fn(&str) -> bool) {
        self.entries()
            .retain(|(c, id), _| c != collection || keep(id));
    }

    /// Whether the record may be attempted now
    pub fn is_ready(&self, collection: &str, id: &str) -> bool {
        self.is_ready_at(collection, id, Instant::now())
    }

    pub fn is_ready_at(&self, collection: &str, id: &str, now: Instant) -> bool {
        self.entries()
            .get(&(collection.to_string(), id.to_string()))
            .map_or(true, |entry| now >= entry.retry_at)
    }

    /// Consecutive failures recorded for a record
    pub fn failures(&self, collection: &str, id: &str) -> u32 {
        self.entries()
            .get(&(collection.to_string(), id.to_string()))
            .map_or(0, |entry| entry.failures)
    }

    /// Number of records currently backing off
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(String, String), Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
