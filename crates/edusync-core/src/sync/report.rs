//! Sync pass summary

use std::fmt;

use serde::Serialize;

/// Counts from one sync pass (or a run of coalesced passes)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Records written to the remote store
    pub pushed: usize,
    /// Tombstones removed from the remote store
    pub removed: usize,
    /// Remote copies applied locally
    pub pulled: usize,
    /// Local copies dropped because the remote store no longer has them
    pub purged: usize,
    /// Records changed on both sides since their last sync
    pub conflicts: usize,
    /// Pushes or pulls that failed and will be retried
    pub failed: usize,
    /// Pending records left for a later pass (backoff or offline)
    pub skipped: usize,
    /// The call joined a pass already in progress
    pub coalesced: bool,
}

impl SyncReport {
    pub fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }

    /// Fold the counts of a follow-up pass into this one
    pub fn merge(&mut self, other: &SyncReport) {
        self.pushed += other.pushed;
        self.removed += other.removed;
        self.pulled += other.pulled;
        self.purged += other.purged;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    /// Writes sent to the remote store
    pub fn remote_writes(&self) -> usize {
        self.pushed + self.removed
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.coalesced {
            return f.write_str("joined a sync already in progress");
        }
        write!(
            f,
            "{} pushed, {} removed, {} pulled, {} purged, {} conflicts, {} failed, {} skipped",
            self.pushed,
            self.removed,
            self.pulled,
            self.purged,
            self.conflicts,
            self.failed,
            self.skipped
        )
    }
}
