//! Whole-record conflict resolution
//!
//! Decides, for one record, whether the local or the remote copy survives.
//! Comparison is by `local_updated_at` on the local side and `modifiedAt`
//! (the writer's `local_updated_at`) on the remote side. Ties go to the
//! remote copy so two devices converge on whichever write reached the
//! remote store first.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::record::Record;
use crate::remote::{to_remote, RemoteDocument};

/// Policy applied when local and remote copies disagree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Newest timestamp wins
    #[default]
    Latest,
    /// Unconfirmed local changes always win
    PreferLocal,
    /// The remote copy always wins
    PreferRemote,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Latest => "latest",
            ConflictResolution::PreferLocal => "prefer-local",
            ConflictResolution::PreferRemote => "prefer-remote",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(ConflictResolution::Latest),
            "prefer-local" => Ok(ConflictResolution::PreferLocal),
            "prefer-remote" => Ok(ConflictResolution::PreferRemote),
            other => Err(format!(
                "unknown conflict resolution '{}' (expected latest, prefer-local or prefer-remote)",
                other
            )),
        }
    }
}

/// What to do with a record after comparing both copies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the local copy with the remote one
    ApplyRemote,
    /// Keep the local copy and push it over the remote one
    KeepLocal,
    /// Copies already agree; confirm the local one as synced
    Confirm,
    /// Drop the local copy
    Purge,
    /// Nothing to do
    Noop,
}

/// Resolve a remote document against the local copy (if any)
pub fn resolve(
    local: Option<&Record>,
    remote: &RemoteDocument,
    policy: ConflictResolution,
) -> Resolution {
    let Some(local) = local else {
        return Resolution::ApplyRemote;
    };

    if matches_remote(local, remote) {
        return if local.is_synced() {
            Resolution::Noop
        } else {
            Resolution::Confirm
        };
    }

    match policy {
        ConflictResolution::PreferRemote => Resolution::ApplyRemote,
        ConflictResolution::PreferLocal if local.is_pending() => Resolution::KeepLocal,
        ConflictResolution::PreferLocal => Resolution::ApplyRemote,
        ConflictResolution::Latest => {
            if local.local_updated_at > remote.modified_at {
                Resolution::KeepLocal
            } else {
                Resolution::ApplyRemote
            }
        }
    }
}

/// Resolve a local record the remote store does not have
///
/// Synced copies were removed remotely and are purged, as are tombstones
/// (the removal they wait for already happened). Pending copies survive and
/// get pushed, which also covers records created while offline.
pub fn resolve_missing(local: &Record) -> Resolution {
    if local.deleted || local.is_synced() {
        Resolution::Purge
    } else {
        Resolution::KeepLocal
    }
}

/// Both sides changed the record since it was last confirmed
pub fn is_conflict(local: &Record, remote: &RemoteDocument) -> bool {
    if !local.is_pending() || matches_remote(local, remote) {
        return false;
    }
    match local.last_synced_at {
        Some(synced) => remote.modified_at > synced,
        None => true,
    }
}

fn matches_remote(local: &Record, remote: &RemoteDocument) -> bool {
    !local.deleted && local.local_updated_at == remote.modified_at && to_remote(local) == *remote
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn record(name: &str, ts: i64) -> Record {
        let Value::Object(data) = json!({ "name": name }) else {
            unreachable!()
        };
        let mut record = Record::new("s1", data, Utc::now());
        record.local_updated_at = ts;
        record
    }

    fn remote(name: &str, ts: i64) -> RemoteDocument {
        let mut doc = to_remote(&record(name, ts));
        doc.modified_at = ts;
        doc
    }

    fn synced(mut record: Record) -> Record {
        record.mark_synced(record.local_updated_at);
        record
    }

    #[test]
    fn test_missing_local_takes_remote() {
        for policy in [
            ConflictResolution::Latest,
            ConflictResolution::PreferLocal,
            ConflictResolution::PreferRemote,
        ] {
            assert_eq!(resolve(None, &remote("A", 1), policy), Resolution::ApplyRemote);
        }
    }

    #[test]
    fn test_latest_wins() {
        let policy = ConflictResolution::Latest;
        assert_eq!(
            resolve(Some(&record("local", 200)), &remote("remote", 100), policy),
            Resolution::KeepLocal
        );
        assert_eq!(
            resolve(Some(&record("local", 100)), &remote("remote", 200), policy),
            Resolution::ApplyRemote
        );
        // Synced but newer than remote still overwrites the remote copy
        assert_eq!(
            resolve(Some(&synced(record("local", 200))), &remote("remote", 100), policy),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn test_ties_go_to_remote() {
        assert_eq!(
            resolve(
                Some(&record("local", 100)),
                &remote("remote", 100),
                ConflictResolution::Latest
            ),
            Resolution::ApplyRemote
        );
    }

    #[test]
    fn test_identical_copies() {
        let local = record("A", 100);
        let doc = to_remote(&local);
        let policy = ConflictResolution::Latest;

        assert_eq!(resolve(Some(&local), &doc, policy), Resolution::Confirm);
        assert_eq!(resolve(Some(&synced(local)), &doc, policy), Resolution::Noop);
    }

    #[test]
    fn test_identical_tombstone_is_not_confirmed() {
        let mut local = record("A", 100);
        let doc = to_remote(&local);
        local.tombstone();
        assert_eq!(
            resolve(Some(&local), &doc, ConflictResolution::Latest),
            Resolution::ApplyRemote
        );
    }

    #[test]
    fn test_prefer_local() {
        let policy = ConflictResolution::PreferLocal;
        assert_eq!(
            resolve(Some(&record("local", 100)), &remote("remote", 200), policy),
            Resolution::KeepLocal
        );
        assert_eq!(
            resolve(Some(&synced(record("local", 100))), &remote("remote", 200), policy),
            Resolution::ApplyRemote
        );
    }

    #[test]
    fn test_prefer_remote() {
        assert_eq!(
            resolve(
                Some(&record("local", 300)),
                &remote("remote", 200),
                ConflictResolution::PreferRemote
            ),
            Resolution::ApplyRemote
        );
    }

    #[test]
    fn test_resolve_missing() {
        assert_eq!(resolve_missing(&record("A", 1)), Resolution::KeepLocal);
        assert_eq!(resolve_missing(&synced(record("A", 1))), Resolution::Purge);

        let mut tombstone = record("A", 1);
        tombstone.tombstone();
        assert_eq!(resolve_missing(&tombstone), Resolution::Purge);
    }

    #[test]
    fn test_is_conflict() {
        let mut local = record("local", 300);
        local.last_synced_at = Some(100);

        assert!(is_conflict(&local, &remote("remote", 200)));
        // Remote untouched since the last sync
        assert!(!is_conflict(&local, &remote("remote", 100)));
        assert!(!is_conflict(&synced(record("local", 300)), &remote("remote", 200)));
    }

    #[test]
    fn test_policy_strings() {
        assert_eq!(
            "prefer-remote".parse::<ConflictResolution>().unwrap(),
            ConflictResolution::PreferRemote
        );
        assert_eq!(ConflictResolution::PreferLocal.to_string(), "prefer-local");
        assert!("newest".parse::<ConflictResolution>().is_err());
        assert_eq!(
            serde_json::to_value(ConflictResolution::PreferLocal).unwrap(),
            json!("prefer-local")
        );
    }
}
