//! Record envelope and sync metadata
//!
//! Every value in the local store is a [`Record`]: the business entity plus
//! identity, entity timestamps and the bookkeeping the sync manager uses to
//! decide what needs pushing.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Untyped entity body
pub type Fields = serde_json::Map<String, Value>;

/// Envelope keys that business data may not use
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "createdAt",
    "updatedAt",
    "syncStatus",
    "localUpdatedAt",
    "lastSyncedAt",
    "_deleted",
];

/// Whether local and remote copies are known to agree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local changes not yet confirmed by the remote store
    Pending,
    /// Remote agrees with local as of `last_synced_at`
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            other => Err(format!("unknown sync status: {}", other)),
        }
    }
}

/// A business entity wrapped in its sync envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record<T = Fields> {
    /// Engine-assigned identifier, unique within the collection
    pub id: String,
    /// The business entity
    #[serde(flatten)]
    pub data: T,
    /// When the entity was created
    pub created_at: DateTime<Utc>,
    /// When the entity was last changed
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    /// Monotonic milliseconds of the last local mutation
    pub local_updated_at: i64,
    /// Milliseconds of the last confirmed push or pull
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<i64>,
    /// Tombstone awaiting remote confirmation
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl<T> Record<T> {
    /// Create a fresh, never-synced record
    pub fn new(id: impl Into<String>, data: T, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            data,
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Pending,
            local_updated_at: now.timestamp_millis(),
            last_synced_at: None,
            deleted: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    pub fn is_synced(&self) -> bool {
        self.sync_status == SyncStatus::Synced
    }

    /// Confirm that the remote store agrees with this record
    ///
    /// `last_synced_at` never trails `local_updated_at`, even when the
    /// confirming clock is behind the stamping clock.
    pub fn mark_synced(&mut self, at: i64) {
        self.sync_status = SyncStatus::Synced;
        self.last_synced_at = Some(at.max(self.local_updated_at));
    }

    /// Mark the record deleted pending remote confirmation
    pub fn tombstone(&mut self) {
        self.deleted = true;
    }

    /// Replace the entity body, keeping the envelope
    pub fn map_data<U>(self, f: impl FnOnce(T) -> U) -> Record<U> {
        Record {
            id: self.id,
            data: f(self.data),
            created_at: self.created_at,
            updated_at: self.updated_at,
            sync_status: self.sync_status,
            local_updated_at: self.local_updated_at,
            last_synced_at: self.last_synced_at,
            deleted: self.deleted,
        }
    }
}

impl Record<Fields> {
    /// Decode the body into a typed entity
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<Record<T>, serde_json::Error> {
        let Record {
            id,
            data,
            created_at,
            updated_at,
            sync_status,
            local_updated_at,
            last_synced_at,
            deleted,
        } = self;
        let data = serde_json::from_value(Value::Object(data))?;
        Ok(Record {
            id,
            data,
            created_at,
            updated_at,
            sync_status,
            local_updated_at,
            last_synced_at,
            deleted,
        })
    }
}

/// Serialize an entity into a field map, dropping reserved envelope keys
pub fn to_fields<T: Serialize>(entity: &T) -> Result<Fields, serde_json::Error> {
    match serde_json::to_value(entity)? {
        Value::Object(mut map) => {
            for key in RESERVED_FIELDS {
                map.remove(*key);
            }
            Ok(map)
        }
        other => Err(serde::ser::Error::custom(format!(
            "entity must serialize to a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Generate a new record identifier
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

/// Strictly increasing millisecond clock
///
/// Wall-clock regressions and remote timestamps from the future never make a
/// later local write compare as older than an earlier one.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, greater than every previous one
    pub fn now(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Advance past a timestamp observed from another replica
    pub fn observe(&self, ts: i64) {
        self.last.fetch_max(ts, Ordering::AcqRel);
    }

    /// Last timestamp handed out or observed
    pub fn last(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }
}

/// Stamp a record for a local write
///
/// Called on every local write path: bumps `local_updated_at` and resets the
/// record to `pending` so the next push picks it up. Confirmation only ever
/// comes from a successful remote write.
pub fn with_sync_metadata<T>(mut record: Record<T>, clock: &MonotonicClock) -> Record<T> {
    record.local_updated_at = clock.now();
    record.sync_status = SyncStatus::Pending;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Student {
        name: String,
        class_id: String,
    }

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = Record::new("s1", fields(json!({"name": "A"})), Utc::now());
        assert!(record.is_pending());
        assert!(record.last_synced_at.is_none());
        assert!(!record.deleted);
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn test_mark_synced_never_trails_local_update() {
        let mut record = Record::new("s1", Fields::new(), Utc::now());
        record.local_updated_at = 5_000;
        record.mark_synced(4_000);
        assert!(record.is_synced());
        assert_eq!(record.last_synced_at, Some(5_000));

        record.mark_synced(6_000);
        assert_eq!(record.last_synced_at, Some(6_000));
    }

    #[test]
    fn test_with_sync_metadata_resets_pending() {
        let clock = MonotonicClock::new();
        let mut record = Record::new("s1", Fields::new(), Utc::now());
        record.mark_synced(record.local_updated_at);

        let before = record.local_updated_at;
        let record = with_sync_metadata(record, &clock);
        assert!(record.is_pending());
        assert!(record.local_updated_at >= before);
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_clock_observe_future_timestamp() {
        let clock = MonotonicClock::new();
        let future = Utc::now().timestamp_millis() + 60_000;
        clock.observe(future);
        assert!(clock.now() > future);
    }

    #[test]
    fn test_serialized_envelope_shape() {
        let mut record = Record::new("s1", fields(json!({"name": "A"})), Utc::now());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "s1");
        assert_eq!(value["name"], "A");
        assert_eq!(value["syncStatus"], "pending");
        assert!(value.get("_deleted").is_none());
        assert!(value.get("lastSyncedAt").is_none());

        record.tombstone();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["_deleted"], true);
    }

    #[test]
    fn test_into_typed() {
        let record = Record::new(
            "s1",
            fields(json!({"name": "A", "classId": "c1"})),
            Utc::now(),
        );
        let typed: Record<Student> = record.into_typed().unwrap();
        assert_eq!(typed.data.name, "A");
        assert_eq!(typed.data.class_id, "c1");
        assert_eq!(typed.id, "s1");
    }

    #[test]
    fn test_to_fields_strips_reserved_keys() {
        let value = json!({"id": "spoofed", "name": "A", "syncStatus": "synced"});
        let map = to_fields(&value).unwrap();
        assert!(!map.contains_key("id"));
        assert!(!map.contains_key("syncStatus"));
        assert_eq!(map["name"], "A");
    }

    #[test]
    fn test_to_fields_rejects_non_objects() {
        assert!(to_fields(&json!([1, 2, 3])).is_err());
        assert!(to_fields(&"plain").is_err());
    }

    #[test]
    fn test_sync_status_parse() {
        assert_eq!("pending".parse::<SyncStatus>(), Ok(SyncStatus::Pending));
        assert_eq!("synced".parse::<SyncStatus>(), Ok(SyncStatus::Synced));
        assert!("dirty".parse::<SyncStatus>().is_err());
        assert_eq!(SyncStatus::Synced.to_string(), "synced");
    }
}
