//! Local record store
//!
//! Durable, collection-scoped storage for [`Record`]s on top of SQLite.
//! Reads never touch the network. Every committed mutation is published on
//! a broadcast channel so observers refresh without polling.
//!
//! ## Tables
//!
//! - `schema_info` - schema version
//! - one table per registered collection (see [`create_collection`])

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::schema::{create_collection, init_schema, needs_init, validate_name, CollectionSchema};
use crate::record::{Fields, Record, SyncStatus};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

const SELECT_COLUMNS: &str =
    "id, body, created_at, updated_at, sync_status, local_updated_at, last_synced_at, deleted";

/// What happened to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
    Cleared,
}

/// Notification published after a committed mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub collection: String,
    /// `None` when the whole collection was cleared
    pub id: Option<String>,
    pub kind: ChangeKind,
}

/// Durable local record store
///
/// Cheap to clone; clones share the same connection and change feed.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    schemas: RwLock<HashMap<String, CollectionSchema>>,
    changes: broadcast::Sender<StoreChange>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open or create the database at `path` and register `schemas`
    pub fn open(path: &Path, schemas: &[CollectionSchema]) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
            }
        }

        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::from_connection(conn, Some(path.to_path_buf()), schemas)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(schemas: &[CollectionSchema]) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, None, schemas)
    }

    fn from_connection(
        conn: Connection,
        path: Option<PathBuf>,
        schemas: &[CollectionSchema],
    ) -> StorageResult<Self> {
        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let store = Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                schemas: RwLock::new(HashMap::new()),
                changes,
                path,
            }),
        };

        for schema in schemas {
            store.register(schema.clone())?;
        }

        Ok(store)
    }

    /// Database file location, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Register a collection, creating its table and indexes
    pub fn register(&self, schema: CollectionSchema) -> StorageResult<()> {
        schema.validate()?;
        create_collection(&self.conn(), &schema)?;
        debug!(collection = %schema.name, indexes = ?schema.indexes, "registered collection");
        self.inner
            .schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(schema.name.clone(), schema);
        Ok(())
    }

    /// Names of all registered collections, sorted
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn schema(&self, collection: &str) -> Option<CollectionSchema> {
        self.inner
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .cloned()
    }

    /// Subscribe to committed mutations
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }

    // ==================== Writes ====================

    /// Insert or replace a record by id
    pub fn put(&self, collection: &str, record: &Record) -> StorageResult<()> {
        self.ensure_collection(collection)?;
        upsert(&self.conn(), collection, record)?;

        self.publish(collection, Some(&record.id), ChangeKind::Put);
        Ok(())
    }

    /// Write `record` only if the stored copy still has `expected` as its
    /// `local_updated_at` (`None`: only if no copy exists)
    ///
    /// Returns whether the record was written.
    pub fn put_if_unchanged(
        &self,
        collection: &str,
        record: &Record,
        expected: Option<i64>,
    ) -> StorageResult<bool> {
        self.ensure_collection(collection)?;
        let written = {
            let conn = self.conn();
            let current: Option<i64> = conn
                .query_row(
                    &format!(r#"SELECT local_updated_at FROM "{collection}" WHERE id = ?1"#),
                    params![record.id],
                    |row| row.get(0),
                )
                .optional()?;

            if current == expected {
                upsert(&conn, collection, record)?;
                true
            } else {
                false
            }
        };

        if written {
            self.publish(collection, Some(&record.id), ChangeKind::Put);
        }
        Ok(written)
    }

    /// Hard-remove a record
    ///
    /// Returns whether a record was removed.
    pub fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
        self.ensure_collection(collection)?;
        let removed = self.conn().execute(
            &format!(r#"DELETE FROM "{collection}" WHERE id = ?1"#),
            params![id],
        )? > 0;

        if removed {
            self.publish(collection, Some(id), ChangeKind::Delete);
        }
        Ok(removed)
    }

    /// Mark a record synced, unless it was modified after `local_updated_at`
    ///
    /// Returns whether the record was updated.
    pub fn mark_synced_if_unchanged(
        &self,
        collection: &str,
        id: &str,
        local_updated_at: i64,
        at: i64,
    ) -> StorageResult<bool> {
        self.ensure_collection(collection)?;
        let updated = self.conn().execute(
            &format!(
                r#"
                UPDATE "{collection}"
                SET sync_status = 'synced', last_synced_at = max(?1, local_updated_at)
                WHERE id = ?2 AND local_updated_at = ?3
                "#
            ),
            params![at, id, local_updated_at],
        )? > 0;

        if updated {
            self.publish(collection, Some(id), ChangeKind::Put);
        }
        Ok(updated)
    }

    /// Purge a tombstone, unless it was modified after `local_updated_at`
    pub fn purge_if_unchanged(
        &self,
        collection: &str,
        id: &str,
        local_updated_at: i64,
    ) -> StorageResult<bool> {
        self.ensure_collection(collection)?;
        let removed = self.conn().execute(
            &format!(
                r#"DELETE FROM "{collection}" WHERE id = ?1 AND local_updated_at = ?2 AND deleted = 1"#
            ),
            params![id, local_updated_at],
        )? > 0;

        if removed {
            self.publish(collection, Some(id), ChangeKind::Delete);
        }
        Ok(removed)
    }

    /// Purge a synced copy the remote store no longer has, unless it was
    /// modified locally after `local_updated_at`
    pub fn purge_synced_if_unchanged(
        &self,
        collection: &str,
        id: &str,
        local_updated_at: i64,
    ) -> StorageResult<bool> {
        self.ensure_collection(collection)?;
        let removed = self.conn().execute(
            &format!(
                r#"DELETE FROM "{collection}" WHERE id = ?1 AND local_updated_at = ?2 AND sync_status = 'synced'"#
            ),
            params![id, local_updated_at],
        )? > 0;

        if removed {
            self.publish(collection, Some(id), ChangeKind::Delete);
        }
        Ok(removed)
    }

    /// Flag a record for re-push without touching its timestamps
    pub fn mark_pending(&self, collection: &str, id: &str) -> StorageResult<bool> {
        self.ensure_collection(collection)?;
        let updated = self.conn().execute(
            &format!(
                r#"UPDATE "{collection}" SET sync_status = 'pending' WHERE id = ?1 AND sync_status != 'pending'"#
            ),
            params![id],
        )? > 0;

        if updated {
            self.publish(collection, Some(id), ChangeKind::Put);
        }
        Ok(updated)
    }

    /// Remove every record from every collection
    pub fn clear(&self) -> StorageResult<()> {
        let collections = self.collections();
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            for collection in &collections {
                tx.execute(&format!(r#"DELETE FROM "{collection}""#), [])?;
            }
            tx.commit()?;
        }

        for collection in &collections {
            self.publish(collection, None, ChangeKind::Cleared);
        }
        Ok(())
    }

    // ==================== Reads ====================

    /// Get a record by id (tombstones included)
    pub fn get(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
        self.ensure_collection(collection)?;
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(r#"SELECT {SELECT_COLUMNS} FROM "{collection}" WHERE id = ?1"#),
                params![id],
                read_row,
            )
            .optional()?;

        row.map(|row| row.into_record(collection)).transpose()
    }

    /// Get every record in a collection (tombstones included)
    pub fn get_all(&self, collection: &str) -> StorageResult<Vec<Record>> {
        self.select(
            collection,
            &format!(r#"SELECT {SELECT_COLUMNS} FROM "{collection}" ORDER BY created_at, id"#),
            &[],
        )
    }

    /// Records whose local changes are not confirmed remotely, oldest first
    pub fn pending(&self, collection: &str) -> StorageResult<Vec<Record>> {
        self.select(
            collection,
            &format!(
                r#"SELECT {SELECT_COLUMNS} FROM "{collection}" WHERE sync_status = 'pending' ORDER BY local_updated_at, id"#
            ),
            &[],
        )
    }

    /// Records whose indexed field equals `value` (tombstones included)
    pub fn query_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> StorageResult<Vec<Record>> {
        let schema = self
            .schema(collection)
            .ok_or_else(|| StorageError::UnknownCollection(collection.to_string()))?;
        if !schema.has_index(index) {
            return Err(StorageError::UnknownIndex {
                collection: collection.to_string(),
                index: index.to_string(),
            });
        }
        validate_name(index)?;

        if index == "id" {
            let id = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(self.get(collection, &id)?.into_iter().collect());
        }

        let expr = format!("json_extract(body, '$.{index}')");
        match to_sql_value(value) {
            None => self.select(
                collection,
                &format!(
                    r#"SELECT {SELECT_COLUMNS} FROM "{collection}" WHERE {expr} IS NULL ORDER BY created_at, id"#
                ),
                &[],
            ),
            Some(param) => self.select(
                collection,
                &format!(
                    r#"SELECT {SELECT_COLUMNS} FROM "{collection}" WHERE {expr} = ?1 ORDER BY created_at, id"#
                ),
                &[param],
            ),
        }
    }

    /// Number of records in a collection (tombstones included)
    pub fn count(&self, collection: &str) -> StorageResult<i64> {
        self.ensure_collection(collection)?;
        Ok(self.conn().query_row(
            &format!(r#"SELECT COUNT(*) FROM "{collection}""#),
            [],
            |row| row.get(0),
        )?)
    }

    /// Number of pending records in a collection
    pub fn pending_count(&self, collection: &str) -> StorageResult<i64> {
        self.ensure_collection(collection)?;
        Ok(self.conn().query_row(
            &format!(r#"SELECT COUNT(*) FROM "{collection}" WHERE sync_status = 'pending'"#),
            [],
            |row| row.get(0),
        )?)
    }

    // ==================== Internals ====================

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_collection(&self, collection: &str) -> StorageResult<()> {
        let known = self
            .inner
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(collection);
        if known {
            Ok(())
        } else {
            Err(StorageError::UnknownCollection(collection.to_string()))
        }
    }

    fn select(
        &self,
        collection: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> StorageResult<Vec<Record>> {
        self.ensure_collection(collection)?;
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), read_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record(collection)?);
        }
        Ok(records)
    }

    fn publish(&self, collection: &str, id: Option<&str>, kind: ChangeKind) {
        // No receivers is fine
        let _ = self.inner.changes.send(StoreChange {
            collection: collection.to_string(),
            id: id.map(str::to_string),
            kind,
        });
    }
}

fn upsert(conn: &Connection, collection: &str, record: &Record) -> StorageResult<()> {
    let body = serde_json::to_string(&record.data)?;
    conn.execute(
        &format!(
            r#"
            INSERT INTO "{collection}"
                (id, body, created_at, updated_at, sync_status, local_updated_at, last_synced_at, deleted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                body = excluded.body,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                sync_status = excluded.sync_status,
                local_updated_at = excluded.local_updated_at,
                last_synced_at = excluded.last_synced_at,
                deleted = excluded.deleted
            "#
        ),
        params![
            record.id,
            body,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
            record.sync_status.as_str(),
            record.local_updated_at,
            record.last_synced_at,
            record.deleted,
        ],
    )?;
    Ok(())
}

/// Raw row, decoded outside the rusqlite closure so errors keep context
struct RecordRow {
    id: String,
    body: String,
    created_at: String,
    updated_at: String,
    sync_status: String,
    local_updated_at: i64,
    last_synced_at: Option<i64>,
    deleted: bool,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: row.get(0)?,
        body: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        sync_status: row.get(4)?,
        local_updated_at: row.get(5)?,
        last_synced_at: row.get(6)?,
        deleted: row.get(7)?,
    })
}

impl RecordRow {
    fn into_record(self, collection: &str) -> StorageResult<Record> {
        let corrupt = |details: String| StorageError::CorruptRecord {
            collection: collection.to_string(),
            id: self.id.clone(),
            details,
        };

        let data: Fields = serde_json::from_str(&self.body).map_err(|e| corrupt(e.to_string()))?;
        let created_at = parse_timestamp(&self.created_at).map_err(&corrupt)?;
        let updated_at = parse_timestamp(&self.updated_at).map_err(&corrupt)?;
        let sync_status: SyncStatus = self.sync_status.parse().map_err(&corrupt)?;

        Ok(Record {
            id: self.id.clone(),
            data,
            created_at,
            updated_at,
            sync_status,
            local_updated_at: self.local_updated_at,
            last_synced_at: self.last_synced_at,
            deleted: self.deleted,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

/// Map a JSON value onto what `json_extract` yields for it
fn to_sql_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        }),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}
