//! SQLite schema for the local store
//!
//! One table per collection. Records keep their envelope in dedicated
//! columns and the entity body as JSON; foreign-key lookups go through
//! expression indexes on the JSON fields.

use rusqlite::{Connection, Result};

use super::error::{StorageError, StorageResult};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Declaration of one collection and the fields it is queried by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: String,
    pub indexes: Vec<String>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    /// Declare a field the collection can be queried by
    pub fn index(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.indexes.contains(&field) {
            self.indexes.push(field);
        }
        self
    }

    pub fn has_index(&self, field: &str) -> bool {
        field == "id" || self.indexes.iter().any(|i| i == field)
    }

    /// Reject names that cannot be used as SQL identifiers
    pub fn validate(&self) -> StorageResult<()> {
        validate_name(&self.name)?;
        for index in &self.indexes {
            validate_name(index)?;
        }
        Ok(())
    }
}

/// Collections of the school dashboard and their foreign keys
pub fn school_collections() -> Vec<CollectionSchema> {
    vec![
        CollectionSchema::new("students")
            .index("classId")
            .index("parentId"),
        CollectionSchema::new("teachers").index("subjectId"),
        CollectionSchema::new("parents"),
        CollectionSchema::new("classes").index("teacherId"),
        CollectionSchema::new("subjects").index("teacherId"),
        CollectionSchema::new("attendance")
            .index("studentId")
            .index("classId")
            .index("date"),
        CollectionSchema::new("grades")
            .index("studentId")
            .index("subjectId")
            .index("teacherId"),
        CollectionSchema::new("assignments")
            .index("classId")
            .index("teacherId")
            .index("dueDate"),
        CollectionSchema::new("announcements")
            .index("authorId")
            .index("date"),
        CollectionSchema::new("events").index("date"),
    ]
}

/// Check that a collection or field name is a plain identifier
pub fn validate_name(name: &str) -> StorageResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}

/// Initialize the bookkeeping tables
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Create the table and indexes backing a collection
///
/// Names must have passed [`validate_name`]; they are interpolated into DDL.
pub fn create_collection(conn: &Connection, schema: &CollectionSchema) -> Result<()> {
    let table = &schema.name;
    let mut ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_status TEXT NOT NULL,
            local_updated_at INTEGER NOT NULL,
            last_synced_at INTEGER,
            deleted INTEGER NOT NULL DEFAULT 0
        );

        -- Pending sweep
        CREATE INDEX IF NOT EXISTS "idx_{table}_sync_status"
            ON "{table}"(sync_status, local_updated_at);
        "#
    );

    for field in &schema.indexes {
        ddl.push_str(&format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{table}_{field}\" ON \"{table}\"(json_extract(body, '$.{field}'));\n"
        ));
    }

    conn.execute_batch(&ddl)
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
