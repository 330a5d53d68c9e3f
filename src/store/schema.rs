//! SQLite schema for the document index and task store
//!
//! Both live in ordinary SQLite files. The pragmas favour write throughput
//! but keep normal locking, since a `status` or `cancel` command in another
//! process must be able to read and write the task table while a job runs.

use crate::error::StoreResult;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version for migrations
pub const SCHEMA_VERSION: u32 = 1;

/// Documents of every index, keyed by index name and id
const CREATE_DOCUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    index_name TEXT NOT NULL,
    id TEXT NOT NULL,
    doc_type TEXT NOT NULL,
    source TEXT NOT NULL,         -- raw JSON
    version INTEGER NOT NULL,
    routing TEXT,
    parent TEXT,
    timestamp TEXT,
    ttl INTEGER,                  -- milliseconds
    PRIMARY KEY (index_name, id)
) WITHOUT ROWID
"#;

/// Persisted job statuses and pending control requests
const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    status_json TEXT NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL,     -- RFC 3339
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    requested_rps REAL            -- pending rethrottle, -1 for unlimited
)
"#;

/// Store metadata
const CREATE_META_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS store_info (
    key TEXT PRIMARY KEY,
    value TEXT
)
"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_documents_type ON documents(index_name, doc_type)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state)",
];

/// SQLite pragmas for write throughput with shared access
const WRITE_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;      -- 64MB cache
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;
PRAGMA wal_autocheckpoint = 10000;
"#;

/// Configure a connection and create the document table
pub fn create_index_database(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(WRITE_PRAGMAS)?;
    conn.execute(CREATE_DOCUMENTS_TABLE, [])?;
    conn.execute(CREATE_META_TABLE, [])?;
    conn.execute(CREATE_INDEXES[0], [])?;
    stamp_schema_version(conn)
}

/// Configure a connection and create the task table
pub fn create_task_database(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(WRITE_PRAGMAS)?;
    conn.execute(CREATE_TASKS_TABLE, [])?;
    conn.execute(CREATE_META_TABLE, [])?;
    conn.execute(CREATE_INDEXES[1], [])?;
    stamp_schema_version(conn)
}

fn stamp_schema_version(conn: &Connection) -> StoreResult<()> {
    if get_store_info(conn, keys::SCHEMA_VERSION)?.is_none() {
        set_store_info(conn, keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;
    }
    Ok(())
}

/// Store metadata
pub fn set_store_info(conn: &Connection, key: &str, value: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO store_info (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Get metadata
pub fn get_store_info(conn: &Connection, key: &str) -> StoreResult<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM store_info WHERE key = ?1", [key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

/// Metadata keys
pub mod keys {
    /// Schema version
    pub const SCHEMA_VERSION: &str = "schema_version";

    /// Crate version that created the file
    pub const CREATED_BY: &str = "created_by";
}
