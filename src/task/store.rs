//! Task status persistence
//!
//! A job's status is saved under its task id so that it can be read after
//! the job ends, or from another process while it runs. The SQLite store
//! also carries control requests (cancel, rethrottle) written by such a
//! process; the running job picks them up with [`TaskStore::take_control`].

use crate::config::RequestsPerSecond;
use crate::error::{StoreError, StoreResult};
use crate::status::JobStatus;
use crate::store::schema;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Pending control request for a running task
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlRequest {
    pub cancel: bool,
    pub requests_per_second: Option<RequestsPerSecond>,
}

impl ControlRequest {
    pub fn is_empty(&self) -> bool {
        !self.cancel && self.requests_per_second.is_none()
    }
}

/// Where job statuses are kept
pub trait TaskStore: Send + Sync {
    /// Save the latest status of a task, replacing the previous one
    fn save(&self, task_id: &str, status: &JobStatus) -> StoreResult<()>;

    fn load(&self, task_id: &str) -> StoreResult<Option<JobStatus>>;

    /// Ask a task to cancel. Returns false if the task is unknown.
    fn request_cancel(&self, task_id: &str) -> StoreResult<bool>;

    /// Ask a task to change its rate. Returns false if the task is unknown.
    fn request_rethrottle(&self, task_id: &str, rps: RequestsPerSecond) -> StoreResult<bool>;

    /// Take (and clear) any pending control request
    fn take_control(&self, task_id: &str) -> StoreResult<Option<ControlRequest>>;
}

#[derive(Debug, Default)]
struct MemoryEntry {
    status: Option<JobStatus>,
    control: ControlRequest,
}

/// In-process task store
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskStore for MemoryTaskStore {
    fn save(&self, task_id: &str, status: &JobStatus) -> StoreResult<()> {
        self.tasks.lock().entry(task_id.to_string()).or_default().status = Some(status.clone());
        Ok(())
    }

    fn load(&self, task_id: &str) -> StoreResult<Option<JobStatus>> {
        Ok(self.tasks.lock().get(task_id).and_then(|e| e.status.clone()))
    }

    fn request_cancel(&self, task_id: &str) -> StoreResult<bool> {
        Ok(match self.tasks.lock().get_mut(task_id) {
            Some(entry) => {
                entry.control.cancel = true;
                true
            }
            None => false,
        })
    }

    fn request_rethrottle(&self, task_id: &str, rps: RequestsPerSecond) -> StoreResult<bool> {
        Ok(match self.tasks.lock().get_mut(task_id) {
            Some(entry) => {
                entry.control.requests_per_second = Some(rps);
                true
            }
            None => false,
        })
    }

    fn take_control(&self, task_id: &str) -> StoreResult<Option<ControlRequest>> {
        Ok(self
            .tasks
            .lock()
            .get_mut(task_id)
            .map(|e| std::mem::take(&mut e.control))
            .filter(|c| !c.is_empty()))
    }
}

const UPSERT_TASK: &str = "INSERT INTO tasks (task_id, status_json, state, updated_at)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT(task_id) DO UPDATE SET
         status_json = excluded.status_json,
         state = excluded.state,
         updated_at = excluded.updated_at";

/// Task store in a SQLite file, shared between processes
#[derive(Debug)]
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (or create) a task database
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        schema::create_task_database(&conn)?;
        debug!(path = %path.as_ref().display(), "Opened task store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::create_task_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Task ids with their state and last update time, newest first
    pub fn list(&self) -> StoreResult<Vec<(String, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT task_id, state, updated_at FROM tasks ORDER BY updated_at DESC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl TaskStore for SqliteTaskStore {
    fn save(&self, task_id: &str, status: &JobStatus) -> StoreResult<()> {
        let json = serde_json::to_string(status)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(UPSERT_TASK)?;
        stmt.execute(params![
            task_id,
            json,
            status.state.as_str(),
            Utc::now().to_rfc3339()
        ])?;
        Ok(())
    }

    fn load(&self, task_id: &str) -> StoreResult<Option<JobStatus>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT status_json FROM tasks WHERE task_id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    fn request_cancel(&self, task_id: &str) -> StoreResult<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE tasks SET cancel_requested = 1 WHERE task_id = ?1",
            [task_id],
        )?;
        Ok(changed > 0)
    }

    fn request_rethrottle(&self, task_id: &str, rps: RequestsPerSecond) -> StoreResult<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE tasks SET requested_rps = ?2 WHERE task_id = ?1",
            params![task_id, rps.as_f64()],
        )?;
        Ok(changed > 0)
    }

    fn take_control(&self, task_id: &str) -> StoreResult<Option<ControlRequest>> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let row: Option<(i64, Option<f64>)> = tx
            .query_row(
                "SELECT cancel_requested, requested_rps FROM tasks WHERE task_id = ?1",
                [task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((cancel, rps)) = row else {
            return Ok(None);
        };

        let requests_per_second = rps
            .map(|value| {
                RequestsPerSecond::new(value)
                    .map_err(|e| StoreError::Corrupt(format!("task {}: {}", task_id, e)))
            })
            .transpose()?;
        let control = ControlRequest {
            cancel: cancel != 0,
            requests_per_second,
        };
        if control.is_empty() {
            return Ok(None);
        }

        tx.execute(
            "UPDATE tasks SET cancel_requested = 0, requested_rps = NULL WHERE task_id = ?1",
            [task_id],
        )?;
        tx.commit()?;
        Ok(Some(control))
    }
}
