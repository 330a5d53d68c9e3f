//! bulk-reindex - Throttled, sliced bulk-by-scroll reindexing
//!
//! Copies documents from one index to another by reading them through a
//! paginated scroll cursor, optionally rewriting each one with a named
//! script, and writing the results back in bulk. Jobs can be throttled and
//! rethrottled while they run, cancelled, split into parallel slices, and
//! queried for status from another process.
//!
//! # Features
//!
//! - **Slicing**: a job is split into N slices by hashing document ids;
//!   each slice runs its own cursor on its own thread.
//!
//! - **Throttling**: `requests_per_second` is shared between slices and can
//!   be changed mid-flight. Speeding up shortens a pending wait; slowing
//!   down applies from the next batch.
//!
//! - **Version handling**: `internal`, `external`, `external_gte`, `force`
//!   and `reindex` version types, with conflicts either counted or fatal.
//!
//! - **Task status**: progress is persisted to a SQLite task table that a
//!   separate process can read, and use to cancel or rethrottle the job.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────────┐
//!                     │     TaskManager      │  submit / status / cancel
//!                     │  (JobStatusReporter) │  rethrottle / wait
//!                     └──────────┬───────────┘
//!                                │
//!                                ▼
//!                     ┌──────────────────────┐
//!                     │   SliceCoordinator   │  fnv1a32(id) % n
//!                     └──────────┬───────────┘
//!            ┌───────────────────┼───────────────────┐
//!            ▼                   ▼                   ▼
//!      ┌───────────┐       ┌───────────┐       ┌───────────┐
//!      │  slice-0  │       │  slice-1  │  ...  │  slice-N  │
//!      └─────┬─────┘       └─────┬─────┘       └─────┬─────┘
//!            │                   │                   │
//!            ▼                   ▼                   ▼
//!   CursorSession ──▶ RecordTransformer ──▶ BatchWriter ──▶ RateController
//!   (ScrollSource)      (Script)            (BulkSink)      (throttle wait)
//! ```
//!
//! # Example
//!
//! ```bash
//! # Copy an index between two SQLite files
//! bulk-reindex reindex src.db twitter dst.db new_twitter
//!
//! # Four slices, throttled to 500 docs/s
//! bulk-reindex reindex src.db twitter dst.db new_twitter --slices 4 --requests-per-second 500
//!
//! # From another shell: lift the throttle
//! bulk-reindex rethrottle --tasks-db tasks.db <TASK_ID> -1
//! ```

pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod doc;
pub mod error;
pub mod progress;
pub mod rate;
pub mod script;
pub mod slice;
pub mod status;
pub mod store;
pub mod task;
pub mod transform;
pub mod worker;
pub mod writer;

pub use config::{CliArgs, JobRequest, RequestsPerSecond};
pub use coordinator::SliceCoordinator;
pub use cursor::{CursorSession, ScrollSource};
pub use error::{ReindexError, Result};
pub use status::{JobState, JobStatus};
pub use store::{MemoryIndex, SqliteIndex};
pub use task::{MemoryTaskStore, SqliteTaskStore, TaskManager, TaskStore};
pub use writer::BulkSink;
