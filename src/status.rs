//! Job and slice status
//!
//! These are the consumer-visible records: what `status` prints, what the
//! task store persists, and what a finished job returns. All of them
//! serialize to JSON with serde.

use crate::config::RequestsPerSecond;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

/// HTTP-style status codes used in failure entries
pub mod codes {
    pub const CONFLICT: u16 = 409;
    pub const BAD_REQUEST: u16 = 400;
    pub const INTERNAL: u16 = 500;
}

/// Lifecycle of a job or slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        self != JobState::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "cancelled" => Ok(JobState::Cancelled),
            "failed" => Ok(JobState::Failed),
            other => Err(ConfigError::InvalidParam {
                value: other.to_string(),
            }),
        }
    }
}

/// One entry of a status's failure list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub index: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,

    pub cause: String,
    pub status: u16,
}

impl Failure {
    /// A rejected write for one document
    pub fn item(index: &str, id: &str, cause: &str) -> Self {
        Self {
            index: Some(index.to_string()),
            id: Some(id.to_string()),
            cause: cause.to_string(),
            status: codes::INTERNAL,
        }
    }

    /// A version conflict for one document
    pub fn version_conflict(index: &str, id: &str) -> Self {
        Self {
            index: Some(index.to_string()),
            id: Some(id.to_string()),
            cause: format!("[{}]: version conflict", id),
            status: codes::CONFLICT,
        }
    }

    /// A failure not tied to a single write, such as a lost cursor
    pub fn slice(cause: impl Into<String>, status: u16) -> Self {
        Self {
            index: None,
            id: None,
            cause: cause.into(),
            status,
        }
    }
}

/// Failure list that keeps the oldest `cap` entries and counts all of them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundedFailures {
    items: Vec<Failure>,
    count: u64,
    cap: usize,
}

impl BoundedFailures {
    pub fn new(cap: usize) -> Self {
        Self {
            items: Vec::new(),
            count: 0,
            cap,
        }
    }

    pub fn push(&mut self, failure: Failure) {
        self.count += 1;
        if self.items.len() < self.cap {
            self.items.push(failure);
        }
    }

    /// Append another list, keeping its exact count
    pub fn extend_from(&mut self, other: &[Failure], other_count: u64) {
        for failure in other {
            if self.items.len() >= self.cap {
                break;
            }
            self.items.push(failure.clone());
        }
        self.count += other_count;
    }

    pub fn items(&self) -> &[Failure] {
        &self.items
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_parts(self) -> (Vec<Failure>, u64) {
        (self.items, self.count)
    }
}

/// Counters shared by job and slice statuses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub batches: u64,
    pub version_conflicts: u64,
    pub noops: u64,
    pub retries: u64,
    pub throttled_millis: u64,
}

impl Counters {
    /// Documents with a final outcome
    pub fn processed(&self) -> u64 {
        self.created + self.updated + self.deleted + self.noops + self.version_conflicts
    }
}

impl AddAssign for Counters {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.batches += other.batches;
        self.version_conflicts += other.version_conflicts;
        self.noops += other.noops;
        self.retries += other.retries;
        self.throttled_millis += other.throttled_millis;
    }
}

/// Status of one slice of a sliced job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceStatus {
    pub slice_id: u32,
    pub state: JobState,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,

    #[serde(flatten)]
    pub counters: Counters,

    pub requests_per_second: RequestsPerSecond,
    pub throttled_until_millis: u64,
}

/// Status of a whole job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task_id: Option<String>,

    pub description: String,
    pub state: JobState,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,

    /// Milliseconds since the job started (slowest slice once finished)
    pub took: u64,

    /// Always false; bulk requests time out per item, not per job
    pub timed_out: bool,

    #[serde(flatten)]
    pub counters: Counters,

    pub requests_per_second: RequestsPerSecond,
    pub throttled_until_millis: u64,

    pub failures: Vec<Failure>,

    /// Exact number of failures, including those dropped from `failures`
    pub failure_count: u64,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub slices: Vec<SliceStatus>,
}

impl JobStatus {
    /// Status of a job that has not processed anything yet
    pub fn running(description: impl Into<String>, requests_per_second: RequestsPerSecond) -> Self {
        Self {
            task_id: None,
            description: description.into(),
            state: JobState::Running,
            reason: None,
            took: 0,
            timed_out: false,
            counters: Counters::default(),
            requests_per_second,
            throttled_until_millis: 0,
            failures: Vec::new(),
            failure_count: 0,
            slices: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Combine slice reports into one job status.
    ///
    /// Counters are summed, failures are concatenated in slice order keeping
    /// the oldest `max_failures`, and `took` is the slowest slice's. The
    /// per-slice list is only kept when the job is `sliced`.
    pub fn merge(
        description: &str,
        requests_per_second: RequestsPerSecond,
        max_failures: usize,
        sliced: bool,
        reports: Vec<SliceReport>,
    ) -> Self {
        let mut status = JobStatus::running(description, requests_per_second);
        let mut failures = BoundedFailures::new(max_failures);
        let mut throttled_until: Option<u64> = None;

        for report in &reports {
            status.counters += report.status.counters;
            status.took = status.took.max(report.took);
            failures.extend_from(&report.failures, report.failure_count);
            let until = report.status.throttled_until_millis;
            throttled_until = Some(throttled_until.map_or(until, |t| t.min(until)));
        }

        let (items, count) = failures.into_parts();
        status.failures = items;
        status.failure_count = count;
        status.throttled_until_millis = throttled_until.unwrap_or(0);
        if sliced {
            status.slices = reports.into_iter().map(|r| r.status).collect();
        }
        status
    }
}

/// One slice's contribution to a job status
#[derive(Debug, Clone, PartialEq)]
pub struct SliceReport {
    pub status: SliceStatus,
    pub failures: Vec<Failure>,
    pub failure_count: u64,

    /// Milliseconds the slice has run (or ran)
    pub took: u64,
}
