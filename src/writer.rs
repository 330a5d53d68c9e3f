//! Bulk submission
//!
//! [`BatchWriter`] submits one batch of directives to a [`BulkSink`],
//! resubmits requests the destination rejected because it was overloaded,
//! and checks that the outcomes line up with the directives.

use crate::doc::{BulkItemOutcome, WriteDirective};
use crate::error::WriteError;
use crate::status::Failure;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// A bulk write backend
pub trait BulkSink: Send + Sync {
    /// Apply `directives` in order, returning one outcome per directive
    fn bulk(&self, directives: &[WriteDirective]) -> Result<Vec<BulkItemOutcome>, WriteError>;
}

/// Backoff for rejected bulk requests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            initial_backoff: crate::config::DEFAULT_RETRY_BACKOFF,
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), or `None` once retries
    /// are exhausted. `delay_n = initial * factor^n`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff);
        Some(delay.min(self.max_backoff))
    }
}

/// Outcomes of one batch plus the number of resubmissions it took
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub outcomes: Vec<BulkItemOutcome>,
    pub retries: u32,
}

/// Submits batches to a sink
#[derive(Clone)]
pub struct BatchWriter {
    sink: Arc<dyn BulkSink>,
    retry: RetryPolicy,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn BulkSink>, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    /// Submit `directives` and return position-aligned outcomes.
    ///
    /// Rejections are retried with backoff; any other whole-request error,
    /// or a response with the wrong number of items, is returned as is.
    pub fn write(&self, directives: &[WriteDirective]) -> Result<WriteReport, WriteError> {
        if directives.is_empty() {
            return Ok(WriteReport::default());
        }

        let mut retries = 0;
        loop {
            match self.sink.bulk(directives) {
                Ok(outcomes) => {
                    if outcomes.len() != directives.len() {
                        return Err(WriteError::Misaligned {
                            expected: directives.len(),
                            actual: outcomes.len(),
                        });
                    }
                    return Ok(WriteReport { outcomes, retries });
                }
                Err(e) if e.is_retryable() => match self.retry.backoff(retries) {
                    Some(delay) => {
                        debug!(attempt = retries + 1, delay_ms = delay.as_millis() as u64, error = %e, "Bulk rejected, retrying");
                        thread::sleep(delay);
                        retries += 1;
                    }
                    None => {
                        warn!(retries, error = %e, "Bulk rejected, giving up");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Outcomes of one batch folded into counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub noops: u64,
    pub version_conflicts: u64,

    /// Item failures other than version conflicts
    pub failures: Vec<Failure>,

    /// First version conflict in the batch, if any
    pub first_conflict: Option<Failure>,
}

impl BatchSummary {
    /// Number of items accounted for
    pub fn processed(&self) -> u64 {
        self.created + self.updated + self.deleted + self.noops + self.version_conflicts
            + self.failures.len() as u64
    }
}

/// Fold aligned outcomes into a summary
pub fn classify(directives: &[WriteDirective], outcomes: &[BulkItemOutcome]) -> BatchSummary {
    let mut summary = BatchSummary::default();

    for (directive, outcome) in directives.iter().zip(outcomes) {
        match outcome {
            BulkItemOutcome::Created => summary.created += 1,
            BulkItemOutcome::Updated => summary.updated += 1,
            BulkItemOutcome::Deleted => summary.deleted += 1,
            BulkItemOutcome::Noop => summary.noops += 1,
            BulkItemOutcome::VersionConflict { id } => {
                summary.version_conflicts += 1;
                if summary.first_conflict.is_none() {
                    summary.first_conflict = Some(Failure::version_conflict(&directive.index, id));
                }
            }
            BulkItemOutcome::Failure { id, cause } => {
                summary.failures.push(Failure::item(&directive.index, id, cause));
            }
        }
    }

    summary
}
