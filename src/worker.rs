//! Slice worker threads
//!
//! Each worker owns one scroll over its slice and drives it through an
//! explicit state machine:
//!
//! ```text
//! Opening -> Fetching -> Throttling -> Transforming -> Writing -> Classifying
//!               ^                                                      |
//!               +------------------------------------------------------+
//! any state -> Closing(Done | Cancelled | Failed) -> Finished
//! ```
//!
//! A page is fetched before the wait owed by the previous batch, and the
//! fetch extends the scroll lease by that wait. Cancellation is checked
//! before each fetch and after each wait, never in the middle of a bulk
//! write. The scroll is closed on every exit path.

use crate::cursor::{CursorSession, ScrollRequest, ScrollSource};
use crate::doc::{SourceRecord, WriteDirective};
use crate::error::{ReindexError, WorkerError};
use crate::rate::RateController;
use crate::status::{codes, BoundedFailures, Counters, Failure, JobState, SliceReport, SliceStatus};
use crate::task::JobStatusReporter;
use crate::transform::RecordTransformer;
use crate::writer::{classify, BatchWriter, WriteReport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Counters and outcome of one slice
#[derive(Debug)]
pub struct SliceStats {
    slice_id: u32,

    pub total: AtomicU64,
    pub created: AtomicU64,
    pub updated: AtomicU64,
    pub deleted: AtomicU64,
    pub batches: AtomicU64,
    pub version_conflicts: AtomicU64,
    pub noops: AtomicU64,
    pub retries: AtomicU64,
    pub throttled_millis: AtomicU64,

    failures: Mutex<BoundedFailures>,
    outcome: Mutex<(JobState, Option<String>)>,
    started: Instant,
    took: Mutex<Option<Duration>>,
}

impl SliceStats {
    pub fn new(slice_id: u32, max_failures: usize) -> Self {
        Self {
            slice_id,
            total: AtomicU64::new(0),
            created: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            version_conflicts: AtomicU64::new(0),
            noops: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            throttled_millis: AtomicU64::new(0),
            failures: Mutex::new(BoundedFailures::new(max_failures)),
            outcome: Mutex::new((JobState::Running, None)),
            started: Instant::now(),
            took: Mutex::new(None),
        }
    }

    pub fn slice_id(&self) -> u32 {
        self.slice_id
    }

    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    fn record_noops(&self, count: u64) {
        self.noops.fetch_add(count, Ordering::Relaxed);
    }

    fn record_retries(&self, count: u64) {
        self.retries.fetch_add(count, Ordering::Relaxed);
    }

    fn record_throttled(&self, waited: Duration) {
        self.throttled_millis
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }

    fn record_writes(&self, created: u64, updated: u64, deleted: u64, noops: u64, conflicts: u64) {
        self.created.fetch_add(created, Ordering::Relaxed);
        self.updated.fetch_add(updated, Ordering::Relaxed);
        self.deleted.fetch_add(deleted, Ordering::Relaxed);
        self.noops.fetch_add(noops, Ordering::Relaxed);
        self.version_conflicts.fetch_add(conflicts, Ordering::Relaxed);
    }

    fn record_failure(&self, failure: Failure) {
        self.failures.lock().push(failure);
    }

    /// Mark the slice finished; a failure is also added to the failure list
    pub fn finish(&self, terminal: &Terminal) {
        let (state, reason) = match terminal {
            Terminal::Done => (JobState::Completed, None),
            Terminal::Cancelled => (JobState::Cancelled, None),
            Terminal::Failed(failure) => {
                self.record_failure(failure.clone());
                (JobState::Failed, Some(failure.cause.clone()))
            }
        };
        *self.outcome.lock() = (state, reason);
        *self.took.lock() = Some(self.started.elapsed());
    }

    pub fn state(&self) -> JobState {
        self.outcome.lock().0
    }

    /// Running time, frozen once the slice finishes
    pub fn took(&self) -> Duration {
        self.took.lock().unwrap_or_else(|| self.started.elapsed())
    }

    pub fn counters(&self) -> Counters {
        Counters {
            total: self.total.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            noops: self.noops.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            throttled_millis: self.throttled_millis.load(Ordering::Relaxed),
        }
    }

    /// Snapshot for status merging
    pub fn report(&self, rate: &RateController) -> SliceReport {
        let (state, reason) = self.outcome.lock().clone();
        let failures = self.failures.lock();
        let throttled_until_millis = if state.is_terminal() {
            0
        } else {
            rate.remaining().as_millis() as u64
        };

        SliceReport {
            status: SliceStatus {
                slice_id: self.slice_id,
                state,
                reason,
                counters: self.counters(),
                requests_per_second: rate.rate(),
                throttled_until_millis,
            },
            failures: failures.items().to_vec(),
            failure_count: failures.count(),
            took: self.took().as_millis() as u64,
        }
    }
}

/// How a slice ended
#[derive(Debug, Clone, PartialEq)]
pub enum Terminal {
    Done,
    Cancelled,
    Failed(Failure),
}

/// Worker states
enum SliceState {
    Opening,
    Fetching,
    Transforming(Vec<SourceRecord>),
    Writing(Vec<WriteDirective>),
    Classifying(Vec<WriteDirective>, WriteReport),
    Throttling(Vec<SourceRecord>),
    Closing(Terminal),
    Finished(Terminal),
}

impl SliceState {
    fn name(&self) -> &'static str {
        match self {
            SliceState::Opening => "opening",
            SliceState::Fetching => "fetching",
            SliceState::Transforming(_) => "transforming",
            SliceState::Writing(_) => "writing",
            SliceState::Classifying(..) => "classifying",
            SliceState::Throttling(_) => "throttling",
            SliceState::Closing(_) => "closing",
            SliceState::Finished(_) => "finished",
        }
    }
}

/// Everything a slice needs to run
#[derive(Clone)]
pub struct SliceTask {
    pub slice_id: u32,
    pub scroll: ScrollRequest,
    pub source: Arc<dyn ScrollSource>,
    pub transformer: Arc<RecordTransformer>,
    pub writer: BatchWriter,

    /// Document budget for this slice
    pub max_docs: Option<u64>,

    pub abort_on_version_conflict: bool,
}

/// A running slice
pub struct SliceWorker {
    slice_id: u32,
    handle: Option<JoinHandle<Terminal>>,
    stats: Arc<SliceStats>,
}

impl SliceWorker {
    /// Spawn the worker thread
    pub fn spawn(
        task: SliceTask,
        stats: Arc<SliceStats>,
        rate: Arc<RateController>,
        reporter: Arc<JobStatusReporter>,
    ) -> Result<Self, WorkerError> {
        let slice_id = task.slice_id;
        let stats_clone = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name(format!("slice-{}", slice_id))
            .spawn(move || {
                let cancel = reporter.cancel_flag();
                let terminal = run_slice(&task, &stats_clone, &rate, &cancel, &reporter);
                stats_clone.finish(&terminal);
                reporter.publish(reporter.live_status());
                terminal
            })
            .map_err(|e| WorkerError::SpawnFailed {
                slice: slice_id,
                reason: e.to_string(),
            })?;

        Ok(Self {
            slice_id,
            handle: Some(handle),
            stats,
        })
    }

    pub fn slice_id(&self) -> u32 {
        self.slice_id
    }

    pub fn stats(&self) -> &SliceStats {
        &self.stats
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<Terminal, WorkerError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|payload| WorkerError::Panicked {
                slice: self.slice_id,
                message: panic_message(payload.as_ref()),
            }),
            None => Ok(Terminal::Done),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Worker thread panicked".into()
    }
}

fn fail(error: ReindexError) -> SliceState {
    debug_assert!(error.is_fatal_for_slice());
    let status = match error {
        ReindexError::Transform(_) => codes::BAD_REQUEST,
        _ => codes::INTERNAL,
    };
    SliceState::Closing(Terminal::Failed(Failure::slice(error.to_string(), status)))
}

/// Main slice loop
fn run_slice(
    task: &SliceTask,
    stats: &SliceStats,
    rate: &RateController,
    cancel: &AtomicBool,
    reporter: &JobStatusReporter,
) -> Terminal {
    let slice = task.slice_id;
    let mut cursor: Option<CursorSession> = None;
    let mut remaining = task.max_docs;
    let mut state = SliceState::Opening;

    debug!(slice, size = task.scroll.size, "Slice starting");

    loop {
        trace!(slice, state = state.name(), "Slice state");

        state = match state {
            SliceState::Opening => {
                if cancel.load(Ordering::Relaxed) {
                    SliceState::Closing(Terminal::Cancelled)
                } else {
                    match CursorSession::open(Arc::clone(&task.source), &task.scroll) {
                        Ok(session) => {
                            let matched = session.matched();
                            stats.set_total(remaining.map_or(matched, |budget| budget.min(matched)));
                            cursor = Some(session);
                            SliceState::Fetching
                        }
                        Err(e) => fail(e.into()),
                    }
                }
            }

            SliceState::Fetching => {
                if cancel.load(Ordering::Relaxed) {
                    SliceState::Closing(Terminal::Cancelled)
                } else if remaining == Some(0) {
                    SliceState::Closing(Terminal::Done)
                } else {
                    let extra_keep_alive = rate.remaining();
                    let fetched = match cursor.as_mut() {
                        Some(session) => session.next_batch(extra_keep_alive),
                        None => Ok(Vec::new()),
                    };

                    match fetched {
                        Ok(hits) if hits.is_empty() => SliceState::Closing(Terminal::Done),
                        Ok(mut hits) => {
                            if let Some(budget) = remaining {
                                hits.truncate(budget as usize);
                                remaining = Some(budget - hits.len() as u64);
                            }
                            stats.record_batch();
                            trace!(slice, batch = hits.len(), "Fetched batch");
                            SliceState::Throttling(hits)
                        }
                        Err(e) => fail(e.into()),
                    }
                }
            }

            SliceState::Transforming(hits) => match task.transformer.transform_batch(&hits) {
                Ok((directives, dropped)) => {
                    stats.record_noops(dropped as u64);
                    SliceState::Writing(directives)
                }
                Err(e) => fail(e.into()),
            },

            SliceState::Writing(directives) => {
                if directives.is_empty() {
                    reporter.publish(reporter.live_status());
                    SliceState::Fetching
                } else {
                    match task.writer.write(&directives) {
                        Ok(report) => SliceState::Classifying(directives, report),
                        Err(e) => fail(e.into()),
                    }
                }
            }

            SliceState::Classifying(directives, report) => {
                stats.record_retries(report.retries as u64);
                let summary = classify(&directives, &report.outcomes);
                stats.record_writes(
                    summary.created,
                    summary.updated,
                    summary.deleted,
                    summary.noops,
                    summary.version_conflicts,
                );
                for failure in summary.failures {
                    stats.record_failure(failure);
                }

                match summary.first_conflict {
                    Some(conflict) if task.abort_on_version_conflict => {
                        reporter.abort(slice, conflict.clone());
                        SliceState::Closing(Terminal::Failed(conflict))
                    }
                    _ => {
                        reporter.publish(reporter.live_status());
                        SliceState::Fetching
                    }
                }
            }

            SliceState::Throttling(hits) => {
                let waited = rate.wait_until_ready(cancel);
                if !waited.is_zero() {
                    stats.record_throttled(waited);
                }
                if cancel.load(Ordering::Relaxed) {
                    SliceState::Closing(Terminal::Cancelled)
                } else {
                    rate.schedule(Instant::now(), hits.len());
                    SliceState::Transforming(hits)
                }
            }

            SliceState::Closing(terminal) => {
                if let Some(mut session) = cursor.take() {
                    session.close();
                }
                match &terminal {
                    Terminal::Done => info!(slice, batches = stats.batches.load(Ordering::Relaxed), "Slice done"),
                    Terminal::Cancelled => info!(slice, "Slice cancelled"),
                    Terminal::Failed(failure) => warn!(slice, cause = %failure.cause, "Slice failed"),
                }
                SliceState::Finished(terminal)
            }

            SliceState::Finished(terminal) => return terminal,
        };
    }
}
