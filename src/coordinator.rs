//! Job coordinator
//!
//! Splits a job into slices, runs one [`SliceWorker`] per slice, and merges
//! their outcomes into the final [`JobStatus`]. A single-slice job is just
//! the degenerate case: one worker reading without a slice filter.

use crate::config::JobRequest;
use crate::cursor::{ScrollRequest, ScrollSource};
use crate::error::Result;
use crate::rate::RateController;
use crate::script::ScriptRegistry;
use crate::slice::SliceSpec;
use crate::status::{codes, Failure, JobState, JobStatus};
use crate::task::store::MemoryTaskStore;
use crate::task::{JobStatusReporter, SliceHandle};
use crate::transform::RecordTransformer;
use crate::worker::{SliceStats, SliceTask, SliceWorker, Terminal};
use crate::writer::{BatchWriter, BulkSink, RetryPolicy};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs reindex jobs between a source and a sink
#[derive(Clone)]
pub struct SliceCoordinator {
    source: Arc<dyn ScrollSource>,
    sink: Arc<dyn BulkSink>,
    scripts: Arc<ScriptRegistry>,
}

impl SliceCoordinator {
    /// Coordinator with the built-in scripts
    pub fn new(source: Arc<dyn ScrollSource>, sink: Arc<dyn BulkSink>) -> Self {
        Self::with_scripts(source, sink, ScriptRegistry::builtin())
    }

    pub fn with_scripts(
        source: Arc<dyn ScrollSource>,
        sink: Arc<dyn BulkSink>,
        scripts: ScriptRegistry,
    ) -> Self {
        Self {
            source,
            sink,
            scripts: Arc::new(scripts),
        }
    }

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    /// Validate parts of a request that depend on this coordinator
    pub fn check(&self, request: &JobRequest) -> Result<()> {
        if let Some(spec) = request.script() {
            self.scripts.resolve(spec)?;
        }
        Ok(())
    }

    /// Run a job to completion, keeping its status in memory only
    pub fn run(&self, request: &JobRequest) -> Result<JobStatus> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let reporter = Arc::new(JobStatusReporter::new(
            task_id,
            Arc::new(MemoryTaskStore::new()),
            request,
        ));
        self.run_with_reporter(request, reporter)
    }

    /// Run a job to completion, publishing progress through `reporter`
    pub fn run_with_reporter(
        &self,
        request: &JobRequest,
        reporter: Arc<JobStatusReporter>,
    ) -> Result<JobStatus> {
        let script = request
            .script()
            .map(|spec| self.scripts.resolve(spec))
            .transpose()?;
        let transformer = Arc::new(RecordTransformer::new(request.destination().clone(), script));
        let writer = BatchWriter::new(
            Arc::clone(&self.sink),
            RetryPolicy {
                max_retries: request.max_retries(),
                initial_backoff: request.retry_backoff(),
                ..RetryPolicy::default()
            },
        );

        let slice_count = request.slices();
        let budgets = split_budget(request.max_docs_limit(), slice_count);
        let search = request.search();

        info!(
            task = %reporter.task_id(),
            description = %request.describe(),
            slices = slice_count,
            rps = %request.requests_per_second(),
            "Starting reindex"
        );
        reporter.publish(reporter.live_status());

        let mut workers = Vec::with_capacity(slice_count as usize);
        for (spec, budget) in SliceSpec::partition(slice_count).into_iter().zip(budgets) {
            let task = SliceTask {
                slice_id: spec.id,
                scroll: ScrollRequest {
                    indices: search.indices.clone(),
                    types: search.types.clone(),
                    query: search.query.clone(),
                    slice: (slice_count > 1).then_some(spec),
                    size: request.effective_batch_size(),
                    keep_alive: search.keep_alive,
                },
                source: Arc::clone(&self.source),
                transformer: Arc::clone(&transformer),
                writer: writer.clone(),
                max_docs: budget,
                abort_on_version_conflict: request.abort_on_version_conflict(),
            };

            let stats = Arc::new(SliceStats::new(spec.id, request.max_failures()));
            let rate = Arc::new(RateController::new(request.requests_per_second()));
            reporter.register_slice(SliceHandle {
                slice_id: spec.id,
                stats: Arc::clone(&stats),
                rate: Arc::clone(&rate),
            });

            match SliceWorker::spawn(task, stats, rate, Arc::clone(&reporter)) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    error!(slice = spec.id, error = %e, "Failed to start slice");
                    reporter.cancel("slice failed to start");
                    for worker in workers {
                        let _ = worker.join();
                    }
                    return Err(e.into());
                }
            }
        }

        let mut failed: Option<Failure> = None;
        for worker in workers {
            let slice_id = worker.slice_id();
            let terminal = match worker.join() {
                Ok(terminal) => terminal,
                Err(e) => {
                    error!(slice = slice_id, error = %e, "Slice worker panicked");
                    let terminal = Terminal::Failed(Failure::slice(e.to_string(), codes::INTERNAL));
                    if let Some(stats) = worker_stats(&reporter, slice_id) {
                        stats.finish(&terminal);
                    }
                    terminal
                }
            };
            if let Terminal::Failed(failure) = terminal {
                failed.get_or_insert(failure);
            }
        }

        let mut status = reporter.live_status();
        status.throttled_until_millis = 0;
        (status.state, status.reason) = if let Some(cause) = reporter.abort_cause() {
            (JobState::Failed, Some(cause.failure.cause))
        } else if let Some(failure) = failed {
            (JobState::Failed, Some(failure.cause))
        } else if reporter.is_cancelled() {
            (JobState::Cancelled, None)
        } else {
            (JobState::Completed, None)
        };

        match status.state {
            JobState::Failed => warn!(
                task = %reporter.task_id(),
                reason = status.reason.as_deref().unwrap_or(""),
                "Reindex failed"
            ),
            state => info!(
                task = %reporter.task_id(),
                state = %state,
                created = status.counters.created,
                updated = status.counters.updated,
                conflicts = status.counters.version_conflicts,
                took_ms = status.took,
                "Reindex finished"
            ),
        }

        reporter.publish(status.clone());
        Ok(status)
    }
}

fn worker_stats(reporter: &JobStatusReporter, slice_id: u32) -> Option<Arc<SliceStats>> {
    reporter
        .slices()
        .into_iter()
        .find(|h| h.slice_id == slice_id)
        .map(|h| h.stats)
}

/// Share a document budget between slices: each gets `max / n`, and the
/// first `max % n` slices one more.
fn split_budget(max_docs: Option<u64>, slices: u32) -> Vec<Option<u64>> {
    let n = slices.max(1) as u64;
    (0..n)
        .map(|i| max_docs.map(|max| max / n + u64::from(i < max % n)))
        .collect()
}
