//! Job-level status publication and control
//!
//! One [`JobStatusReporter`] exists per job. Slices register their stats and
//! rate controllers with it; it owns the job's cancel flag, remembers why
//! the job was aborted, fans rethrottles out to every slice, and persists
//! status snapshots through a [`TaskStore`] without ever running two
//! persistence calls for the same job at once.

use super::store::TaskStore;
use crate::config::{JobRequest, RequestsPerSecond};
use crate::rate::RateController;
use crate::status::{Failure, JobStatus};
use crate::worker::SliceStats;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why the job was aborted
#[derive(Debug, Clone, PartialEq)]
pub struct AbortCause {
    pub slice_id: u32,
    pub failure: Failure,
}

/// A slice as seen by the reporter
#[derive(Debug, Clone)]
pub struct SliceHandle {
    pub slice_id: u32,
    pub stats: Arc<SliceStats>,
    pub rate: Arc<RateController>,
}

#[derive(Debug, Default)]
struct PublishSlot {
    in_flight: bool,
    pending: Option<JobStatus>,
}

/// Status and control hub for one job
pub struct JobStatusReporter {
    task_id: String,
    description: String,
    max_failures: usize,
    slice_count: u32,
    store: Arc<dyn TaskStore>,
    cancel: Arc<AtomicBool>,
    abort_cause: Mutex<Option<AbortCause>>,
    slices: Mutex<Vec<SliceHandle>>,
    requests_per_second: Mutex<RequestsPerSecond>,
    publish: Mutex<PublishSlot>,
}

impl JobStatusReporter {
    pub fn new(task_id: impl Into<String>, store: Arc<dyn TaskStore>, request: &JobRequest) -> Self {
        Self {
            task_id: task_id.into(),
            description: request.describe(),
            max_failures: request.max_failures(),
            slice_count: request.slices().max(1),
            store,
            cancel: Arc::new(AtomicBool::new(false)),
            abort_cause: Mutex::new(None),
            slices: Mutex::new(Vec::new()),
            requests_per_second: Mutex::new(request.requests_per_second()),
            publish: Mutex::new(PublishSlot::default()),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Shared cancel flag handed to slice workers
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Ask every slice to stop after its current step
    pub fn cancel(&self, reason: &str) {
        if !self.cancel.swap(true, Ordering::SeqCst) {
            info!(task = %self.task_id, reason, "Cancelling job");
        }
        for slice in self.slices.lock().iter() {
            slice.rate.interrupt();
        }
    }

    /// Fail the job: the first caller's cause is kept and siblings cancelled
    pub fn abort(&self, slice_id: u32, failure: Failure) {
        {
            let mut cause = self.abort_cause.lock();
            if cause.is_some() {
                return;
            }
            warn!(task = %self.task_id, slice = slice_id, cause = %failure.cause, "Aborting job");
            *cause = Some(AbortCause { slice_id, failure });
        }
        self.cancel("aborted");
    }

    pub fn abort_cause(&self) -> Option<AbortCause> {
        self.abort_cause.lock().clone()
    }

    /// Make a slice visible to rethrottle and live status
    pub fn register_slice(&self, handle: SliceHandle) {
        let mut slices = self.slices.lock();
        handle
            .rate
            .set_rate(self.requests_per_second.lock().per_slice(self.slice_count));
        slices.push(handle);
    }

    /// Registered slices, in slice order
    pub fn slices(&self) -> Vec<SliceHandle> {
        let mut slices = self.slices.lock().clone();
        slices.sort_by_key(|s| s.slice_id);
        slices
    }

    pub fn requests_per_second(&self) -> RequestsPerSecond {
        *self.requests_per_second.lock()
    }

    /// Change the job's rate. All slices see the new per-slice rate, or
    /// none do if the job has no slices registered yet.
    pub fn rethrottle(&self, rps: RequestsPerSecond) {
        let slices = self.slices.lock();
        *self.requests_per_second.lock() = rps;
        let per_slice = rps.per_slice(self.slice_count);
        for slice in slices.iter() {
            slice.rate.set_rate(per_slice);
        }
        info!(task = %self.task_id, rps = %rps, slices = slices.len(), "Rethrottled job");
    }

    pub fn slice_count(&self) -> u32 {
        self.slice_count
    }

    /// Status merged from every registered slice. The job is reported as
    /// running; the coordinator decides the final state.
    pub fn live_status(&self) -> JobStatus {
        let reports = self
            .slices()
            .iter()
            .map(|h| h.stats.report(&h.rate))
            .collect();
        JobStatus::merge(
            &self.description,
            self.requests_per_second(),
            self.max_failures,
            self.slice_count > 1,
            reports,
        )
        .with_task_id(self.task_id.clone())
    }

    /// Persist a status snapshot.
    ///
    /// If another publish is in progress the status is parked in a single
    /// pending slot (replacing anything already parked) and the in-flight
    /// publisher writes it before returning.
    pub fn publish(&self, status: JobStatus) {
        {
            let mut slot = self.publish.lock();
            if slot.in_flight {
                slot.pending = Some(status);
                return;
            }
            slot.in_flight = true;
        }

        let mut next = Some(status);
        while let Some(status) = next.take() {
            if let Err(e) = self.store.save(&self.task_id, &status) {
                warn!(task = %self.task_id, error = %e, "Failed to persist job status");
            } else {
                debug!(task = %self.task_id, state = %status.state, "Persisted job status");
            }

            let mut slot = self.publish.lock();
            match slot.pending.take() {
                Some(pending) => next = Some(pending),
                None => slot.in_flight = false,
            }
        }
    }
}
