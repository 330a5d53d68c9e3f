//! Per-slice throttling
//!
//! The delay before batch `k+1` is `size(k) / rps`, measured from the moment
//! batch `k` started, so time spent fetching and writing counts toward it.
//! The rate can change at any time. A faster rate pulls a pending deadline
//! in and wakes the waiter; a slower one only applies from the next
//! scheduled batch, so a wait never outgrows the scroll lease taken for it.

use crate::config::RequestsPerSecond;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Cancellation check interval while waiting
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Used when a deadline cannot be represented as an `Instant`
const FALLBACK_DELAY: Duration = Duration::from_secs(86_400);

#[derive(Debug)]
struct RateState {
    rps: RequestsPerSecond,
    last_batch_start: Option<Instant>,
    last_batch_size: usize,
    deadline: Option<Instant>,
}

impl RateState {
    fn deadline_at(&self) -> Option<Instant> {
        self.last_batch_start.map(|start| {
            let delay = self.rps.delay_for(self.last_batch_size);
            start.checked_add(delay).unwrap_or(start + FALLBACK_DELAY)
        })
    }

    fn recompute_deadline(&mut self) {
        self.deadline = self.deadline_at();
    }

    /// Move a pending deadline earlier, never later
    fn shorten_deadline(&mut self) {
        if let (Some(pending), Some(recomputed)) = (self.deadline, self.deadline_at()) {
            self.deadline = Some(pending.min(recomputed));
        }
    }
}

/// Throttle for one slice
#[derive(Debug)]
pub struct RateController {
    state: Mutex<RateState>,
    changed: Condvar,
}

impl RateController {
    pub fn new(rps: RequestsPerSecond) -> Self {
        Self {
            state: Mutex::new(RateState {
                rps,
                last_batch_start: None,
                last_batch_size: 0,
                deadline: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Current rate
    pub fn rate(&self) -> RequestsPerSecond {
        self.state.lock().rps
    }

    /// Delay owed for a batch of `batch_size` documents at the current rate
    pub fn delay_for(&self, batch_size: usize) -> Duration {
        self.state.lock().rps.delay_for(batch_size)
    }

    /// Record that a batch of `batch_size` documents started at `started`
    pub fn schedule(&self, started: Instant, batch_size: usize) {
        let mut state = self.state.lock();
        state.last_batch_start = Some(started);
        state.last_batch_size = batch_size;
        state.recompute_deadline();
        trace!(batch_size, deadline = ?state.deadline, "Scheduled next batch");
    }

    /// Change the rate. A pending wait can only get shorter; a slower rate
    /// takes effect with the next [`schedule`](Self::schedule).
    pub fn set_rate(&self, rps: RequestsPerSecond) -> RequestsPerSecond {
        let previous = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut state.rps, rps);
            state.shorten_deadline();
            previous
        };
        debug!(from = %previous, to = %rps, "Rate changed");
        self.changed.notify_all();
        previous
    }

    /// Wake any waiter so it can observe cancellation
    pub fn interrupt(&self) {
        self.changed.notify_all();
    }

    /// Deadline of the pending wait, if any
    pub fn throttled_until(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    /// Time left before the next batch may start
    pub fn remaining(&self) -> Duration {
        self.throttled_until()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Block until the scheduled deadline passes or `cancel` is set.
    ///
    /// Returns the time actually spent waiting.
    pub fn wait_until_ready(&self, cancel: &AtomicBool) -> Duration {
        let started = Instant::now();
        let mut state = self.state.lock();

        loop {
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            let now = Instant::now();
            let deadline = match state.deadline {
                Some(deadline) if deadline > now => deadline,
                _ => {
                    state.deadline = None;
                    break;
                }
            };
            let timeout = (deadline - now).min(CHECK_INTERVAL);
            self.changed.wait_for(&mut state, timeout);
        }

        started.elapsed()
    }
}
