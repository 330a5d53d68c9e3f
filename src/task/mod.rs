//! Task management
//!
//! A [`TaskManager`] runs jobs in the background under a task id, answers
//! status queries for running and finished jobs, and routes cancel and
//! rethrottle requests to the right job. Control requests written to the
//! [`TaskStore`] by other processes are applied by [`TaskManager::poll_control`].
//!
//! A finished task stays in memory until its final status is in the store;
//! after that it is dropped on the next submit and answered from the store.

pub mod reporter;
pub mod store;

pub use reporter::{AbortCause, JobStatusReporter, SliceHandle};
pub use store::{ControlRequest, MemoryTaskStore, SqliteTaskStore, TaskStore};

use crate::config::{JobRequest, RequestsPerSecond};
use crate::coordinator::SliceCoordinator;
use crate::error::{ReindexError, Result};
use crate::status::{JobState, JobStatus};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Task identifier
pub type TaskId = String;

struct RunningTask {
    reporter: Arc<JobStatusReporter>,
    result: Arc<Mutex<Option<JobStatus>>>,
    done: Receiver<()>,
}

/// Runs and tracks reindex tasks
pub struct TaskManager {
    coordinator: SliceCoordinator,
    store: Arc<dyn TaskStore>,
    tasks: Mutex<HashMap<TaskId, RunningTask>>,
}

impl TaskManager {
    pub fn new(coordinator: SliceCoordinator, store: Arc<dyn TaskStore>) -> Self {
        Self {
            coordinator,
            store,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Start a job in the background and return its task id.
    ///
    /// The request is checked before anything starts, so an unknown script
    /// is reported here rather than as a failed task.
    pub fn submit(&self, request: JobRequest) -> Result<TaskId> {
        self.coordinator.check(&request)?;

        let task_id = uuid::Uuid::new_v4().to_string();
        let reporter = Arc::new(JobStatusReporter::new(
            task_id.clone(),
            Arc::clone(&self.store),
            &request,
        ));
        let result = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = bounded::<()>(0);

        let coordinator = self.coordinator.clone();
        let thread_reporter = Arc::clone(&reporter);
        let thread_result = Arc::clone(&result);
        let thread_task_id = task_id.clone();

        thread::Builder::new()
            .name(format!("task-{}", &task_id[..8.min(task_id.len())]))
            .spawn(move || {
                let status = match coordinator.run_with_reporter(&request, Arc::clone(&thread_reporter)) {
                    Ok(status) => status,
                    Err(e) => {
                        error!(task = %thread_task_id, error = %e, "Task failed to run");
                        let mut status = thread_reporter.live_status();
                        status.state = JobState::Failed;
                        status.reason = Some(e.to_string());
                        thread_reporter.publish(status.clone());
                        status
                    }
                };
                *thread_result.lock() = Some(status);
                drop(done_tx);
            })
            .map_err(|e| crate::error::WorkerError::SpawnFailed {
                slice: 0,
                reason: e.to_string(),
            })?;

        info!(task = %task_id, "Submitted task");
        self.prune_finished();
        self.tasks.lock().insert(
            task_id.clone(),
            RunningTask {
                reporter,
                result,
                done: done_rx,
            },
        );
        Ok(task_id)
    }

    /// Run a job and block until it ends
    pub fn run(&self, request: JobRequest) -> Result<JobStatus> {
        let task_id = self.submit(request)?;
        self.wait(&task_id, None)
    }

    /// Current status: live while running, final once done, persisted
    /// for tasks this manager never ran.
    pub fn status(&self, task_id: &str) -> Result<JobStatus> {
        if let Some(task) = self.tasks.lock().get(task_id) {
            if let Some(done) = task.result.lock().clone() {
                return Ok(done);
            }
            return Ok(task.reporter.live_status());
        }
        self.store
            .load(task_id)?
            .ok_or_else(|| ReindexError::TaskNotFound(task_id.to_string()))
    }

    /// Cancel a task. Returns false if it had already finished.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        if let Some(task) = self.tasks.lock().get(task_id) {
            if task.result.lock().is_some() {
                return Ok(false);
            }
            task.reporter.cancel("by user request");
            return Ok(true);
        }
        match self.store.load(task_id)? {
            Some(status) if status.is_terminal() => Ok(false),
            Some(_) => Ok(self.store.request_cancel(task_id)?),
            None => Err(ReindexError::TaskNotFound(task_id.to_string())),
        }
    }

    /// Change a task's rate. Succeeds for finished tasks too.
    pub fn rethrottle(&self, task_id: &str, rps: RequestsPerSecond) -> Result<()> {
        if let Some(task) = self.tasks.lock().get(task_id) {
            if task.result.lock().is_none() {
                task.reporter.rethrottle(rps);
            } else {
                debug!(task = %task_id, "Rethrottle of finished task ignored");
            }
            return Ok(());
        }
        match self.store.load(task_id)? {
            Some(status) if status.is_terminal() => Ok(()),
            Some(_) => {
                self.store.request_rethrottle(task_id, rps)?;
                Ok(())
            }
            None => Err(ReindexError::TaskNotFound(task_id.to_string())),
        }
    }

    /// Wait for a task this manager started; `None` waits forever
    pub fn wait(&self, task_id: &str, timeout: Option<Duration>) -> Result<JobStatus> {
        let tracked = self
            .tasks
            .lock()
            .get(task_id)
            .map(|task| (task.done.clone(), Arc::clone(&task.result)));
        let (done, result) = match tracked {
            Some(tracked) => tracked,
            None => {
                return match self.store.load(task_id)? {
                    Some(status) if status.is_terminal() => Ok(status),
                    _ => Err(ReindexError::TaskNotFound(task_id.to_string())),
                }
            }
        };

        // The sender is dropped when the task ends, which disconnects the
        // channel; nothing is ever sent.
        let ended = match timeout {
            Some(timeout) => !matches!(done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)),
            None => {
                let _ = done.recv();
                true
            }
        };
        if !ended {
            return Err(ReindexError::WaitTimedOut(task_id.to_string()));
        }

        let status = result.lock().clone();
        status.ok_or_else(|| ReindexError::TaskNotFound(task_id.to_string()))
    }

    /// Apply control requests written to the store for running tasks.
    /// Returns the number of requests applied.
    pub fn poll_control(&self) -> usize {
        let running: Vec<(TaskId, Arc<JobStatusReporter>)> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, t)| t.result.lock().is_none())
            .map(|(id, t)| (id.clone(), Arc::clone(&t.reporter)))
            .collect();

        let mut applied = 0;
        for (task_id, reporter) in running {
            match self.store.take_control(&task_id) {
                Ok(Some(control)) => {
                    if let Some(rps) = control.requests_per_second {
                        reporter.rethrottle(rps);
                        applied += 1;
                    }
                    if control.cancel {
                        reporter.cancel("requested through task store");
                        applied += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(task = %task_id, error = %e, "Failed to read control requests"),
            }
        }
        applied
    }

    /// Forget finished tasks whose final status is in the store.
    /// Returns the number of tasks dropped.
    pub fn prune_finished(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|task_id, task| {
            if task.result.lock().is_none() {
                return true;
            }
            match self.store.load(task_id) {
                Ok(Some(status)) => !status.is_terminal(),
                Ok(None) => true,
                Err(e) => {
                    warn!(task = %task_id, error = %e, "Keeping finished task in memory");
                    true
                }
            }
        });
        let pruned = before - tasks.len();
        if pruned > 0 {
            debug!(pruned, "Dropped finished tasks");
        }
        pruned
    }

    /// Ids of tasks still running
    pub fn running_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, t)| t.result.lock().is_none())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryIndex;

    fn manager(index: &Arc<MemoryIndex>) -> (TaskManager, Arc<MemoryTaskStore>) {
        let store = Arc::new(MemoryTaskStore::new());
        let coordinator = SliceCoordinator::new(index.clone(), index.clone());
        (TaskManager::new(coordinator, store.clone()), store)
    }

    fn request() -> JobRequest {
        JobRequest::builder()
            .source_index("source")
            .destination("dest")
            .build()
            .unwrap()
    }

    #[test]
    fn test_submit_and_wait() {
        let index = Arc::new(MemoryIndex::new());
        index.index_doc("source", "test", "1", "{}");
        let (manager, store) = manager(&index);

        let task_id = manager.submit(request()).unwrap();
        let status = manager.wait(&task_id, Some(Duration::from_secs(10))).unwrap();

        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.task_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(manager.status(&task_id).unwrap(), status);
        assert_eq!(store.load(&task_id).unwrap().unwrap().state, JobState::Completed);
        assert!(manager.running_tasks().is_empty());
        assert!(!manager.cancel(&task_id).unwrap());
        manager.rethrottle(&task_id, RequestsPerSecond::Unlimited).unwrap();
    }

    #[test]
    fn test_finished_tasks_are_pruned() {
        let index = Arc::new(MemoryIndex::new());
        index.index_doc("source", "test", "1", "{}");
        let (manager, _) = manager(&index);

        let first = manager.submit(request()).unwrap();
        let status = manager.wait(&first, Some(Duration::from_secs(10))).unwrap();
        assert!(manager.tasks.lock().contains_key(&first));

        let second = manager.submit(request()).unwrap();
        manager.wait(&second, Some(Duration::from_secs(10))).unwrap();
        assert!(!manager.tasks.lock().contains_key(&first));

        // still answered from the store
        assert_eq!(manager.status(&first).unwrap(), status);
        assert_eq!(manager.wait(&first, None).unwrap(), status);
        assert!(!manager.cancel(&first).unwrap());

        assert_eq!(manager.prune_finished(), 1);
        assert!(manager.tasks.lock().is_empty());
    }

    #[test]
    fn test_unknown_task() {
        let index = Arc::new(MemoryIndex::new());
        let (manager, _) = manager(&index);
        assert!(matches!(manager.status("nope"), Err(ReindexError::TaskNotFound(_))));
        assert!(matches!(manager.cancel("nope"), Err(ReindexError::TaskNotFound(_))));
        assert!(matches!(manager.wait("nope", None), Err(ReindexError::TaskNotFound(_))));
    }

    #[test]
    fn test_persisted_task_status() {
        let index = Arc::new(MemoryIndex::new());
        let (manager, store) = manager(&index);
        let status = JobStatus::running("elsewhere", RequestsPerSecond::Unlimited);
        store.save("other", &status).unwrap();

        assert_eq!(manager.status("other").unwrap(), status);
        assert!(manager.cancel("other").unwrap());
        manager
            .rethrottle("other", RequestsPerSecond::Limited(2.0))
            .unwrap();

        let control = store.take_control("other").unwrap().unwrap();
        assert!(control.cancel);
        assert_eq!(control.requests_per_second, Some(RequestsPerSecond::Limited(2.0)));
    }

    #[test]
    fn test_poll_control_cancels_running_task() {
        let index = Arc::new(MemoryIndex::new());
        for i in 0..10 {
            index.index_doc("source", "test", &i.to_string(), "{}");
        }
        let (manager, store) = manager(&index);
        let request = JobRequest::builder()
            .source_index("source")
            .destination("dest")
            .batch_size(1)
            .requests_per_second(RequestsPerSecond::Limited(0.01))
            .build()
            .unwrap();

        let task_id = manager.submit(request).unwrap();
        // the job saves its first status before starting slices
        while store.load(&task_id).unwrap().is_none() {
            thread::sleep(Duration::from_millis(5));
        }
        store.request_cancel(&task_id).unwrap();
        assert!(manager.poll_control() >= 1);

        let status = manager.wait(&task_id, Some(Duration::from_secs(10))).unwrap();
        assert_eq!(status.state, JobState::Cancelled);
        assert!(status.counters.created < 10);
    }
}
