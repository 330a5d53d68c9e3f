//! Integration tests for bulk-reindex
//!
//! These run whole jobs against the in-memory index.

use bulk_reindex::config::{Conflicts, JobRequest, JobRequestBuilder, ScriptSpec};
use bulk_reindex::doc::{BulkItemOutcome, VersionType, WriteDirective};
use bulk_reindex::error::WriteError;
use bulk_reindex::slice::slice_for_id;
use bulk_reindex::{
    BulkSink, JobState, JobStatus, MemoryIndex, MemoryTaskStore, RequestsPerSecond,
    SliceCoordinator, TaskManager,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(20);

fn seeded(ids: &[&str]) -> Arc<MemoryIndex> {
    let index = Arc::new(MemoryIndex::new());
    for id in ids {
        index.index_doc("source", "test", id, &json!({ "id": id, "n": 1 }).to_string());
    }
    index
}

fn builder() -> JobRequestBuilder {
    JobRequest::builder().source_index("source").destination("dest")
}

fn coordinator(index: &Arc<MemoryIndex>) -> SliceCoordinator {
    SliceCoordinator::new(index.clone(), index.clone())
}

fn manager(index: &Arc<MemoryIndex>) -> TaskManager {
    TaskManager::new(coordinator(index), Arc::new(MemoryTaskStore::new()))
}

/// Poll a running task until `done` holds for its status
fn wait_for(manager: &TaskManager, task_id: &str, done: impl Fn(&JobStatus) -> bool) {
    let deadline = Instant::now() + WAIT;
    loop {
        let status = manager.status(task_id).unwrap();
        if done(&status) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out, last status: {:?}", status);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_basic_reindex() {
    let index = seeded(&["1", "2", "3", "4"]);
    let status = coordinator(&index).run(&builder().build().unwrap()).unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.total, 4);
    assert_eq!(status.counters.created, 4);
    assert_eq!(status.counters.version_conflicts, 0);
    assert!(status.failures.is_empty());
    assert!(status.reason.is_none());
    assert_eq!(index.ids("dest"), vec!["1", "2", "3", "4"]);
    assert_eq!(index.open_scrolls(), 0);

    let copied: Value = serde_json::from_str(&index.get("dest", "3").unwrap().source).unwrap();
    assert_eq!(copied, json!({ "id": "3", "n": 1 }));
}

#[test]
fn test_reindex_is_idempotent() {
    let index = seeded(&["1", "2", "3", "4"]);
    let request = builder().build().unwrap();

    let first = coordinator(&index).run(&request).unwrap();
    assert_eq!(first.counters.created, 4);

    let second = coordinator(&index).run(&request).unwrap();
    assert_eq!(second.state, JobState::Completed);
    assert_eq!(second.counters.created, 0);
    assert_eq!(second.counters.updated, 4);
    assert_eq!(index.get("dest", "1").unwrap().version, 2);
}

#[test]
fn test_more_slices_than_documents() {
    let index = seeded(&["1", "2", "3", "4"]);
    let status = coordinator(&index)
        .run(&builder().slices(5).build().unwrap())
        .unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.created, 4);
    assert_eq!(status.slices.len(), 5);

    let ids: Vec<u32> = status.slices.iter().map(|s| s.slice_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    let per_slice: u64 = status.slices.iter().map(|s| s.counters.created).sum();
    assert_eq!(per_slice, 4);
    assert!(status.slices.iter().all(|s| s.state == JobState::Completed));
    assert_eq!(index.count("dest"), 4);
}

#[test]
fn test_sliced_job_copies_everything() {
    let ids: Vec<String> = (0..200).map(|i| format!("doc-{}", i)).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let index = seeded(&refs);

    let status = coordinator(&index)
        .run(&builder().slices(4).batch_size(7).build().unwrap())
        .unwrap();

    assert_eq!(status.counters.created, 200);
    assert_eq!(status.counters.total, 200);
    assert_eq!(index.count("dest"), 200);
    assert_eq!(index.open_scrolls(), 0);
}

#[test]
fn test_abort_on_version_conflict() {
    let index = seeded(&["1", "2", "3", "4"]);
    let mut existing = WriteDirective::index("dest", "test", "2", "{}");
    existing.version = Some(5);
    existing.version_type = VersionType::External;
    index.put(existing);

    let request = builder()
        .dest_version_type(VersionType::External)
        .conflicts(Conflicts::Abort)
        .batch_size(1)
        .build()
        .unwrap();
    let status = coordinator(&index).run(&request).unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert!(status.counters.version_conflicts > 0);
    assert_eq!(status.counters.created, 1);
    assert_eq!(status.failures.len(), 1);
    assert_eq!(status.failures[0].id.as_deref(), Some("2"));
    assert_eq!(status.failures[0].status, 409);
    assert!(status.reason.is_some());
    assert!(index.get("dest", "3").is_none());
    assert!(index.get("dest", "4").is_none());
    assert_eq!(index.open_scrolls(), 0);
}

#[test]
fn test_abort_on_version_conflict_cancels_other_slices() {
    let ids: Vec<String> = (0..100).map(|i| format!("doc-{:03}", i)).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let index = seeded(&refs);

    // the conflicting document is the first one its slice reads
    let conflicting = ids[0].clone();
    let conflicting_slice = slice_for_id(&conflicting, 4);
    let mut existing = WriteDirective::index("dest", "test", &conflicting, "{}");
    existing.version = Some(5);
    existing.version_type = VersionType::External;
    index.put(existing);

    let request = builder()
        .slices(4)
        .batch_size(1)
        .dest_version_type(VersionType::External)
        .conflicts(Conflicts::Abort)
        .requests_per_second(RequestsPerSecond::Limited(0.0004))
        .build()
        .unwrap();

    let started = Instant::now();
    let status = coordinator(&index).run(&request).unwrap();
    assert!(started.elapsed() < WAIT);

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(
        status.reason.as_deref(),
        Some(format!("[{}]: version conflict", conflicting).as_str())
    );
    assert_eq!(status.counters.version_conflicts, 1);
    assert_eq!(status.slices.len(), 4);
    for slice in &status.slices {
        if slice.slice_id == conflicting_slice {
            assert_eq!(slice.state, JobState::Failed);
        } else {
            assert_eq!(slice.state, JobState::Cancelled, "slice {}", slice.slice_id);
        }
    }
    assert!(index.count("dest") < 100);
    assert_eq!(index.open_scrolls(), 0);
}

#[test]
fn test_throttle_longer_than_keep_alive() {
    let index = seeded(&["1", "2"]);
    let request = builder()
        .batch_size(1)
        .keep_alive(Duration::from_secs(1))
        .requests_per_second(RequestsPerSecond::Limited(0.5))
        .build()
        .unwrap();
    assert!(request.requests_per_second().delay_for(1) > Duration::from_secs(1));

    let status = coordinator(&index).run(&request).unwrap();

    assert_eq!(status.state, JobState::Completed, "reason: {:?}", status.reason);
    assert_eq!(status.counters.created, 2);
    assert!(status.counters.throttled_millis >= 1500);
    assert_eq!(index.open_scrolls(), 0);
}

#[test]
fn test_slower_rethrottle_keeps_scroll_alive() {
    let index = seeded(&["1", "2", "3"]);
    let manager = manager(&index);
    let request = builder()
        .batch_size(1)
        .keep_alive(Duration::from_secs(1))
        .requests_per_second(RequestsPerSecond::Limited(2.0))
        .build()
        .unwrap();

    let task_id = manager.submit(request).unwrap();
    wait_for(&manager, &task_id, |s| s.counters.created >= 1);

    // slower than the scroll lease allows for the wait already under way
    manager.rethrottle(&task_id, RequestsPerSecond::Limited(0.5)).unwrap();
    let status = manager.wait(&task_id, Some(WAIT)).unwrap();

    assert_eq!(status.state, JobState::Completed, "reason: {:?}", status.reason);
    assert_eq!(status.counters.created, 3);
    assert_eq!(status.requests_per_second, RequestsPerSecond::Limited(0.5));
    assert_eq!(index.open_scrolls(), 0);
}

#[test]
fn test_conflicts_proceed_counts() {
    let index = seeded(&["1", "2", "3", "4"]);
    let mut existing = WriteDirective::index("dest", "test", "2", "{}");
    existing.version = Some(5);
    existing.version_type = VersionType::External;
    index.put(existing);

    let request = builder()
        .dest_version_type(VersionType::External)
        .build()
        .unwrap();
    let status = coordinator(&index).run(&request).unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.version_conflicts, 1);
    assert_eq!(status.counters.created, 3);
    assert!(status.failures.is_empty());
    assert_eq!(index.get("dest", "2").unwrap().version, 5);
}

#[test]
fn test_rethrottle_releases_stalled_job() {
    let index = seeded(&["1", "2", "3", "4"]);
    let manager = manager(&index);
    let request = builder()
        .batch_size(1)
        .requests_per_second(RequestsPerSecond::Limited(0.0001))
        .build()
        .unwrap();

    let task_id = manager.submit(request).unwrap();
    wait_for(&manager, &task_id, |s| s.counters.created >= 1);

    let stalled = manager.status(&task_id).unwrap();
    assert_eq!(stalled.state, JobState::Running);
    assert!(stalled.throttled_until_millis > 0);

    let started = Instant::now();
    manager.rethrottle(&task_id, RequestsPerSecond::Unlimited).unwrap();
    let status = manager.wait(&task_id, Some(WAIT)).unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.created, 4);
    assert_eq!(status.requests_per_second, RequestsPerSecond::Unlimited);
}

#[test]
fn test_max_docs() {
    let index = seeded(&["1", "2", "3", "4", "5"]);
    let request = builder().size(2).build().unwrap();
    assert_eq!(request.effective_batch_size(), 2);

    let status = coordinator(&index).run(&request).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.total, 2);
    assert_eq!(status.counters.created, 2);
    assert_eq!(index.count("dest"), 2);
}

#[test]
fn test_max_docs_zero() {
    let index = seeded(&["1", "2"]);
    let status = coordinator(&index)
        .run(&builder().size(0).build().unwrap())
        .unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.created, 0);
    assert_eq!(index.count("dest"), 0);
}

#[test]
fn test_noop_script() {
    let index = seeded(&["1", "2", "3", "4"]);
    let request = builder().script(ScriptSpec::new("noop")).build().unwrap();
    let status = coordinator(&index).run(&request).unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.noops, 4);
    assert_eq!(status.counters.created, 0);
    assert_eq!(index.count("dest"), 0);
}

#[test]
fn test_delete_script() {
    let index = seeded(&["1", "2", "3", "4"]);
    index.index_doc("dest", "test", "1", "{}");
    index.index_doc("dest", "test", "3", "{}");

    let request = builder().script(ScriptSpec::new("delete")).build().unwrap();
    let status = coordinator(&index).run(&request).unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.deleted, 2);
    assert_eq!(status.counters.noops, 2);
    assert_eq!(index.count("dest"), 0);
}

#[test]
fn test_set_field_script() {
    let index = seeded(&["1", "2"]);
    let request = builder()
        .script(
            ScriptSpec::new("set-field")
                .param("field", json!("flag"))
                .param("value", json!(true)),
        )
        .build()
        .unwrap();
    let status = coordinator(&index).run(&request).unwrap();

    assert_eq!(status.counters.created, 2);
    let doc: Value = serde_json::from_str(&index.get("dest", "1").unwrap().source).unwrap();
    assert_eq!(doc["flag"], json!(true));
    assert_eq!(doc["n"], json!(1));
}

#[test]
fn test_script_error_fails_job() {
    let index = seeded(&["1", "2"]);
    let request = builder()
        .script(ScriptSpec::new("set-field").param("field", json!("flag")))
        .build()
        .unwrap();
    let status = coordinator(&index).run(&request).unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.failures.len(), 1);
    assert_eq!(status.failures[0].status, 400);
    assert!(status.reason.unwrap().contains("value"));
    assert_eq!(index.open_scrolls(), 0);
}

#[test]
fn test_cancel() {
    let index = seeded(&["1", "2", "3", "4"]);
    let manager = manager(&index);
    let request = builder()
        .batch_size(1)
        .requests_per_second(RequestsPerSecond::Limited(0.0001))
        .build()
        .unwrap();

    let task_id = manager.submit(request).unwrap();
    wait_for(&manager, &task_id, |s| s.counters.created >= 1);

    assert!(manager.cancel(&task_id).unwrap());
    let status = manager.wait(&task_id, Some(WAIT)).unwrap();

    assert_eq!(status.state, JobState::Cancelled);
    assert!(status.reason.is_none());
    assert!(status.counters.created < 4);
    assert_eq!(index.open_scrolls(), 0);
    assert!(index.clear_calls() >= 1);
}

#[test]
fn test_expired_cursor_fails_slice() {
    let index = seeded(&["1", "2", "3", "4"]);
    let manager = manager(&index);
    let request = builder()
        .batch_size(1)
        .requests_per_second(RequestsPerSecond::Limited(0.0001))
        .build()
        .unwrap();

    let task_id = manager.submit(request).unwrap();
    wait_for(&manager, &task_id, |s| s.counters.created >= 1);
    // by now the second page is fetched and the slice is throttled
    thread::sleep(Duration::from_millis(200));

    index.expire_scrolls();
    manager.rethrottle(&task_id, RequestsPerSecond::Unlimited).unwrap();
    let status = manager.wait(&task_id, Some(WAIT)).unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.counters.created, 2);
    assert!(status.reason.unwrap().contains("expired"));
    assert!(index.clear_calls() >= 1);
    assert_eq!(index.open_scrolls(), 0);
}

#[test]
fn test_missing_source_index_fails() {
    let index = Arc::new(MemoryIndex::new());
    let status = coordinator(&index).run(&builder().build().unwrap()).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.reason.unwrap().contains("no such index"));
}

/// Sink that fails every item
struct FailingSink;

impl BulkSink for FailingSink {
    fn bulk(&self, directives: &[WriteDirective]) -> Result<Vec<BulkItemOutcome>, WriteError> {
        Ok(directives
            .iter()
            .map(|d| BulkItemOutcome::Failure {
                id: d.id.clone(),
                cause: "mapper_parsing_exception".into(),
            })
            .collect())
    }
}

#[test]
fn test_failure_list_is_bounded() {
    let index = seeded(&["1", "2", "3", "4", "5"]);
    let coordinator = SliceCoordinator::new(index.clone(), Arc::new(FailingSink));
    let request = builder().batch_size(2).max_failures(2).build().unwrap();

    let status = coordinator.run(&request).unwrap();

    // item failures do not stop the job
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.failure_count, 5);
    let ids: Vec<_> = status.failures.iter().map(|f| f.id.clone().unwrap()).collect();
    assert_eq!(ids, vec!["1", "2"]);
}

#[test]
fn test_rejected_bulks_are_retried() {
    let index = seeded(&["1", "2", "3", "4"]);
    index.reject_next_bulks(2);
    let request = builder()
        .retry_backoff(Duration::from_millis(1))
        .build()
        .unwrap();

    let status = coordinator(&index).run(&request).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.retries, 2);
    assert_eq!(status.counters.created, 4);
    assert_eq!(index.bulk_calls(), 3);
}

#[test]
fn test_rejections_exhaust_retries() {
    let index = seeded(&["1", "2"]);
    index.reject_next_bulks(10);
    let request = builder()
        .max_retries(2)
        .retry_backoff(Duration::from_millis(1))
        .build()
        .unwrap();

    let status = coordinator(&index).run(&request).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(index.count("dest"), 0);
    assert_eq!(index.open_scrolls(), 0);
}

#[test]
fn test_status_json() {
    let index = seeded(&["1", "2"]);
    let status = coordinator(&index)
        .run(&builder().slices(2).build().unwrap())
        .unwrap();
    let json: Value = serde_json::to_value(&status).unwrap();

    for field in [
        "took",
        "timed_out",
        "total",
        "created",
        "updated",
        "deleted",
        "batches",
        "version_conflicts",
        "noops",
        "retries",
        "throttled_millis",
        "requests_per_second",
        "throttled_until_millis",
        "failures",
        "slices",
        "state",
    ] {
        assert!(json.get(field).is_some(), "missing {}", field);
    }
    assert_eq!(json["requests_per_second"], json!(-1.0));
    assert_eq!(json["state"], json!("completed"));
}
