//! Jobs between SQLite files, with status in a SQLite task store

use bulk_reindex::config::JobRequest;
use bulk_reindex::store::schema::{self, keys};
use bulk_reindex::{
    JobState, RequestsPerSecond, SliceCoordinator, SqliteIndex, SqliteTaskStore, TaskManager,
    TaskStore,
};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn seed(index: &SqliteIndex, n: usize) {
    for i in 0..n {
        index
            .index_doc("source", "test", &format!("{:03}", i), &json!({ "n": i }).to_string())
            .unwrap();
    }
}

#[test]
fn test_reindex_between_files() {
    let dir = tempdir().unwrap();
    let source = Arc::new(SqliteIndex::open(dir.path().join("src.db")).unwrap());
    let dest = Arc::new(SqliteIndex::open(dir.path().join("dst.db")).unwrap());
    seed(&source, 25);

    let request = JobRequest::builder()
        .source_index("source")
        .destination("copy")
        .slices(3)
        .batch_size(4)
        .build()
        .unwrap();
    let status = SliceCoordinator::new(source.clone(), dest.clone())
        .run(&request)
        .unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.created, 25);
    assert_eq!(dest.count("copy").unwrap(), 25);
    assert_eq!(source.count("copy").unwrap(), 0);
    assert_eq!(source.open_scrolls(), 0);

    let doc = dest.get("copy", "007").unwrap().unwrap();
    let body: Value = serde_json::from_str(&doc.source).unwrap();
    assert_eq!(body["n"], json!(7));
    assert_eq!(doc.version, 1);
}

#[test]
fn test_reindex_within_one_file() {
    let dir = tempdir().unwrap();
    let index = Arc::new(SqliteIndex::open(dir.path().join("one.db")).unwrap());
    seed(&index, 10);

    let request = JobRequest::builder()
        .source_index("source")
        .destination("copy")
        .build()
        .unwrap();
    let coordinator = SliceCoordinator::new(index.clone(), index.clone());

    let first = coordinator.run(&request).unwrap();
    assert_eq!(first.counters.created, 10);
    let second = coordinator.run(&request).unwrap();
    assert_eq!(second.counters.updated, 10);

    let mut indices = index.indices().unwrap();
    indices.sort();
    assert_eq!(indices, vec!["copy", "source"]);
}

#[test]
fn test_files_are_stamped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("src.db");
    drop(SqliteIndex::open(&path).unwrap());

    let conn = Connection::open(&path).unwrap();
    assert_eq!(
        schema::get_store_info(&conn, keys::SCHEMA_VERSION).unwrap(),
        Some(schema::SCHEMA_VERSION.to_string())
    );
    assert!(schema::get_store_info(&conn, keys::CREATED_BY)
        .unwrap()
        .unwrap()
        .starts_with("bulk-reindex"));
}

#[test]
fn test_status_persisted_and_controlled_from_another_handle() {
    let dir = tempdir().unwrap();
    let tasks_db = dir.path().join("tasks.db");
    let index = Arc::new(SqliteIndex::open(dir.path().join("docs.db")).unwrap());
    seed(&index, 4);

    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&tasks_db).unwrap());
    let manager = TaskManager::new(SliceCoordinator::new(index.clone(), index.clone()), store);

    let request = JobRequest::builder()
        .source_index("source")
        .destination("copy")
        .batch_size(1)
        .requests_per_second(RequestsPerSecond::Limited(0.0001))
        .build()
        .unwrap();
    let task_id = manager.submit(request).unwrap();

    // A second handle on the same file stands in for another process
    let other = SqliteTaskStore::open(&tasks_db).unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        if let Some(status) = other.load(&task_id).unwrap() {
            if status.counters.created >= 1 {
                assert_eq!(status.state, JobState::Running);
                break;
            }
        }
        assert!(Instant::now() < deadline, "job never made progress");
        thread::sleep(Duration::from_millis(10));
    }

    assert!(other
        .request_rethrottle(&task_id, RequestsPerSecond::Unlimited)
        .unwrap());
    assert_eq!(manager.poll_control(), 1);

    let status = manager.wait(&task_id, Some(Duration::from_secs(20))).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.counters.created, 4);

    let persisted = other.load(&task_id).unwrap().unwrap();
    assert_eq!(persisted.state, JobState::Completed);
    assert_eq!(persisted.counters.created, 4);
    assert_eq!(other.list().unwrap()[0].0, task_id);
}
