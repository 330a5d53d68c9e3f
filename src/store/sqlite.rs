//! SQLite-backed document index
//!
//! All indices share the `documents` table. A scroll context snapshots the
//! keys of matching documents when opened and loads bodies page by page, so
//! a document deleted after the scroll opened is skipped rather than
//! resurrected.

use super::schema::{self, keys};
use super::{is_hit, lease_expiry, plan_write, Mutation, StoredDocument};
use crate::cursor::{ScrollPage, ScrollRequest, ScrollSource};
use crate::doc::{BulkItemOutcome, SourceRecord, WriteDirective};
use crate::error::{CursorError, StoreResult, WriteError};
use crate::writer::BulkSink;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const SELECT_DOCUMENT: &str = "SELECT doc_type, source, version, routing, parent, timestamp, ttl
     FROM documents WHERE index_name = ?1 AND id = ?2";

const UPSERT_DOCUMENT: &str = "INSERT OR REPLACE INTO documents
     (index_name, id, doc_type, source, version, routing, parent, timestamp, ttl)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

#[derive(Debug)]
struct ScrollContext {
    keys: VecDeque<(String, String)>,
    size: usize,
    total: u64,
    expires_at: Instant,
}

/// Document index stored in a SQLite file
#[derive(Debug)]
pub struct SqliteIndex {
    conn: Mutex<Connection>,
    scrolls: Mutex<HashMap<String, ScrollContext>>,
    next_scroll: AtomicU64,
}

fn read_document(row: &Row<'_>) -> rusqlite::Result<StoredDocument> {
    Ok(StoredDocument {
        doc_type: row.get(0)?,
        source: row.get(1)?,
        version: row.get(2)?,
        routing: row.get(3)?,
        parent: row.get(4)?,
        timestamp: row.get(5)?,
        ttl: row.get(6)?,
    })
}

fn load_document(conn: &Connection, index: &str, id: &str) -> rusqlite::Result<Option<StoredDocument>> {
    let mut stmt = conn.prepare_cached(SELECT_DOCUMENT)?;
    stmt.query_row(params![index, id], read_document).optional()
}

impl SqliteIndex {
    /// Open (or create) an index file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        schema::create_index_database(&conn)?;
        if schema::get_store_info(&conn, keys::CREATED_BY)?.is_none() {
            schema::set_store_info(
                &conn,
                keys::CREATED_BY,
                concat!("bulk-reindex ", env!("CARGO_PKG_VERSION")),
            )?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            scrolls: Mutex::new(HashMap::new()),
            next_scroll: AtomicU64::new(0),
        })
    }

    /// Index a document with internal versioning, returning its outcome
    pub fn index_doc(&self, index: &str, doc_type: &str, id: &str, source: &str) -> StoreResult<BulkItemOutcome> {
        let directive = WriteDirective::index(index, doc_type, id, source);
        let mut outcomes = self.write_all(std::slice::from_ref(&directive))?;
        Ok(outcomes.remove(0))
    }

    pub fn get(&self, index: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        let conn = self.conn.lock();
        Ok(load_document(&conn, index, id)?)
    }

    /// Number of documents in an index
    pub fn count(&self, index: &str) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE index_name = ?1",
            [index],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Names of all non-empty indices
    pub fn indices(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT index_name FROM documents ORDER BY index_name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Scroll contexts still held
    pub fn open_scrolls(&self) -> usize {
        self.scrolls.lock().len()
    }

    fn write_all(&self, directives: &[WriteDirective]) -> StoreResult<Vec<BulkItemOutcome>> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let mut outcomes = Vec::with_capacity(directives.len());

        {
            let mut upsert = tx.prepare_cached(UPSERT_DOCUMENT)?;
            let mut delete = tx.prepare_cached("DELETE FROM documents WHERE index_name = ?1 AND id = ?2")?;

            for directive in directives {
                let current = load_document(&tx, &directive.index, &directive.id)?;
                let (outcome, mutation) = plan_write(current.as_ref(), directive);

                match mutation {
                    Mutation::Put(doc) => {
                        upsert.execute(params![
                            directive.index,
                            directive.id,
                            doc.doc_type,
                            doc.source,
                            doc.version,
                            doc.routing,
                            doc.parent,
                            doc.timestamp,
                            doc.ttl,
                        ])?;
                    }
                    Mutation::Remove => {
                        delete.execute(params![directive.index, directive.id])?;
                    }
                    Mutation::Nothing => {}
                }
                outcomes.push(outcome);
            }
        }

        tx.commit()?;
        Ok(outcomes)
    }

    fn snapshot_keys(&self, request: &ScrollRequest) -> Result<VecDeque<(String, String)>, CursorError> {
        let open_failed = |reason: String| CursorError::OpenFailed {
            indices: request.indices.join(","),
            reason,
        };

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, doc_type, source, version FROM documents WHERE index_name = ?1 ORDER BY id",
            )
            .map_err(|e| open_failed(e.to_string()))?;

        let mut keys = VecDeque::new();
        for index in &request.indices {
            let mut rows = stmt.query([index]).map_err(|e| open_failed(e.to_string()))?;
            let mut found = false;

            while let Some(row) = rows.next().map_err(|e| open_failed(e.to_string()))? {
                found = true;
                let id: String = row.get(0).map_err(|e| open_failed(e.to_string()))?;
                let doc = StoredDocument {
                    doc_type: row.get(1).map_err(|e| open_failed(e.to_string()))?,
                    source: row.get(2).map_err(|e| open_failed(e.to_string()))?,
                    version: row.get(3).map_err(|e| open_failed(e.to_string()))?,
                    routing: None,
                    parent: None,
                    timestamp: None,
                    ttl: None,
                };
                if is_hit(request, &id, &doc) {
                    keys.push_back((index.clone(), id));
                }
            }

            if !found {
                return Err(open_failed(format!("no such index [{}]", index)));
            }
        }

        Ok(keys)
    }

    fn load_page(&self, scroll_id: &str, keys: Vec<(String, String)>) -> Result<Vec<SourceRecord>, CursorError> {
        let conn = self.conn.lock();
        let mut hits = Vec::with_capacity(keys.len());

        for (index, id) in keys {
            let doc = load_document(&conn, &index, &id).map_err(|e| CursorError::FetchFailed {
                scroll_id: scroll_id.to_string(),
                reason: e.to_string(),
            })?;
            match doc {
                Some(doc) => hits.push(doc.to_record(&index, &id)),
                None => trace!(index = %index, id = %id, "Document deleted since scroll opened"),
            }
        }

        Ok(hits)
    }

    fn take_page(
        &self,
        scroll_id: &str,
        keep_alive: Option<Duration>,
    ) -> Result<(Vec<(String, String)>, u64), CursorError> {
        let mut scrolls = self.scrolls.lock();
        let now = Instant::now();

        let live = scrolls.get(scroll_id).is_some_and(|ctx| ctx.expires_at > now);
        if !live {
            scrolls.remove(scroll_id);
            return Err(CursorError::Expired {
                scroll_id: scroll_id.to_string(),
            });
        }

        let ctx = scrolls.get_mut(scroll_id).ok_or_else(|| CursorError::Expired {
            scroll_id: scroll_id.to_string(),
        })?;
        if let Some(keep_alive) = keep_alive {
            ctx.expires_at = lease_expiry(now, keep_alive);
        }
        let n = ctx.size.min(ctx.keys.len());
        Ok((ctx.keys.drain(..n).collect(), ctx.total))
    }

    /// Next non-empty page, unless the snapshot is exhausted. Pages whose
    /// documents were all deleted are skipped so they do not read as the end.
    fn fetch_page(
        &self,
        scroll_id: &str,
        keep_alive: Option<Duration>,
    ) -> Result<(Vec<SourceRecord>, u64), CursorError> {
        loop {
            let (page_keys, total) = self.take_page(scroll_id, keep_alive)?;
            if page_keys.is_empty() {
                return Ok((Vec::new(), total));
            }
            let hits = self.load_page(scroll_id, page_keys)?;
            if !hits.is_empty() {
                return Ok((hits, total));
            }
        }
    }
}

impl ScrollSource for SqliteIndex {
    fn open(&self, request: &ScrollRequest) -> Result<ScrollPage, CursorError> {
        let keys = self.snapshot_keys(request)?;
        let total = keys.len() as u64;

        let scroll_id = format!("sqlite-scroll-{}", self.next_scroll.fetch_add(1, Ordering::Relaxed) + 1);
        self.scrolls.lock().insert(
            scroll_id.clone(),
            ScrollContext {
                keys,
                size: request.size.max(1),
                total,
                expires_at: lease_expiry(Instant::now(), request.keep_alive),
            },
        );
        debug!(scroll_id = %scroll_id, total, "Opened sqlite scroll");

        let (hits, total) = self.fetch_page(&scroll_id, None)?;
        Ok(ScrollPage {
            scroll_id,
            total_hits: total,
            hits,
        })
    }

    fn next(&self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollPage, CursorError> {
        let (hits, total) = self.fetch_page(scroll_id, Some(keep_alive))?;
        Ok(ScrollPage {
            scroll_id: scroll_id.to_string(),
            total_hits: total,
            hits,
        })
    }

    fn close(&self, scroll_id: &str) -> Result<(), CursorError> {
        match self.scrolls.lock().remove(scroll_id) {
            Some(_) => Ok(()),
            None => Err(CursorError::CloseFailed {
                scroll_id: scroll_id.to_string(),
                reason: "no such scroll context".into(),
            }),
        }
    }
}

impl BulkSink for SqliteIndex {
    fn bulk(&self, directives: &[WriteDirective]) -> Result<Vec<BulkItemOutcome>, WriteError> {
        self.write_all(directives).map_err(|e| WriteError::Failed {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{fields, OpType, Query};
    use serde_json::Value;

    fn request(size: usize) -> ScrollRequest {
        ScrollRequest {
            indices: vec!["source".into()],
            types: Vec::new(),
            query: Query::MatchAll,
            slice: None,
            size,
            keep_alive: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_index_and_get() {
        let index = SqliteIndex::open_in_memory().unwrap();
        assert_eq!(index.index_doc("source", "test", "1", r#"{"a":1}"#).unwrap(), BulkItemOutcome::Created);
        assert_eq!(index.index_doc("source", "test", "1", r#"{"a":2}"#).unwrap(), BulkItemOutcome::Updated);

        let doc = index.get("source", "1").unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.source, r#"{"a":2}"#);
        assert_eq!(index.count("source").unwrap(), 1);
        assert_eq!(index.indices().unwrap(), vec!["source"]);
    }

    #[test]
    fn test_scroll_pages_and_skips_deleted() {
        let index = SqliteIndex::open_in_memory().unwrap();
        for id in ["a", "b", "c"] {
            index.index_doc("source", "test", id, "{}").unwrap();
        }

        let first = index.open(&request(1)).unwrap();
        assert_eq!(first.total_hits, 3);
        assert_eq!(first.hits[0].id, "a");

        let mut delete = WriteDirective::index("source", "test", "b", "{}");
        delete.op = OpType::Delete;
        delete.source = None;
        assert_eq!(index.bulk(&[delete]).unwrap(), vec![BulkItemOutcome::Deleted]);

        let second = index.next(&first.scroll_id, Duration::from_secs(60)).unwrap();
        assert_eq!(second.hits[0].id, "c");
        let third = index.next(&first.scroll_id, Duration::from_secs(60)).unwrap();
        assert!(third.hits.is_empty());

        index.close(&first.scroll_id).unwrap();
        assert_eq!(index.open_scrolls(), 0);
    }

    #[test]
    fn test_metadata_survives_storage() {
        let index = SqliteIndex::open_in_memory().unwrap();
        let mut d = WriteDirective::index("source", "test", "1", "{}");
        d.routing = Some("r".into());
        d.timestamp = Some("1400000000000".into());
        d.ttl = Some(5000);
        index.bulk(&[d]).unwrap();

        let page = index.open(&request(10)).unwrap();
        let hit = &page.hits[0];
        assert_eq!(hit.field(fields::ROUTING), Some(&Value::from("r")));
        assert_eq!(hit.field(fields::TIMESTAMP), Some(&Value::from(1_400_000_000_000_i64)));
        assert_eq!(hit.field(fields::TTL), Some(&Value::from(5000)));
    }

    #[test]
    fn test_open_missing_index() {
        let index = SqliteIndex::open_in_memory().unwrap();
        assert!(matches!(index.open(&request(10)), Err(CursorError::OpenFailed { .. })));
    }
}
