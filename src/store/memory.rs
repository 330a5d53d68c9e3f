//! In-memory document index
//!
//! Indices are sorted maps from id to [`StoredDocument`], so scrolls return
//! hits in id order. A scroll context is a snapshot of the matching hits
//! taken when it is opened; later writes are not visible to it.

use super::{is_hit, lease_expiry, plan_write, Mutation, StoredDocument};
use crate::cursor::{ScrollPage, ScrollRequest, ScrollSource};
use crate::doc::{BulkItemOutcome, SourceRecord, WriteDirective};
use crate::error::{CursorError, WriteError};
use crate::writer::BulkSink;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug)]
struct ScrollContext {
    remaining: VecDeque<SourceRecord>,
    size: usize,
    total: u64,
    expires_at: Instant,
}

impl ScrollContext {
    fn page(&mut self, scroll_id: &str) -> ScrollPage {
        let n = self.size.min(self.remaining.len());
        ScrollPage {
            scroll_id: scroll_id.to_string(),
            total_hits: self.total,
            hits: self.remaining.drain(..n).collect(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    indices: HashMap<String, BTreeMap<String, StoredDocument>>,
    scrolls: HashMap<String, ScrollContext>,
    next_scroll: u64,
    reject_bulks: u32,
}

/// Versioned in-memory index with scroll contexts
#[derive(Debug, Default)]
pub struct MemoryIndex {
    inner: Mutex<Inner>,
    clear_calls: AtomicU64,
    bulk_calls: AtomicU64,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a document with internal versioning, returning its new version
    pub fn index_doc(&self, index: &str, doc_type: &str, id: &str, source: &str) -> i64 {
        self.put(WriteDirective::index(index, doc_type, id, source))
    }

    /// Apply one directive, returning the stored version afterwards (or -1)
    pub fn put(&self, directive: WriteDirective) -> i64 {
        let mut inner = self.inner.lock();
        apply(&mut inner, &directive);
        inner
            .indices
            .get(&directive.index)
            .and_then(|docs| docs.get(&directive.id))
            .map(|doc| doc.version)
            .unwrap_or(crate::doc::versions::NOT_FOUND)
    }

    pub fn get(&self, index: &str, id: &str) -> Option<StoredDocument> {
        self.inner.lock().indices.get(index)?.get(id).cloned()
    }

    /// Number of documents in an index
    pub fn count(&self, index: &str) -> usize {
        self.inner.lock().indices.get(index).map_or(0, BTreeMap::len)
    }

    /// Sorted ids in an index
    pub fn ids(&self, index: &str) -> Vec<String> {
        self.inner
            .lock()
            .indices
            .get(index)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Scroll contexts still held
    pub fn open_scrolls(&self) -> usize {
        self.inner.lock().scrolls.len()
    }

    /// Number of clear-scroll requests received
    pub fn clear_calls(&self) -> u64 {
        self.clear_calls.load(Ordering::Relaxed)
    }

    /// Number of bulk requests received
    pub fn bulk_calls(&self) -> u64 {
        self.bulk_calls.load(Ordering::Relaxed)
    }

    /// Let every open scroll's keep-alive lapse
    pub fn expire_scrolls(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        for ctx in inner.scrolls.values_mut() {
            ctx.expires_at = now;
        }
    }

    /// Reject the next `n` bulk requests as overloaded
    pub fn reject_next_bulks(&self, n: u32) {
        self.inner.lock().reject_bulks = n;
    }
}

fn apply(inner: &mut Inner, directive: &WriteDirective) -> BulkItemOutcome {
    let docs = inner.indices.entry(directive.index.clone()).or_default();
    let (outcome, mutation) = plan_write(docs.get(&directive.id), directive);
    match mutation {
        Mutation::Put(doc) => {
            docs.insert(directive.id.clone(), doc);
        }
        Mutation::Remove => {
            docs.remove(&directive.id);
        }
        Mutation::Nothing => {}
    }
    outcome
}

impl ScrollSource for MemoryIndex {
    fn open(&self, request: &ScrollRequest) -> Result<ScrollPage, CursorError> {
        let mut inner = self.inner.lock();

        let mut hits = VecDeque::new();
        for index in &request.indices {
            let docs = inner.indices.get(index).ok_or_else(|| CursorError::OpenFailed {
                indices: request.indices.join(","),
                reason: format!("no such index [{}]", index),
            })?;
            hits.extend(
                docs.iter()
                    .filter(|(id, doc)| is_hit(request, id, doc))
                    .map(|(id, doc)| doc.to_record(index, id)),
            );
        }

        inner.next_scroll += 1;
        let scroll_id = format!("mem-scroll-{}", inner.next_scroll);
        let mut ctx = ScrollContext {
            total: hits.len() as u64,
            remaining: hits,
            size: request.size.max(1),
            expires_at: lease_expiry(Instant::now(), request.keep_alive),
        };
        let page = ctx.page(&scroll_id);
        trace!(scroll_id = %scroll_id, total = ctx.total, "Opened memory scroll");
        inner.scrolls.insert(scroll_id, ctx);

        Ok(page)
    }

    fn next(&self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollPage, CursorError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.scrolls.get(scroll_id) {
            Some(ctx) => ctx.expires_at <= now,
            None => true,
        };
        if expired {
            inner.scrolls.remove(scroll_id);
            return Err(CursorError::Expired {
                scroll_id: scroll_id.to_string(),
            });
        }

        let ctx = inner.scrolls.get_mut(scroll_id).ok_or_else(|| CursorError::Expired {
            scroll_id: scroll_id.to_string(),
        })?;
        ctx.expires_at = lease_expiry(now, keep_alive);
        Ok(ctx.page(scroll_id))
    }

    fn close(&self, scroll_id: &str) -> Result<(), CursorError> {
        self.clear_calls.fetch_add(1, Ordering::Relaxed);
        match self.inner.lock().scrolls.remove(scroll_id) {
            Some(_) => Ok(()),
            None => Err(CursorError::CloseFailed {
                scroll_id: scroll_id.to_string(),
                reason: "no such scroll context".into(),
            }),
        }
    }
}

impl BulkSink for MemoryIndex {
    fn bulk(&self, directives: &[WriteDirective]) -> Result<Vec<BulkItemOutcome>, WriteError> {
        self.bulk_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        if inner.reject_bulks > 0 {
            inner.reject_bulks -= 1;
            return Err(WriteError::Rejected {
                reason: "bulk queue is full".into(),
            });
        }

        Ok(directives.iter().map(|d| apply(&mut inner, d)).collect())
    }
}
