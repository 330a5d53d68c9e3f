//! Scroll cursor sessions
//!
//! A [`CursorSession`] owns one server-side scroll context for the lifetime
//! of a slice. Every fetch renews the context's keep-alive; the context is
//! cleared when the session is closed or dropped, whichever comes first.

use crate::doc::{Query, SourceRecord};
use crate::error::CursorError;
use crate::slice::SliceSpec;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Parameters of the initial search
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollRequest {
    pub indices: Vec<String>,
    pub types: Vec<String>,
    pub query: Query,

    /// Restrict hits to one slice; `None` reads everything
    pub slice: Option<SliceSpec>,

    /// Hits per page
    pub size: usize,

    pub keep_alive: Duration,
}

/// One page of a scroll
#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    /// Id to pass to the next fetch
    pub scroll_id: String,

    /// Hits matching the search (and slice), across all pages
    pub total_hits: u64,

    /// Hits on this page; empty once the scroll is exhausted
    pub hits: Vec<SourceRecord>,
}

/// A paginated search backend
pub trait ScrollSource: Send + Sync {
    /// Run the search and return the first page
    fn open(&self, request: &ScrollRequest) -> Result<ScrollPage, CursorError>;

    /// Fetch the next page and renew the context for `keep_alive`
    fn next(&self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollPage, CursorError>;

    /// Release the context
    fn close(&self, scroll_id: &str) -> Result<(), CursorError>;
}

/// An open scroll owned by one slice
pub struct CursorSession {
    source: Arc<dyn ScrollSource>,
    scroll_id: Option<String>,
    keep_alive: Duration,
    matched: u64,
    first_page: Option<Vec<SourceRecord>>,
}

impl CursorSession {
    /// Run the initial search
    pub fn open(source: Arc<dyn ScrollSource>, request: &ScrollRequest) -> Result<Self, CursorError> {
        let page = source.open(request)?;

        debug!(
            scroll_id = %page.scroll_id,
            matched = page.total_hits,
            first_page = page.hits.len(),
            "Scroll opened"
        );

        Ok(Self {
            source,
            scroll_id: Some(page.scroll_id),
            keep_alive: request.keep_alive,
            matched: page.total_hits,
            first_page: Some(page.hits),
        })
    }

    /// Total hits reported by the initial search
    pub fn matched(&self) -> u64 {
        self.matched
    }

    /// Current scroll id, `None` once closed
    pub fn scroll_id(&self) -> Option<&str> {
        self.scroll_id.as_deref()
    }

    /// Next page of hits; empty when the scroll is exhausted.
    ///
    /// `extra_keep_alive` extends the lease by time the caller is about to
    /// spend throttled, so a slow slice does not lose its context.
    pub fn next_batch(&mut self, extra_keep_alive: Duration) -> Result<Vec<SourceRecord>, CursorError> {
        if let Some(hits) = self.first_page.take() {
            return Ok(hits);
        }

        let scroll_id = self.scroll_id.as_deref().ok_or_else(|| CursorError::Expired {
            scroll_id: String::new(),
        })?;

        let keep_alive = self.keep_alive.saturating_add(extra_keep_alive);
        let page = self.source.next(scroll_id, keep_alive)?;
        trace!(scroll_id = %page.scroll_id, hits = page.hits.len(), "Fetched scroll page");

        self.scroll_id = Some(page.scroll_id);
        Ok(page.hits)
    }

    /// Clear the scroll context.
    ///
    /// Errors are logged and swallowed so they never mask the slice's own
    /// outcome. Calling this twice is harmless.
    pub fn close(&mut self) {
        if let Some(scroll_id) = self.scroll_id.take() {
            match self.source.close(&scroll_id) {
                Ok(()) => trace!(scroll_id = %scroll_id, "Scroll cleared"),
                Err(e) => warn!(scroll_id = %scroll_id, error = %e, "Failed to clear scroll"),
            }
        }
    }
}

impl Drop for CursorSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for CursorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorSession")
            .field("scroll_id", &self.scroll_id)
            .field("keep_alive", &self.keep_alive)
            .field("matched", &self.matched)
            .finish()
    }
}
