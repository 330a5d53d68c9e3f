//! Reference document stores
//!
//! Two backends implement [`ScrollSource`](crate::cursor::ScrollSource) and
//! [`BulkSink`](crate::writer::BulkSink):
//!
//! - [`MemoryIndex`]: in-process, used by tests and benchmarks
//! - [`SqliteIndex`]: one SQLite file holding any number of indices
//!
//! Both apply the same write rules, defined here.

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

use crate::cursor::ScrollRequest;
use crate::doc::{fields, versions, BulkItemOutcome, OpType, SourceRecord, WriteDirective};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Stand-in lease when `now + keep_alive` cannot be represented
const FALLBACK_LEASE: Duration = Duration::from_secs(86_400 * 365);

/// A document as held by a store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub doc_type: String,
    pub source: String,
    pub version: i64,
    pub routing: Option<String>,
    pub parent: Option<String>,
    pub timestamp: Option<String>,
    pub ttl: Option<i64>,
}

impl StoredDocument {
    /// Build the scroll hit for this document
    pub fn to_record(&self, index: &str, id: &str) -> SourceRecord {
        let mut record = SourceRecord::new(index, &self.doc_type, id, &self.source).with_version(self.version);
        if let Some(routing) = &self.routing {
            record = record.with_field(fields::ROUTING, Value::String(routing.clone()));
        }
        if let Some(parent) = &self.parent {
            record = record.with_field(fields::PARENT, Value::String(parent.clone()));
        }
        if let Some(timestamp) = &self.timestamp {
            // timestamps come back as epoch millis when they are numeric
            let value = timestamp
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(timestamp.clone()));
            record = record.with_field(fields::TIMESTAMP, value);
        }
        if let Some(ttl) = self.ttl {
            record = record.with_field(fields::TTL, Value::from(ttl));
        }
        record
    }
}

/// Change a store must make for one directive
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Mutation {
    Put(StoredDocument),
    Remove,
    Nothing,
}

/// Decide the outcome of `directive` against the currently stored document
pub(crate) fn plan_write(current: Option<&StoredDocument>, directive: &WriteDirective) -> (BulkItemOutcome, Mutation) {
    let version_type = directive.version_type;
    let expected = directive.expected_version();

    if directive.version.is_some() && !version_type.validate_version_for_writes(expected) {
        return (
            BulkItemOutcome::Failure {
                id: directive.id.clone(),
                cause: format!(
                    "illegal version value [{}] for version type [{}]",
                    expected, version_type
                ),
            },
            Mutation::Nothing,
        );
    }

    let current_version = current.map(|doc| doc.version).unwrap_or(versions::NOT_FOUND);
    let deleting = directive.op == OpType::Delete;

    if version_type.is_version_conflict_for_writes(current_version, expected, deleting) {
        return (
            BulkItemOutcome::VersionConflict {
                id: directive.id.clone(),
            },
            Mutation::Nothing,
        );
    }

    match directive.op {
        OpType::Delete => match current {
            Some(_) => (BulkItemOutcome::Deleted, Mutation::Remove),
            None => (BulkItemOutcome::Noop, Mutation::Nothing),
        },
        OpType::Index => {
            let Some(source) = &directive.source else {
                return (
                    BulkItemOutcome::Failure {
                        id: directive.id.clone(),
                        cause: "index operation without a source".into(),
                    },
                    Mutation::Nothing,
                );
            };
            let doc = StoredDocument {
                doc_type: directive.doc_type.clone(),
                source: source.clone(),
                version: version_type.update_version(current_version, expected),
                routing: directive.routing.clone(),
                parent: directive.parent.clone(),
                timestamp: directive.timestamp.clone(),
                ttl: directive.ttl,
            };
            let outcome = if current.is_some() {
                BulkItemOutcome::Updated
            } else {
                BulkItemOutcome::Created
            };
            (outcome, Mutation::Put(doc))
        }
    }
}

/// Check if a stored document is a hit for `request`
/// Expiry of a scroll context renewed at `now`
pub(crate) fn lease_expiry(now: Instant, keep_alive: Duration) -> Instant {
    now.checked_add(keep_alive)
        .or_else(|| now.checked_add(FALLBACK_LEASE))
        .unwrap_or(now)
}

pub(crate) fn is_hit(request: &ScrollRequest, id: &str, doc: &StoredDocument) -> bool {
    (request.types.is_empty() || request.types.contains(&doc.doc_type))
        && request.slice.map_or(true, |slice| slice.claims(id))
        && request.query.matches(&doc.source)
}
