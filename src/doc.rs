//! Document types flowing through the reindex pipeline
//!
//! - [`SourceRecord`]: one hit returned by a scroll page
//! - [`WriteDirective`]: one operation submitted in a bulk request
//! - [`BulkItemOutcome`]: the position-aligned result of one directive
//! - [`VersionType`]: versioning policy applied by the destination

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Special version values understood by [`VersionType`]
pub mod versions {
    /// The document was looked up and not found
    pub const NOT_FOUND: i64 = -1;

    /// The store does not track versions for this document
    pub const NOT_SET: i64 = -2;

    /// No expected version; match whatever is stored
    pub const MATCH_ANY: i64 = -3;

    /// Expect the document to be deleted
    pub const MATCH_DELETED: i64 = -4;
}

/// Metadata field names preserved from source hits
pub mod fields {
    pub const ROUTING: &str = "_routing";
    pub const PARENT: &str = "_parent";
    pub const TIMESTAMP: &str = "_timestamp";
    pub const TTL: &str = "_ttl";
}

/// One hit from a scroll page
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Index the hit came from
    pub index: String,

    /// Document type
    pub doc_type: String,

    /// Document id
    pub id: String,

    /// Stored version, when the source tracks versions
    pub version: Option<i64>,

    /// Raw JSON source, exactly as stored
    pub source: String,

    /// Requested metadata fields (`_routing`, `_parent`, `_timestamp`, `_ttl`)
    pub fields: Map<String, Value>,
}

impl SourceRecord {
    /// Create a record with no metadata fields
    pub fn new(
        index: impl Into<String>,
        doc_type: impl Into<String>,
        id: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            id: id.into(),
            version: None,
            source: source.into(),
            fields: Map::new(),
        }
    }

    /// Set the stored version
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Attach a metadata field
    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Look up a metadata field, treating JSON null as absent
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }
}

/// Bulk operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Index,
    Delete,
}

/// One operation in a bulk request
#[derive(Debug, Clone, PartialEq)]
pub struct WriteDirective {
    pub op: OpType,
    pub index: String,
    pub doc_type: String,
    pub id: String,

    /// Document body; `None` for deletes
    pub source: Option<String>,

    pub routing: Option<String>,
    pub parent: Option<String>,

    /// Timestamp in the string form the destination expects
    pub timestamp: Option<String>,

    /// Time-to-live in milliseconds
    pub ttl: Option<i64>,

    /// Expected version; `None` means [`versions::MATCH_ANY`]
    pub version: Option<i64>,

    pub version_type: VersionType,
}

impl WriteDirective {
    /// Create an index directive with no metadata
    pub fn index(
        index: impl Into<String>,
        doc_type: impl Into<String>,
        id: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            op: OpType::Index,
            index: index.into(),
            doc_type: doc_type.into(),
            id: id.into(),
            source: Some(source.into()),
            routing: None,
            parent: None,
            timestamp: None,
            ttl: None,
            version: None,
            version_type: VersionType::Internal,
        }
    }

    /// Expected version, with the "any" sentinel filled in
    pub fn expected_version(&self) -> i64 {
        self.version.unwrap_or(versions::MATCH_ANY)
    }
}

/// Result of one write directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BulkItemOutcome {
    Created,
    Updated,
    Deleted,
    Noop,
    VersionConflict { id: String },
    Failure { id: String, cause: String },
}

impl BulkItemOutcome {
    /// Check if this outcome is a version conflict
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, BulkItemOutcome::VersionConflict { .. })
    }

    /// Check if this outcome mutated or confirmed the destination
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            BulkItemOutcome::Created
                | BulkItemOutcome::Updated
                | BulkItemOutcome::Deleted
                | BulkItemOutcome::Noop
        )
    }
}

/// Versioning policy applied by the destination when writing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    /// Destination assigns versions; an explicit version must match exactly
    #[default]
    Internal,
    /// Caller supplies versions; only strictly newer versions are accepted
    External,
    /// Caller supplies versions; equal or newer versions are accepted
    ExternalGte,
    /// Caller supplies versions; always accepted
    Force,
    /// Conflict rules of `Internal`, validation rules of `External`
    Reindex,
}

impl VersionType {
    /// Check if writing with `expected` over a stored `current` version is a
    /// conflict. `deleted` is true for delete operations.
    pub fn is_version_conflict_for_writes(self, current: i64, expected: i64, deleted: bool) -> bool {
        use versions::*;
        match self {
            VersionType::Internal | VersionType::Reindex => {
                if expected == MATCH_ANY || current == NOT_SET {
                    return false;
                }
                if current == NOT_FOUND {
                    return !(deleted && expected == MATCH_DELETED);
                }
                if expected == MATCH_DELETED {
                    return !deleted;
                }
                current != expected
            }
            VersionType::External => {
                if current == NOT_SET || current == NOT_FOUND {
                    return false;
                }
                if expected == MATCH_ANY {
                    return true;
                }
                current >= expected
            }
            VersionType::ExternalGte => {
                if current == NOT_SET || current == NOT_FOUND {
                    return false;
                }
                if expected == MATCH_ANY {
                    return true;
                }
                current > expected
            }
            VersionType::Force => {
                if current == NOT_SET || current == NOT_FOUND {
                    return false;
                }
                expected == MATCH_ANY
            }
        }
    }

    /// Version to store after a successful write
    pub fn update_version(self, current: i64, expected: i64) -> i64 {
        match self {
            VersionType::Internal | VersionType::Reindex => {
                if current == versions::NOT_SET || current == versions::NOT_FOUND {
                    1
                } else {
                    current + 1
                }
            }
            VersionType::External | VersionType::ExternalGte | VersionType::Force => expected,
        }
    }

    /// Check if `version` is acceptable as an expected version for writes
    pub fn validate_version_for_writes(self, version: i64) -> bool {
        match self {
            VersionType::Internal => version > 0 || version == versions::MATCH_ANY,
            _ => version > 0,
        }
    }

    /// Whether the source document's version is carried onto the directive
    pub fn carries_source_version(self) -> bool {
        matches!(
            self,
            VersionType::External | VersionType::ExternalGte | VersionType::Force
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VersionType::Internal => "internal",
            VersionType::External => "external",
            VersionType::ExternalGte => "external_gte",
            VersionType::Force => "force",
            VersionType::Reindex => "reindex",
        }
    }
}

impl fmt::Display for VersionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(VersionType::Internal),
            "external" | "external_gt" => Ok(VersionType::External),
            "external_gte" => Ok(VersionType::ExternalGte),
            "force" => Ok(VersionType::Force),
            "reindex" => Ok(VersionType::Reindex),
            other => Err(ConfigError::InvalidVersionType {
                value: other.to_string(),
            }),
        }
    }
}

/// Source-side filter applied before slicing
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Query {
    /// Every document in the source indices
    #[default]
    MatchAll,
    /// Documents whose top-level `field` equals `value`
    Term { field: String, value: Value },
}

impl Query {
    /// Evaluate the query against a raw JSON source
    pub fn matches(&self, source: &str) -> bool {
        match self {
            Query::MatchAll => true,
            Query::Term { field, value } => serde_json::from_str::<Map<String, Value>>(source)
                .map(|doc| doc.get(field) == Some(value))
                .unwrap_or(false),
        }
    }
}
