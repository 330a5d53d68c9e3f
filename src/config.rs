//! Configuration types for bulk-reindex
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - The immutable [`JobRequest`] and its validating builder
//! - Value types for throttling, conflict handling and routing

use crate::doc::{Query, VersionType};
use crate::error::ConfigError;
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

/// Default documents per scroll page
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Batch size limits
const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 10_000;

/// Maximum slice count
pub const MAX_SLICES: u32 = 1024;

/// Default scroll keep-alive
pub const DEFAULT_SCROLL_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

/// Longest scroll keep-alive a request may ask for
pub const MAX_SCROLL_KEEP_ALIVE: Duration = Duration::from_secs(60 * 60 * 24);

/// Default number of failures kept in a job status
pub const DEFAULT_MAX_FAILURES: usize = 100;

/// Default retries for rejected bulk requests
pub const DEFAULT_MAX_RETRIES: u32 = 11;

/// Default initial backoff for rejected bulk requests
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound for a single throttle delay
pub const MAX_THROTTLE_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Regex for validating index names
static INDEX_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._+-]*$").expect("Invalid index name regex"));

/// Bulk-by-scroll reindex between document stores
#[derive(Parser, Debug, Clone)]
#[command(
    name = "bulk-reindex",
    version,
    about = "Copy documents between indices with slicing, throttling and durable task status",
    long_about = "Scrolls over a source index, optionally rewrites every document through a named script,\n\
                  and bulk-writes the result into a destination index.\n\n\
                  Progress is persisted in a task database so a job can be inspected, rethrottled\n\
                  or cancelled from another process while it runs.",
    after_help = "EXAMPLES:\n    \
        bulk-reindex reindex src.db twitter dst.db new_twitter\n    \
        bulk-reindex reindex src.db twitter dst.db new_twitter --slices 4 --requests-per-second 500\n    \
        bulk-reindex reindex src.db twitter dst.db new_twitter --script set-field --param field=flag --param value=true\n    \
        bulk-reindex status --tasks-db tasks.db 2b9f...\n    \
        bulk-reindex rethrottle --tasks-db tasks.db 2b9f... -1"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a reindex job
    Reindex(ReindexArgs),

    /// Show the persisted status of a job
    Status {
        /// Task database
        #[arg(long, default_value = "tasks.db", value_name = "FILE")]
        tasks_db: PathBuf,

        /// Task id printed when the job started
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// Change the throttle of a running job (-1 removes throttling)
    Rethrottle {
        /// Task database
        #[arg(long, default_value = "tasks.db", value_name = "FILE")]
        tasks_db: PathBuf,

        /// Task id printed when the job started
        #[arg(value_name = "TASK_ID")]
        task_id: String,

        /// New requests per second
        #[arg(value_name = "RPS", allow_hyphen_values = true)]
        requests_per_second: RequestsPerSecond,
    },

    /// Cancel a running job
    Cancel {
        /// Task database
        #[arg(long, default_value = "tasks.db", value_name = "FILE")]
        tasks_db: PathBuf,

        /// Task id printed when the job started
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },
}

/// Arguments of the `reindex` subcommand
#[derive(Args, Debug, Clone)]
pub struct ReindexArgs {
    /// Source SQLite database
    #[arg(value_name = "SOURCE_DB")]
    pub source_db: PathBuf,

    /// Source index (comma separated for several)
    #[arg(value_name = "SOURCE_INDEX")]
    pub source_index: String,

    /// Destination SQLite database
    #[arg(value_name = "DEST_DB")]
    pub dest_db: PathBuf,

    /// Destination index
    #[arg(value_name = "DEST_INDEX")]
    pub dest_index: String,

    /// Only copy documents of this type
    #[arg(long, value_name = "TYPE")]
    pub source_type: Option<String>,

    /// Destination type (defaults to each document's own type)
    #[arg(long, value_name = "TYPE")]
    pub dest_type: Option<String>,

    /// Only copy documents whose top-level field equals a value (field=value)
    #[arg(long, value_name = "FIELD=VALUE")]
    pub term: Option<String>,

    /// Maximum documents to process (-1 for all)
    #[arg(long, default_value = "-1", allow_hyphen_values = true, value_name = "NUM")]
    pub size: i64,

    /// Number of slices, or "auto" for one per CPU
    #[arg(long, default_value = "1", value_name = "NUM")]
    pub slices: String,

    /// Throttle in documents per second (-1 for unlimited)
    #[arg(long, default_value = "-1", allow_hyphen_values = true, value_name = "RPS")]
    pub requests_per_second: RequestsPerSecond,

    /// What to do on version conflicts
    #[arg(long, default_value = "proceed", value_name = "proceed|abort")]
    pub conflicts: Conflicts,

    /// Documents per scroll page
    #[arg(short = 'b', long, default_value_t = DEFAULT_BATCH_SIZE, value_name = "NUM")]
    pub batch_size: usize,

    /// Named script applied to every document
    #[arg(long, value_name = "NAME")]
    pub script: Option<String>,

    /// Script parameter (can be repeated)
    #[arg(long = "param", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
    pub params: Vec<String>,

    /// Destination version type
    #[arg(long, default_value = "internal", value_name = "TYPE")]
    pub version_type: VersionType,

    /// Routing policy: keep, discard or =VALUE
    #[arg(long, default_value = "keep", value_name = "POLICY")]
    pub routing: Routing,

    /// Scroll keep-alive in seconds
    #[arg(long, default_value = "300", value_name = "SECS")]
    pub scroll: u64,

    /// Failures kept in the job status
    #[arg(long, default_value_t = DEFAULT_MAX_FAILURES, value_name = "NUM")]
    pub max_failures: usize,

    /// Task database used to persist progress
    #[arg(long, default_value = "tasks.db", value_name = "FILE")]
    pub tasks_db: PathBuf,
}

/// Throttle for a job, shared out evenly between its slices
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RequestsPerSecond {
    /// No delay between batches
    #[default]
    Unlimited,
    /// At most this many documents per second
    Limited(f64),
}

impl RequestsPerSecond {
    /// Build from a float; `-1` and infinity mean unlimited
    pub fn new(value: f64) -> Result<Self, ConfigError> {
        if value == -1.0 || value == f64::INFINITY {
            return Ok(RequestsPerSecond::Unlimited);
        }
        if value.is_finite() && value > 0.0 {
            return Ok(RequestsPerSecond::Limited(value));
        }
        Err(ConfigError::InvalidRequestsPerSecond {
            value: value.to_string(),
        })
    }

    /// Check if this rate applies no throttling
    pub fn is_unlimited(&self) -> bool {
        matches!(self, RequestsPerSecond::Unlimited)
    }

    /// Rate for one of `slices` slices
    pub fn per_slice(self, slices: u32) -> Self {
        match self {
            RequestsPerSecond::Limited(rps) if slices > 1 => {
                RequestsPerSecond::Limited(rps / slices as f64)
            }
            other => other,
        }
    }

    /// Wire value: the rate, or -1 for unlimited
    pub fn as_f64(&self) -> f64 {
        match self {
            RequestsPerSecond::Unlimited => -1.0,
            RequestsPerSecond::Limited(rps) => *rps,
        }
    }

    /// Time a batch of `batch_size` documents should take at this rate
    pub fn delay_for(&self, batch_size: usize) -> Duration {
        match self {
            RequestsPerSecond::Unlimited => Duration::ZERO,
            RequestsPerSecond::Limited(rps) => {
                Duration::try_from_secs_f64(batch_size as f64 / rps)
                    .map(|d| d.min(MAX_THROTTLE_DELAY))
                    .unwrap_or(MAX_THROTTLE_DELAY)
            }
        }
    }
}

impl fmt::Display for RequestsPerSecond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestsPerSecond::Unlimited => f.write_str("unlimited"),
            RequestsPerSecond::Limited(rps) => write!(f, "{}", rps),
        }
    }
}

impl FromStr for RequestsPerSecond {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unlimited" | "inf" | "Infinity" => Ok(RequestsPerSecond::Unlimited),
            other => {
                let value = other
                    .parse::<f64>()
                    .map_err(|_| ConfigError::InvalidRequestsPerSecond {
                        value: other.to_string(),
                    })?;
                RequestsPerSecond::new(value)
            }
        }
    }
}

impl Serialize for RequestsPerSecond {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for RequestsPerSecond {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        RequestsPerSecond::new(value).map_err(serde::de::Error::custom)
    }
}

/// Version conflict policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conflicts {
    /// Count conflicts and keep going
    #[default]
    Proceed,
    /// Fail the whole job on the first conflict
    Abort,
}

impl Conflicts {
    pub fn abort_on_version_conflict(self) -> bool {
        self == Conflicts::Abort
    }
}

impl FromStr for Conflicts {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proceed" => Ok(Conflicts::Proceed),
            "abort" => Ok(Conflicts::Abort),
            other => Err(ConfigError::InvalidConflicts {
                value: other.to_string(),
            }),
        }
    }
}

/// Routing applied to destination documents
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Routing {
    /// Copy the source document's routing
    #[default]
    Keep,
    /// Drop routing
    Discard,
    /// Use a fixed routing value
    Fixed(String),
}

impl FromStr for Routing {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Routing::Keep),
            "discard" => Ok(Routing::Discard),
            other => match other.strip_prefix('=') {
                Some(value) => Ok(Routing::Fixed(value.to_string())),
                None => Err(ConfigError::InvalidParam {
                    value: other.to_string(),
                }),
            },
        }
    }
}

/// What to read
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpec {
    pub indices: Vec<String>,
    pub types: Vec<String>,
    pub query: Query,
    pub batch_size: usize,

    /// Pagination offset; only present so it can be rejected
    pub from: Option<usize>,

    pub keep_alive: Duration,
}

impl Default for SearchSpec {
    fn default() -> Self {
        Self {
            indices: Vec::new(),
            types: Vec::new(),
            query: Query::MatchAll,
            batch_size: DEFAULT_BATCH_SIZE,
            from: None,
            keep_alive: DEFAULT_SCROLL_KEEP_ALIVE,
        }
    }
}

/// Where to write
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Destination {
    pub index: String,

    /// Type for written documents; `None` keeps each document's own type
    pub doc_type: Option<String>,

    pub version_type: VersionType,
    pub routing: Routing,
}

/// A named script and its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptSpec {
    pub name: String,
    pub params: Map<String, Value>,
}

impl ScriptSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Validated, immutable description of one reindex job
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    search: SearchSpec,
    destination: Destination,
    script: Option<ScriptSpec>,
    max_docs: i64,
    abort_on_version_conflict: bool,
    slices: u32,
    requests_per_second: RequestsPerSecond,
    max_failures: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl JobRequest {
    /// Start building a request
    pub fn builder() -> JobRequestBuilder {
        JobRequestBuilder::default()
    }

    /// Create and validate a request from CLI arguments
    pub fn from_args(args: &ReindexArgs) -> Result<Self, ConfigError> {
        let mut builder = JobRequest::builder()
            .destination(args.dest_index.trim())
            .dest_version_type(args.version_type)
            .dest_routing(args.routing.clone())
            .size(args.size)
            .conflicts(args.conflicts)
            .slices(parse_slices(&args.slices)?)
            .requests_per_second(args.requests_per_second)
            .batch_size(args.batch_size)
            .keep_alive(Duration::from_secs(args.scroll))
            .max_failures(args.max_failures);

        for index in args.source_index.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            builder = builder.source_index(index);
        }
        if let Some(t) = &args.source_type {
            builder = builder.source_type(t);
        }
        if let Some(t) = &args.dest_type {
            builder = builder.dest_type(t);
        }
        if let Some(term) = &args.term {
            let (field, value) = parse_param(term)?;
            builder = builder.query(Query::Term { field, value });
        }
        if let Some(name) = &args.script {
            let mut script = ScriptSpec::new(name.trim());
            for raw in &args.params {
                let (key, value) = parse_param(raw)?;
                script.params.insert(key, value);
            }
            builder = builder.script(script);
        }

        builder.build()
    }

    pub fn search(&self) -> &SearchSpec {
        &self.search
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn script(&self) -> Option<&ScriptSpec> {
        self.script.as_ref()
    }

    /// Document budget; -1 means unbounded
    pub fn max_docs(&self) -> i64 {
        self.max_docs
    }

    /// Document budget as an option
    pub fn max_docs_limit(&self) -> Option<u64> {
        (self.max_docs >= 0).then_some(self.max_docs as u64)
    }

    pub fn abort_on_version_conflict(&self) -> bool {
        self.abort_on_version_conflict
    }

    pub fn slices(&self) -> u32 {
        self.slices
    }

    pub fn requests_per_second(&self) -> RequestsPerSecond {
        self.requests_per_second
    }

    pub fn max_failures(&self) -> usize {
        self.max_failures
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Scroll page size: never larger than the document budget
    pub fn effective_batch_size(&self) -> usize {
        match self.max_docs_limit() {
            Some(limit) => self.search.batch_size.min(limit as usize),
            None => self.search.batch_size,
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        let mut b = String::from("reindex from ");
        if self.search.indices.is_empty() {
            b.push_str("[all indices]");
        } else {
            b.push_str(&format!("{:?}", self.search.indices));
        }
        if !self.search.types.is_empty() {
            b.push_str(&format!("{:?}", self.search.types));
        }
        b.push_str(" to [");
        b.push_str(&self.destination.index);
        b.push(']');
        if let Some(t) = &self.destination.doc_type {
            b.push_str(&format!("[{}]", t));
        }
        b
    }
}

/// Builder for [`JobRequest`]
#[derive(Debug, Clone)]
pub struct JobRequestBuilder {
    search: SearchSpec,
    destination: Destination,
    script: Option<ScriptSpec>,
    max_docs: i64,
    abort_on_version_conflict: bool,
    slices: u32,
    requests_per_second: RequestsPerSecond,
    max_failures: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Default for JobRequestBuilder {
    fn default() -> Self {
        Self {
            search: SearchSpec::default(),
            destination: Destination::default(),
            script: None,
            max_docs: -1,
            abort_on_version_conflict: false,
            slices: 1,
            requests_per_second: RequestsPerSecond::Unlimited,
            max_failures: DEFAULT_MAX_FAILURES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl JobRequestBuilder {
    pub fn source_index(mut self, index: impl Into<String>) -> Self {
        self.search.indices.push(index.into());
        self
    }

    pub fn source_type(mut self, doc_type: impl Into<String>) -> Self {
        self.search.types.push(doc_type.into());
        self
    }

    pub fn query(mut self, query: Query) -> Self {
        self.search.query = query;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.search.batch_size = size;
        self
    }

    pub fn from(mut self, from: usize) -> Self {
        self.search.from = Some(from);
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.search.keep_alive = keep_alive;
        self
    }

    pub fn destination(mut self, index: impl Into<String>) -> Self {
        self.destination.index = index.into();
        self
    }

    pub fn dest_type(mut self, doc_type: impl Into<String>) -> Self {
        self.destination.doc_type = Some(doc_type.into());
        self
    }

    pub fn dest_version_type(mut self, version_type: VersionType) -> Self {
        self.destination.version_type = version_type;
        self
    }

    pub fn dest_routing(mut self, routing: Routing) -> Self {
        self.destination.routing = routing;
        self
    }

    pub fn script(mut self, script: ScriptSpec) -> Self {
        self.script = Some(script);
        self
    }

    /// Maximum documents to process; -1 for all
    pub fn size(mut self, size: i64) -> Self {
        self.max_docs = size;
        self
    }

    pub fn abort_on_version_conflict(mut self, abort: bool) -> Self {
        self.abort_on_version_conflict = abort;
        self
    }

    pub fn conflicts(self, conflicts: Conflicts) -> Self {
        self.abort_on_version_conflict(conflicts.abort_on_version_conflict())
    }

    pub fn slices(mut self, slices: u32) -> Self {
        self.slices = slices;
        self
    }

    pub fn requests_per_second(mut self, rps: RequestsPerSecond) -> Self {
        self.requests_per_second = rps;
        self
    }

    pub fn max_failures(mut self, max: usize) -> Self {
        self.max_failures = max;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Validate and freeze the request
    pub fn build(self) -> Result<JobRequest, ConfigError> {
        if self.max_docs < -1 {
            return Err(ConfigError::InvalidSize {
                size: self.max_docs,
            });
        }

        if self.slices == 0 || self.slices > MAX_SLICES {
            return Err(ConfigError::InvalidSlices {
                slices: self.slices,
                max: MAX_SLICES,
            });
        }

        if self.search.batch_size < MIN_BATCH_SIZE || self.search.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidBatchSize {
                size: self.search.batch_size,
                min: MIN_BATCH_SIZE,
                max: MAX_BATCH_SIZE,
            });
        }

        if self.search.from.is_some() {
            return Err(ConfigError::FromNotSupported);
        }

        if self.search.keep_alive.is_zero() || self.search.keep_alive > MAX_SCROLL_KEEP_ALIVE {
            return Err(ConfigError::InvalidKeepAlive {
                secs: self.search.keep_alive.as_secs(),
                max: MAX_SCROLL_KEEP_ALIVE.as_secs(),
            });
        }

        if self.search.indices.is_empty() {
            return Err(ConfigError::MissingSource);
        }

        if self.destination.index.is_empty() {
            return Err(ConfigError::MissingDestination);
        }

        for name in self.search.indices.iter().chain([&self.destination.index]) {
            validate_index_name(name)?;
        }

        if self.search.indices.contains(&self.destination.index) {
            return Err(ConfigError::SelfReindex {
                index: self.destination.index.clone(),
            });
        }

        Ok(JobRequest {
            search: self.search,
            destination: self.destination,
            script: self.script,
            max_docs: self.max_docs,
            abort_on_version_conflict: self.abort_on_version_conflict,
            slices: self.slices,
            requests_per_second: self.requests_per_second,
            max_failures: self.max_failures,
            max_retries: self.max_retries,
            retry_backoff: self.retry_backoff,
        })
    }
}

/// Check an index name against the allowed character set
pub fn validate_index_name(name: &str) -> Result<(), ConfigError> {
    if INDEX_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIndexName {
            name: name.to_string(),
            reason: "must be lowercase and may only contain [a-z0-9._+-]".into(),
        })
    }
}

/// Parse a slice count; "auto" means one per CPU
pub fn parse_slices(value: &str) -> Result<u32, ConfigError> {
    if value == "auto" {
        return Ok((num_cpus::get() as u32).clamp(1, MAX_SLICES));
    }
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::InvalidSlices {
            slices: 0,
            max: MAX_SLICES,
        })
}

/// Parse `key=value`; the value is JSON if it parses as JSON, else a string
pub fn parse_param(raw: &str) -> Result<(String, Value), ConfigError> {
    let (key, value) = raw.split_once('=').ok_or_else(|| ConfigError::InvalidParam {
        value: raw.to_string(),
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::InvalidParam {
            value: raw.to_string(),
        });
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
