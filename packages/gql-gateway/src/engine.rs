//! Engine contract - what the gateway consumes from the graph engine
//!
//! The wire transport and handshake live outside this crate. A driver plugs
//! in by implementing `EngineConnector` (open a connection), `EngineConnection`
//! (authenticate, then bind a session) and `EngineSession` (run statements).
//!
//! Result data crosses the boundary as a `ResultSet` of `EngineValue`s, a
//! closed variant type mirroring the engine's value model. The normalizer
//! walks it with a single recursive visitor.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

use crate::value::{ParameterMap, EMPTY_SENTINEL};

// ============================================================================
// Errors
// ============================================================================

/// Protocol exception category reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    Unknown,
    InvalidData,
    NegativeSize,
    SizeLimit,
    BadVersion,
    NotImplemented,
    DepthLimit,
}

/// Transport exception category reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Unknown,
    NotOpen,
    AlreadyOpen,
    TimedOut,
    EndOfFile,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("protocol error ({kind:?}): {message}")]
    Protocol { kind: ProtocolErrorKind, message: String },

    #[error("transport error ({kind:?}): {message}")]
    Transport { kind: TransportErrorKind, message: String },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

// ============================================================================
// Connection contract
// ============================================================================

/// Address of one engine endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Reply to a successful handshake round-trip.
///
/// `status` is the engine's own status string; anything other than
/// `"SUCCESS"` is a rejection even though the call itself returned `Ok`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthReply {
    pub identifier: i64,
    pub status: String,
}

impl AuthReply {
    pub const SUCCESS: &'static str = "SUCCESS";

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}

/// Opens raw connections to the engine.
#[async_trait]
pub trait EngineConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        host: &HostAddress,
        timeout: Duration,
    ) -> Result<Box<dyn EngineConnection>, EngineError>;
}

/// One open, not yet session-bound connection.
#[async_trait]
pub trait EngineConnection: Send {
    async fn authenticate(&mut self, username: &str, password: &str) -> Result<AuthReply, EngineError>;

    /// Bind the connection to an engine-assigned session identifier.
    ///
    /// Extra sessions of one logical client reuse the identifier obtained at
    /// authentication time; they are never re-authenticated.
    fn into_session(self: Box<Self>, identifier: i64) -> Box<dyn EngineSession>;
}

/// One stateful engine session.
#[async_trait]
pub trait EngineSession: Send + Sync {
    async fn execute(&self, statement: &str, params: &ParameterMap) -> Result<ResultSet, EngineError>;

    /// Release the underlying connection. Called at most once.
    async fn release(&self);
}

// ============================================================================
// Value model
// ============================================================================

/// Engine duration: calendar months plus an exact span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineDuration {
    pub months: i64,
    pub seconds: i64,
    pub microseconds: i32,
}

impl fmt::Display for EngineDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let years = self.months / 12;
        let months = self.months % 12;
        let days = self.seconds / 86_400;
        let rest = self.seconds % 86_400;
        let (hours, minutes, seconds) = (rest / 3600, (rest % 3600) / 60, rest % 60);
        write!(f, "P{}Y{}M{}DT{}H{}M{}", years, months, days, hours, minutes, seconds)?;
        if self.microseconds != 0 {
            write!(f, ".{:06}", self.microseconds.unsigned_abs())?;
        }
        write!(f, "S")
    }
}

/// A graph vertex as returned by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: EngineValue,
    pub labels: Vec<String>,
    pub properties: BTreeMap<String, EngineValue>,
}

/// A directed, ranked relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub src: EngineValue,
    pub dst: EngineValue,
    pub name: String,
    pub rank: i64,
    pub properties: BTreeMap<String, EngineValue>,
}

/// Alternating node/relationship walk; `relationships.len() + 1 == nodes.len()`
/// for a well-formed path.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
}

/// Engine-native value, one variant per engine type.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineValue {
    Empty,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    LocalTime(NaiveTime),
    LocalDateTime(NaiveDateTime),
    Duration(EngineDuration),
    Node(Box<Node>),
    Edge(Box<Relationship>),
    Path(Box<Path>),
    List(Vec<EngineValue>),
    Set(Vec<EngineValue>),
    Map(BTreeMap<String, EngineValue>),
    Geography(String),
    /// A type this gateway has no decoder for; carries the driver's text.
    Opaque { type_name: String, text: String },
}

impl EngineValue {
    /// Declared type name, as the engine reports it.
    pub fn type_name(&self) -> &str {
        match self {
            EngineValue::Empty => "empty",
            EngineValue::Null => "null",
            EngineValue::Bool(_) => "bool",
            EngineValue::Int(_) => "int",
            EngineValue::Float(_) => "float",
            EngineValue::String(_) => "string",
            EngineValue::Date(_) => "date",
            EngineValue::LocalTime(_) => "localTime",
            EngineValue::LocalDateTime(_) => "localDatetime",
            EngineValue::Duration(_) => "duration",
            EngineValue::Node(_) => "vertex",
            EngineValue::Edge(_) => "edge",
            EngineValue::Path(_) => "path",
            EngineValue::List(_) => "list",
            EngineValue::Set(_) => "set",
            EngineValue::Map(_) => "map",
            EngineValue::Geography(_) => "geography",
            EngineValue::Opaque { type_name, .. } => type_name,
        }
    }
}

impl fmt::Display for EngineValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineValue::Empty => write!(f, "{}", EMPTY_SENTINEL),
            EngineValue::Null => write!(f, "NULL"),
            EngineValue::Bool(b) => write!(f, "{}", b),
            EngineValue::Int(i) => write!(f, "{}", i),
            EngineValue::Float(x) => write!(f, "{}", x),
            EngineValue::String(s) => write!(f, "{:?}", s),
            EngineValue::Date(d) => write!(f, "{}", d),
            EngineValue::LocalTime(t) => write!(f, "{}", t),
            EngineValue::LocalDateTime(dt) => write!(f, "{}", dt),
            EngineValue::Duration(d) => write!(f, "{}", d),
            EngineValue::Node(node) => {
                write!(f, "({}", node.id)?;
                for label in &node.labels {
                    write!(f, " :{}", label)?;
                }
                write!(f, ")")
            }
            EngineValue::Edge(rel) => write!(f, "{}-[:{}@{}]->{}", rel.src, rel.name, rel.rank, rel.dst),
            EngineValue::Path(path) => {
                write!(f, "<")?;
                for (i, node) in path.nodes.iter().enumerate() {
                    if i > 0 {
                        write!(f, "-")?;
                    }
                    write!(f, "({})", node.id)?;
                }
                write!(f, ">")
            }
            EngineValue::List(items) => write_seq(f, "[", items, "]"),
            EngineValue::Set(items) => write_seq(f, "{", items, "}"),
            EngineValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            EngineValue::Geography(text) => write!(f, "{}", text),
            EngineValue::Opaque { text, .. } => write!(f, "{}", text),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[EngineValue], close: &str) -> fmt::Result {
    write!(f, "{}", open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    write!(f, "{}", close)
}

// ============================================================================
// Result set
// ============================================================================

/// Outcome status of one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStatus {
    pub code: String,
    pub message: String,
}

impl QueryStatus {
    pub fn success() -> Self {
        Self { code: "SUCCESS".to_string(), message: String::new() }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }

    pub fn is_success(&self) -> bool {
        self.code == "SUCCESS"
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Engine answer to one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub status: QueryStatus,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<EngineValue>>,
    /// Engine-side execution time in microseconds.
    pub latency_us: i64,
    /// Present when the statement was `EXPLAIN`/`PROFILE`-style.
    pub plan_description: Option<Vec<(String, String)>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<EngineValue>>) -> Self {
        Self {
            status: QueryStatus::success(),
            columns,
            rows,
            latency_us: 0,
            plan_description: None,
        }
    }

    pub fn failed(status: QueryStatus) -> Self {
        Self {
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            latency_us: 0,
            plan_description: None,
        }
    }

    pub fn with_latency(mut self, latency_us: i64) -> Self {
        self.latency_us = latency_us;
        self
    }

    pub fn with_plan_description(mut self, entries: Vec<(String, String)>) -> Self {
        self.plan_description = Some(entries);
        self
    }

    pub fn is_succeeded(&self) -> bool {
        self.status.is_success()
    }

    pub fn status(&self) -> &QueryStatus {
        &self.status
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn latency(&self) -> i64 {
        self.latency_us
    }

    pub fn plan_description(&self) -> Option<&[(String, String)]> {
        self.plan_description.as_deref()
    }

    /// Accessor for one cell; ragged rows surface as errors, not panics.
    pub fn cell(&self, row: usize, col: usize) -> Result<&EngineValue, EngineError> {
        let record = self
            .rows
            .get(row)
            .ok_or_else(|| EngineError::Other(format!("row index {} out of range", row)))?;
        record.get(col).ok_or_else(|| {
            EngineError::Other(format!("column index {} out of range in row {}", col, row))
        })
    }
}
