//! Error types for the gateway
//!
//! `GatewayError` is what callers of the facade see. Lower-level engine
//! faults arrive as `EngineError` and pass through `classify_engine_error`,
//! which decides whether the wire connection itself is gone.

use thiserror::Error;

use crate::command::CommandError;
use crate::engine::{EngineError, ProtocolErrorKind, TransportErrorKind};

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Substrings of protocol faults raised when the peer tore the socket down.
const CLOSED_PROTOCOL_MARKERS: [&str; 3] = ["wsasend", "wsarecv", "write:"];

/// Substring of transport faults raised when a read hit a dead socket.
const CLOSED_TRANSPORT_MARKER: &str = "read:";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("an existing connection was forcibly closed, please check your network")]
    ConnectionClosed,

    #[error("the connection session was lost, please connect again")]
    SessionLost,

    #[error("get client error: client not existed, session expired")]
    SessionExpired,

    #[error("there is no idle connection now, please try it later")]
    Capacity,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Query(String),

    #[error("local command error: {0}")]
    LocalCommand(#[from] CommandError),

    #[error("result normalization failed: {0}")]
    Normalize(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("config error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Get error code for the web layer
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::ConnectionClosed => "CONNECTION_CLOSED",
            GatewayError::SessionLost => "SESSION_LOST",
            GatewayError::SessionExpired => "SESSION_EXPIRED",
            GatewayError::Capacity => "CAPACITY",
            GatewayError::Auth(_) => "AUTH_FAILED",
            GatewayError::Query(_) => "QUERY_FAILED",
            GatewayError::LocalCommand(_) => "LOCAL_COMMAND",
            GatewayError::Normalize(_) => "NORMALIZE_FAILED",
            GatewayError::Engine(_) => "ENGINE_ERROR",
            GatewayError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// True when the session that produced this error must not be reused.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, GatewayError::ConnectionClosed)
    }
}

fn is_closed_protocol_error(kind: ProtocolErrorKind, message: &str) -> bool {
    kind == ProtocolErrorKind::Unknown
        && CLOSED_PROTOCOL_MARKERS.iter().any(|m| message.contains(m))
}

fn is_closed_transport_error(kind: TransportErrorKind, message: &str) -> bool {
    matches!(kind, TransportErrorKind::Unknown | TransportErrorKind::TimedOut)
        && message.contains(CLOSED_TRANSPORT_MARKER)
}

/// Map an engine fault onto the gateway taxonomy.
///
/// Only severed-socket signatures become `ConnectionClosed`; an auth
/// rejection stays `Auth`, everything else is reported verbatim as `Engine`.
pub fn classify_engine_error(err: EngineError) -> GatewayError {
    match err {
        EngineError::Protocol { kind, ref message } if is_closed_protocol_error(kind, message) => {
            GatewayError::ConnectionClosed
        }
        EngineError::Transport { kind, ref message } if is_closed_transport_error(kind, message) => {
            GatewayError::ConnectionClosed
        }
        EngineError::Auth(message) => GatewayError::Auth(message),
        other => GatewayError::Engine(other.to_string()),
    }
}

impl From<EngineError> for GatewayError {
    fn from(err: EngineError) -> Self {
        classify_engine_error(err)
    }
}
