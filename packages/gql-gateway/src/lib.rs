//! gql-gateway - session-multiplexing gateway for a session-oriented graph engine
//!
//! Web requests arrive as batches of statements addressed to a logical
//! client. Each client owns a small pool of engine sessions and a parameter
//! map; results come back flattened into JSON-friendly rows with the graph
//! elements they mention harvested into side lists.

pub mod client;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod normalize;
pub mod pool;
pub mod registry;
pub mod value;

pub use client::{BatchReply, ClientState, ClientSummary, StatementOutcome};
pub use config::GatewayConfig;
pub use engine::{
    AuthReply, EngineConnection, EngineConnector, EngineError, EngineSession, EngineValue, HostAddress,
    ResultSet,
};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use normalize::{NormalizedResult, Normalizer, Row};
pub use value::{GenericValue, ParameterMap};
