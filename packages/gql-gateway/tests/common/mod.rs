//! Scripted in-memory engine shared by the integration tests.
//!
//! Statements steer the engine by keyword:
//!
//! - `FAIL`     -> failed status `E_SEMANTIC_ERROR`
//! - `SEVER`    -> protocol fault that reads as a severed socket
//! - `PANIC`    -> the session panics mid-execute
//! - `SLOW`     -> sleeps 200ms before answering
//! - `VERTEX`   -> one row holding a vertex, an edge and a path
//! - otherwise  -> one row `{statement, params}` echoing what was run

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use gql_gateway::engine::{
    EngineConnection, EngineConnector, EngineError, EngineSession, EngineValue, HostAddress, Node, Path,
    ProtocolErrorKind, QueryStatus, Relationship, ResultSet,
};
use gql_gateway::{AuthReply, Gateway, GatewayConfig, ParameterMap};

pub const PASSWORD: &str = "nebula";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One statement as the engine saw it.
#[derive(Debug, Clone)]
pub struct Executed {
    pub identifier: i64,
    pub statement: String,
    pub params: ParameterMap,
}

#[derive(Default)]
pub struct EngineLog {
    next_identifier: AtomicI64,
    pub connects: AtomicUsize,
    pub authentications: AtomicUsize,
    pub released: AtomicUsize,
    executed: Mutex<Vec<Executed>>,
}

impl EngineLog {
    pub fn executed(&self) -> Vec<Executed> {
        self.executed.lock().clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.executed.lock().iter().map(|e| e.statement.clone()).collect()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

pub struct ScriptedConnector {
    pub log: Arc<EngineLog>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        let log = EngineLog::default();
        log.next_identifier.store(1000, Ordering::SeqCst);
        Self { log: Arc::new(log) }
    }
}

#[async_trait]
impl EngineConnector for ScriptedConnector {
    async fn connect(&self, host: &HostAddress, _timeout: Duration) -> Result<Box<dyn EngineConnection>, EngineError> {
        if host.port == 0 {
            return Err(EngineError::Other(format!("dial {}: connection refused", host)));
        }
        self.log.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection { log: Arc::clone(&self.log) }))
    }
}

struct ScriptedConnection {
    log: Arc<EngineLog>,
}

#[async_trait]
impl EngineConnection for ScriptedConnection {
    async fn authenticate(&mut self, _username: &str, password: &str) -> Result<AuthReply, EngineError> {
        self.log.authentications.fetch_add(1, Ordering::SeqCst);
        if password != PASSWORD {
            return Ok(AuthReply { identifier: 0, status: "E_BAD_USERNAME_PASSWORD".to_string() });
        }
        let identifier = self.log.next_identifier.fetch_add(1, Ordering::SeqCst);
        Ok(AuthReply { identifier, status: AuthReply::SUCCESS.to_string() })
    }

    fn into_session(self: Box<Self>, identifier: i64) -> Box<dyn EngineSession> {
        Box::new(ScriptedSession { identifier, log: self.log })
    }
}

struct ScriptedSession {
    identifier: i64,
    log: Arc<EngineLog>,
}

#[async_trait]
impl EngineSession for ScriptedSession {
    async fn execute(&self, statement: &str, params: &ParameterMap) -> Result<ResultSet, EngineError> {
        self.log.executed.lock().push(Executed {
            identifier: self.identifier,
            statement: statement.to_string(),
            params: params.clone(),
        });

        if statement.contains("SLOW") {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if statement.contains("PANIC") {
            panic!("session exploded on {}", statement);
        }
        if statement.contains("SEVER") {
            return Err(EngineError::Protocol {
                kind: ProtocolErrorKind::Unknown,
                message: "write: broken pipe".to_string(),
            });
        }
        if statement.contains("FAIL") {
            return Ok(ResultSet::failed(QueryStatus::failure("E_SEMANTIC_ERROR", "no such tag")));
        }
        if statement.contains("VERTEX") {
            return Ok(graph_result());
        }

        let names = params.keys().cloned().map(EngineValue::String).collect();
        Ok(ResultSet::new(
            vec!["statement".to_string(), "params".to_string()],
            vec![vec![EngineValue::String(statement.to_string()), EngineValue::List(names)]],
        )
        .with_latency(42))
    }

    async fn release(&self) {
        self.log.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn node(id: &str, tag: &str) -> Node {
    Node {
        id: EngineValue::String(id.to_string()),
        labels: vec![tag.to_string()],
        properties: BTreeMap::from([("name".to_string(), EngineValue::String(id.to_string()))]),
    }
}

pub fn relationship(src: &str, dst: &str) -> Relationship {
    Relationship {
        src: EngineValue::String(src.to_string()),
        dst: EngineValue::String(dst.to_string()),
        name: "follow".to_string(),
        rank: 0,
        properties: BTreeMap::from([("degree".to_string(), EngineValue::Int(90))]),
    }
}

fn graph_result() -> ResultSet {
    let path = Path {
        nodes: vec![node("a", "player"), node("b", "player")],
        relationships: vec![relationship("a", "b")],
    };
    ResultSet::new(
        vec!["v".to_string(), "e".to_string(), "p".to_string()],
        vec![vec![
            EngineValue::Node(Box::new(node("a", "player"))),
            EngineValue::Edge(Box::new(relationship("a", "b"))),
            EngineValue::Path(Box::new(path)),
        ]],
    )
}

pub fn config() -> GatewayConfig {
    GatewayConfig {
        max_clients: 4,
        recycle_threshold: 2,
        max_sessions_per_client: 2,
        session_backoff_ms: 10,
        ..GatewayConfig::default()
    }
}

pub fn gateway_with(config: GatewayConfig) -> (Gateway, Arc<EngineLog>) {
    init_tracing();
    let connector = ScriptedConnector::new();
    let log = Arc::clone(&connector.log);
    let gateway = Gateway::new(config, Arc::new(connector)).expect("valid config");
    (gateway, log)
}

pub fn gateway() -> (Gateway, Arc<EngineLog>) {
    gateway_with(config())
}

pub fn batch(statements: &[&str]) -> Vec<String> {
    statements.iter().map(|s| s.to_string()).collect()
}

/// Let spawned tasks (actors, releases) run to quiescence.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
