//! Logical clients and their request actors
//!
//! Each logical client is one tokio task (the actor) reachable only through
//! its request channel. The actor owns the client's `SessionPool` and its
//! parameter map. For every batch it spawns an independent task, so batches
//! of one client can run side by side on different sessions, while the
//! statements of one batch always run in order on a single session.
//!
//! # Lifecycle
//!
//! ```text
//! Running --close signal--> Closing --pool torn down, deregistered--> Closed
//! ```
//!
//! Closing does not interrupt batches already running; their sessions are
//! released when they come back to the closed pool.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::command::{self, CommandEffect, StatementKind};
use crate::engine::HostAddress;
use crate::error::{classify_engine_error, GatewayError, Result};
use crate::normalize::{NormalizedResult, Normalizer};
use crate::pool::{Checkout, PoolError, SessionGuard, SessionPool};
use crate::value::ParameterMap;

// ============================================================================
// Public types
// ============================================================================

/// Credentials a client was opened with. Kept only to match later `open`
/// calls for the same account against this client.
#[derive(Clone)]
pub struct Account {
    pub host: HostAddress,
    pub username: String,
    pub password: String,
}

impl Account {
    pub fn matches(&self, host: &HostAddress, username: &str, password: &str) -> bool {
        self.host == *host && self.username == username && self.password == password
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("host", &self.host)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Running,
    Closing,
    Closed,
}

/// Result of one statement of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementOutcome {
    pub statement: String,
    pub result: Result<NormalizedResult>,
}

impl StatementOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl Serialize for StatementOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("statement", &self.statement)?;
        match &self.result {
            Ok(result) => map.serialize_entry("result", result)?,
            Err(err) => map.serialize_entry(
                "error",
                &serde_json::json!({ "code": err.code(), "message": err.to_string() }),
            )?,
        }
        map.end()
    }
}

pub type BatchReply = Result<Vec<StatementOutcome>>;

/// One batch on its way to a client actor.
pub struct BatchRequest {
    pub statements: Vec<String>,
    pub space: Option<String>,
    pub reply: oneshot::Sender<BatchReply>,
}

/// Snapshot of a client for introspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub host: String,
    pub username: String,
    pub state: ClientState,
    pub idle_secs: u64,
    pub active_sessions: usize,
    pub idle_sessions: usize,
}

// ============================================================================
// ClientHandle
// ============================================================================

/// Caller-side handle of a logical client.
pub struct ClientHandle {
    id: String,
    identifier: i64,
    /// Registry generation; distinguishes a client from a later one that
    /// received the same engine identifier.
    serial: u64,
    account: Account,
    requests: mpsc::UnboundedSender<BatchRequest>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    last_active: Mutex<Instant>,
    state: Arc<Mutex<ClientState>>,
    pool: Arc<SessionPool>,
}

impl ClientHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identifier(&self) -> i64 {
        self.identifier
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub(crate) fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock())
    }

    /// Deliver the close signal. Returns false if it was already sent.
    pub fn signal_close(&self) -> bool {
        match self.close_tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Submit a batch and wait for its single reply.
    pub async fn execute(&self, space: Option<&str>, statements: Vec<String>) -> BatchReply {
        if self.state() != ClientState::Running {
            return Err(GatewayError::SessionExpired);
        }
        let (reply, response) = oneshot::channel();
        let request = BatchRequest {
            statements,
            space: space.map(str::to_string),
            reply,
        };
        if self.requests.send(request).is_err() {
            return Err(GatewayError::SessionExpired);
        }
        // A request dropped unanswered was queued behind a close signal.
        response.await.unwrap_or(Err(GatewayError::SessionLost))
    }

    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            id: self.id.clone(),
            host: self.account.host.to_string(),
            username: self.account.username.clone(),
            state: self.state(),
            idle_secs: self.idle_for(Instant::now()).as_secs(),
            active_sessions: self.pool.active_count(),
            idle_sessions: self.pool.idle_count(),
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

/// Everything needed to start a client actor.
pub(crate) struct ClientInit {
    pub identifier: i64,
    pub serial: u64,
    pub account: Account,
    pub pool: Arc<SessionPool>,
    pub normalizer: Normalizer,
    pub backoff: Duration,
}

/// Called once by the actor after its pool is torn down.
pub(crate) type OnClosed = Box<dyn FnOnce() + Send>;

/// Start the actor task and return the handle that talks to it.
pub(crate) fn spawn(init: ClientInit, on_closed: OnClosed) -> Arc<ClientHandle> {
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = oneshot::channel();
    let state = Arc::new(Mutex::new(ClientState::Running));
    let id = init.identifier.to_string();

    let handle = Arc::new(ClientHandle {
        id: id.clone(),
        identifier: init.identifier,
        serial: init.serial,
        account: init.account,
        requests: requests_tx,
        close_tx: Mutex::new(Some(close_tx)),
        last_active: Mutex::new(Instant::now()),
        state: Arc::clone(&state),
        pool: Arc::clone(&init.pool),
    });

    let actor = ClientActor {
        id,
        state,
        ctx: BatchContext {
            pool: init.pool,
            params: Arc::new(Mutex::new(ParameterMap::new())),
            normalizer: init.normalizer,
            backoff: init.backoff,
        },
    };
    tokio::spawn(actor.run(requests_rx, close_rx, on_closed));

    handle
}

struct ClientActor {
    id: String,
    state: Arc<Mutex<ClientState>>,
    ctx: BatchContext,
}

impl ClientActor {
    async fn run(
        self,
        mut requests: mpsc::UnboundedReceiver<BatchRequest>,
        mut close: oneshot::Receiver<()>,
        on_closed: OnClosed,
    ) {
        tracing::debug!(client_id = %self.id, "client actor started");
        loop {
            tokio::select! {
                Some(request) = requests.recv() => self.dispatch(request),
                // An Err here means every handle is gone; treat it as close.
                _ = &mut close => break,
            }
        }

        *self.state.lock() = ClientState::Closing;
        self.ctx.pool.teardown().await;
        on_closed();
        *self.state.lock() = ClientState::Closed;
        tracing::info!(client_id = %self.id, "client closed");
    }

    fn dispatch(&self, request: BatchRequest) {
        let ctx = self.ctx.clone();
        let client_id = self.id.clone();
        tokio::spawn(async move {
            let BatchRequest { statements, space, reply } = request;
            let outcome = AssertUnwindSafe(ctx.run_batch(&statements, space.as_deref()))
                .catch_unwind()
                .await;
            let response = match outcome {
                Ok(response) => response,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(client_id = %client_id, ?statements, %message, "batch task panicked");
                    Err(GatewayError::SessionLost)
                }
            };
            // The caller may have given up waiting; nothing left to do then.
            let _ = reply.send(response);
        });
    }
}

// ============================================================================
// Batch execution
// ============================================================================

#[derive(Clone)]
struct BatchContext {
    pool: Arc<SessionPool>,
    params: Arc<Mutex<ParameterMap>>,
    normalizer: Normalizer,
    backoff: Duration,
}

impl BatchContext {
    async fn run_batch(&self, statements: &[String], space: Option<&str>) -> BatchReply {
        let mut guard = self.acquire().await?;
        let outcomes = self.execute_batch(&mut guard, statements, space).await;
        Ok(outcomes)
    }

    async fn acquire(&self) -> Result<SessionGuard> {
        loop {
            match self.pool.checkout().await {
                Ok(Checkout::Ready(guard)) => return Ok(guard),
                Ok(Checkout::Exhausted) => tokio::time::sleep(self.backoff).await,
                Err(PoolError::Closed) => return Err(GatewayError::SessionLost),
                Err(PoolError::Create(err)) => {
                    tracing::error!("failed to create session: {}", err);
                    return Err(classify_engine_error(err));
                }
            }
        }
    }

    async fn execute_batch(
        &self,
        guard: &mut SessionGuard,
        statements: &[String],
        space: Option<&str>,
    ) -> Vec<StatementOutcome> {
        let prefix = command::namespace_prefix(space);
        let mut outcomes = Vec::with_capacity(statements.len());

        for statement in statements {
            match command::classify(statement) {
                StatementKind::Local(parsed) => {
                    let effect = parsed.and_then(|cmd| command::execute(cmd, &mut self.params.lock()));
                    match effect {
                        Ok(CommandEffect::Snapshot(snapshot)) => outcomes.push(StatementOutcome {
                            statement: statement.clone(),
                            result: Ok(NormalizedResult::local(snapshot)),
                        }),
                        Ok(CommandEffect::Pause(duration)) => tokio::time::sleep(duration).await,
                        Err(err) => outcomes.push(StatementOutcome {
                            statement: statement.clone(),
                            result: Err(err.into()),
                        }),
                    }
                }
                StatementKind::Remote => {
                    let result = self.execute_remote(guard, prefix.as_deref(), statement).await;
                    outcomes.push(StatementOutcome {
                        statement: statement.clone(),
                        result,
                    });
                }
            }
        }

        outcomes
    }

    async fn execute_remote(
        &self,
        guard: &mut SessionGuard,
        prefix: Option<&str>,
        statement: &str,
    ) -> Result<NormalizedResult> {
        let text = match prefix {
            Some(prefix) => format!("{}{}", prefix, statement),
            None => statement.to_string(),
        };
        let params = self.params.lock().clone();

        let executed = guard.session().execute(&text, &params).await;
        match executed {
            Ok(rs) => self.normalizer.normalize(&rs),
            Err(err) => {
                let err = classify_engine_error(err);
                if err.is_connection_closed() {
                    tracing::warn!(statement, "engine connection closed; session will be discarded");
                    guard.mark_broken();
                }
                Err(err)
            }
        }
    }
}
