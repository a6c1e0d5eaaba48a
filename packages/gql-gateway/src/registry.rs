//! ClientRegistry - thread-safe table of logical clients
//!
//! The registry is the only structure shared across clients. It maps the
//! opaque client id (the engine-assigned session identifier, in decimal) to a
//! `ClientHandle`.
//!
//! # Architecture
//!
//! - One `RwLock<HashMap>`; every mutation takes the write lock
//! - Capacity: above `recycle_threshold` live clients, `open` kicks off a
//!   background idle sweep; at `max_clients` it fails fast with `Capacity`
//! - A closing client deregisters itself once its pool is torn down
//!
//! # Usage
//!
//! ```ignore
//! let registry = ClientRegistry::new(config, connector);
//! let id = registry.open(HostAddress::new("graphd", 9669), "root", "nebula").await?;
//! let client = registry.get(&id)?;
//! registry.close(&id);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::client::{self, Account, ClientHandle, ClientInit, ClientSummary};
use crate::config::GatewayConfig;
use crate::engine::{EngineConnector, EngineError, HostAddress};
use crate::error::{classify_engine_error, GatewayError, Result};
use crate::normalize::Normalizer;
use crate::pool::{SessionFactory, SessionPool};

pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<ClientHandle>>>,
    connector: Arc<dyn EngineConnector>,
    config: GatewayConfig,
    next_serial: AtomicU64,
}

impl ClientRegistry {
    pub fn new(config: GatewayConfig, connector: Arc<dyn EngineConnector>) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            connector,
            config,
            next_serial: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Authenticate against `host` and register a new logical client.
    ///
    /// The authenticated connection becomes the client's first session.
    pub async fn open(self: &Arc<Self>, host: HostAddress, username: &str, password: &str) -> Result<String> {
        let live = self.len();
        if live > self.config.recycle_threshold {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                registry.sweep_idle();
            });
        }
        if live >= self.config.max_clients {
            tracing::warn!(live, max = self.config.max_clients, "client capacity reached");
            return Err(GatewayError::Capacity);
        }

        let timeout = self.config.connect_timeout();
        let mut connection = self.connector.connect(&host, timeout).await.map_err(|e| {
            tracing::error!(%host, "failed to open engine connection: {}", e);
            classify_engine_error(e)
        })?;
        let reply = connection.authenticate(username, password).await.map_err(|e| {
            tracing::error!(%host, username, "authentication error: {}", e);
            match e {
                EngineError::Auth(message) => GatewayError::Auth(message),
                other => classify_engine_error(other),
            }
        })?;
        if !reply.is_success() {
            tracing::error!(%host, username, status = %reply.status, "authentication rejected");
            return Err(GatewayError::Auth(reply.status));
        }

        let identifier = reply.identifier;
        let pool = SessionPool::new(
            self.config.max_sessions_per_client,
            session_factory(Arc::clone(&self.connector), host.clone(), identifier, timeout),
        );
        pool.seed(connection.into_session(identifier));

        let account = Account {
            host,
            username: username.to_string(),
            password: password.to_string(),
        };
        self.register(identifier, account, pool).await
    }

    async fn register(self: &Arc<Self>, identifier: i64, account: Account, pool: Arc<SessionPool>) -> Result<String> {
        let id = identifier.to_string();
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let init = ClientInit {
            identifier,
            serial,
            account,
            pool: Arc::clone(&pool),
            normalizer: Normalizer::new(self.config.max_nesting_depth),
            backoff: self.config.session_backoff(),
        };

        let replaced = {
            let mut clients = self.clients.write();
            if clients.len() >= self.config.max_clients && !clients.contains_key(&id) {
                None
            } else {
                let handle = client::spawn(init, self.deregister_hook(id.clone(), serial));
                Some(clients.insert(id.clone(), handle))
            }
        };

        match replaced {
            None => {
                // Lost the race for the last slot.
                pool.teardown().await;
                Err(GatewayError::Capacity)
            }
            Some(previous) => {
                if let Some(previous) = previous {
                    tracing::warn!(client_id = %id, "engine reissued a live identifier; closing the old client");
                    previous.signal_close();
                }
                tracing::info!(client_id = %id, live = self.len(), "client opened");
                Ok(id)
            }
        }
    }

    fn deregister_hook(self: &Arc<Self>, id: String, serial: u64) -> client::OnClosed {
        let registry: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove_if(&id, serial);
            }
        })
    }

    fn remove_if(&self, id: &str, serial: u64) {
        let mut clients = self.clients.write();
        if clients.get(id).is_some_and(|c| c.serial() == serial) {
            clients.remove(id);
        }
    }

    /// Look up a client and mark it active.
    pub fn get(&self, id: &str) -> Result<Arc<ClientHandle>> {
        let client = self
            .clients
            .read()
            .get(id)
            .cloned()
            .ok_or(GatewayError::SessionExpired)?;
        client.touch();
        Ok(client)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.read().contains_key(id)
    }

    /// Deregister a client and send it the close signal.
    pub fn close(&self, id: &str) {
        let removed = self.clients.write().remove(id);
        if let Some(client) = removed {
            client.signal_close();
            tracing::info!(client_id = %id, "client close requested");
        }
    }

    /// Close every client and release all their idle sessions.
    ///
    /// This is the teardown hook for process shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<ClientHandle>> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in &drained {
            client.signal_close();
            client.pool().teardown().await;
        }
        tracing::info!(closed = drained.len(), "all clients closed");
    }

    /// Close every client idle for longer than the expiry window.
    ///
    /// Returns the number of clients closed.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_older_than(self.config.session_expiry())
    }

    fn sweep_idle_older_than(&self, expiry: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<ClientHandle>> = {
            let mut clients = self.clients.write();
            let ids: Vec<String> = clients
                .iter()
                .filter(|(_, c)| c.idle_for(now) > expiry)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| clients.remove(id)).collect()
        };
        for client in &expired {
            client.signal_close();
        }
        if !expired.is_empty() {
            tracing::info!(recycled = expired.len(), live = self.len(), "idle clients recycled");
        }
        expired.len()
    }

    /// First client opened with exactly these credentials, if any.
    pub fn find_by_credentials(&self, host: &HostAddress, username: &str, password: &str) -> Option<String> {
        self.clients
            .read()
            .iter()
            .find(|(_, c)| c.account().matches(host, username, password))
            .map(|(id, _)| id.clone())
    }

    pub fn clients(&self) -> Vec<ClientSummary> {
        let mut summaries: Vec<ClientSummary> = self.clients.read().values().map(|c| c.summary()).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

/// Factory for additional sessions of one client: a fresh connection bound
/// to the identifier obtained at authentication.
fn session_factory(
    connector: Arc<dyn EngineConnector>,
    host: HostAddress,
    identifier: i64,
    timeout: Duration,
) -> SessionFactory {
    Box::new(move || {
        let connector = Arc::clone(&connector);
        let host = host.clone();
        async move {
            let connection = connector.connect(&host, timeout).await?;
            Ok(connection.into_session(identifier))
        }
        .boxed()
    })
}
