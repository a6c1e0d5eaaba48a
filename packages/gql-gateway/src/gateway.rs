//! Gateway - the facade the web layer talks to
//!
//! Wraps the client registry and exposes the connect / execute / disconnect
//! surface. Callers identify a logical client only by the opaque id returned
//! from `open` or `connect`.

use std::sync::Arc;

use crate::client::{BatchReply, ClientSummary};
use crate::config::GatewayConfig;
use crate::engine::{EngineConnector, HostAddress};
use crate::error::Result;
use crate::registry::ClientRegistry;

pub struct Gateway {
    registry: Arc<ClientRegistry>,
}

impl Gateway {
    /// Build a gateway over an engine driver. The config is validated here.
    pub fn new(config: GatewayConfig, connector: Arc<dyn EngineConnector>) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            max_clients = config.max_clients,
            recycle_threshold = config.recycle_threshold,
            max_sessions_per_client = config.max_sessions_per_client,
            "gateway started"
        );
        Ok(Self {
            registry: ClientRegistry::new(config, connector),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        self.registry.config()
    }

    /// Authenticate and register a new logical client. Returns its id.
    pub async fn open(&self, host: &str, port: u16, username: &str, password: &str) -> Result<String> {
        self.registry
            .open(HostAddress::new(host, port), username, password)
            .await
    }

    /// `open` against the configured default endpoint.
    pub async fn open_default(&self, username: &str, password: &str) -> Result<String> {
        let config = self.config();
        let host = HostAddress::new(config.default_host.clone(), config.default_port);
        self.registry.open(host, username, password).await
    }

    /// Reuse a live client opened with the same credentials, or open one.
    pub async fn connect(&self, host: &str, port: u16, username: &str, password: &str) -> Result<String> {
        let address = HostAddress::new(host, port);
        if let Some(id) = self.registry.find_by_credentials(&address, username, password) {
            tracing::debug!(client_id = %id, "reusing live client");
            return Ok(id);
        }
        self.registry.open(address, username, password).await
    }

    /// Run a batch on a client.
    ///
    /// The outer `Err` means the batch never ran (unknown client, lost
    /// session). Per-statement failures are inside the outcome list, which
    /// always has one entry per statement except `:sleep`.
    pub async fn execute(&self, id: &str, space: Option<&str>, statements: Vec<String>) -> BatchReply {
        let client = self.registry.get(id)?;
        client.execute(space, statements).await
    }

    pub fn close(&self, id: &str) {
        self.registry.close(id);
    }

    pub async fn close_all(&self) {
        self.registry.close_all().await;
    }

    pub fn sweep_idle(&self) -> usize {
        self.registry.sweep_idle()
    }

    pub fn find_client(&self, host: &str, port: u16, username: &str, password: &str) -> Option<String> {
        self.registry
            .find_by_credentials(&HostAddress::new(host, port), username, password)
    }

    pub fn clients(&self) -> Vec<ClientSummary> {
        self.registry.clients()
    }

    pub fn client_count(&self) -> usize {
        self.registry.len()
    }
}
