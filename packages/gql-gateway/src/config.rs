//! Gateway configuration
//!
//! All knobs have defaults; a YAML document only needs to name the ones it
//! changes:
//!
//! ```yaml
//! default_host: graphd.internal
//! max_clients: 500
//! session_expiry_secs: 1800
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Engine host used when a caller does not name one.
    pub default_host: String,
    pub default_port: u16,
    /// Idle time after which a client is eligible for recycling.
    pub session_expiry_secs: u64,
    /// Live-client count above which `open` triggers a background sweep.
    pub recycle_threshold: usize,
    /// Live-client count at which `open` fails fast.
    pub max_clients: usize,
    /// Upper bound on engine sessions one logical client may hold.
    pub max_sessions_per_client: usize,
    /// Wait between session acquisition attempts.
    pub session_backoff_ms: u64,
    /// Connection timeout; long because some statements run for hours.
    pub connect_timeout_secs: u64,
    /// Container nesting the normalizer descends into.
    pub max_nesting_depth: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_host: "127.0.0.1".to_string(),
            default_port: 9669,
            session_expiry_secs: 3600,
            recycle_threshold: 30,
            max_clients: 200,
            max_sessions_per_client: 4,
            session_backoff_ms: 500,
            connect_timeout_secs: 8 * 60 * 60,
            max_nesting_depth: 64,
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(text).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(GatewayError::Config("max_clients must be at least 1".to_string()));
        }
        if self.recycle_threshold >= self.max_clients {
            return Err(GatewayError::Config(format!(
                "recycle_threshold ({}) must be below max_clients ({})",
                self.recycle_threshold, self.max_clients
            )));
        }
        if self.max_sessions_per_client == 0 {
            return Err(GatewayError::Config(
                "max_sessions_per_client must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry_secs)
    }

    pub fn session_backoff(&self) -> Duration {
        Duration::from_millis(self.session_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
