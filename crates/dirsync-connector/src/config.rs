//! Connector configuration
//!
//! Every connector carries one serde-loadable configuration type. The
//! framework only asks it to check itself and to hide its secrets.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{ConnectorError, ConnectorResult};

/// Placeholder written over secret values.
pub const REDACTED: &str = "***REDACTED***";

/// Configuration of one connector instance.
pub trait ConnectorConfig: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Check required fields and cross-field rules.
    ///
    /// Fails with [`ConnectorError::InvalidConfiguration`] naming every
    /// problem found, not just the first.
    fn validate(&self) -> ConnectorResult<()>;

    /// Names of the fields holding secrets that are currently set.
    fn secret_fields(&self) -> Vec<&'static str>;

    /// A copy with every secret replaced by [`REDACTED`].
    fn redacted(&self) -> Self;

    /// Redacted configuration as JSON, for log lines.
    fn summary(&self) -> String {
        serde_json::to_string(&self.redacted()).unwrap_or_else(|e| format!("<unserializable: {e}>"))
    }
}

/// Transport limits shared by directory connectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Seconds to wait for a server to accept a connection.
    pub connect_timeout_secs: u64,

    /// Seconds to wait for any single request.
    pub operation_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            operation_timeout_secs: 120,
        }
    }
}

impl ConnectionSettings {
    #[must_use]
    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, secs: u64) -> Self {
        self.operation_timeout_secs = secs;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Zero timeouts would make every request fail immediately.
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.connect_timeout_secs == 0 || self.operation_timeout_secs == 0 {
            return Err(ConnectorError::configuration(
                "connection timeouts must be at least one second",
            ));
        }
        Ok(())
    }
}
