//! Protocol configuration.
//!
//! [`ComponentConfig`] is deserialized from the server's configuration file
//! and applied to a running [`ComponentProtocol`](crate::ComponentProtocol)
//! with `apply_config`. Missing keys take the defaults below.

use std::time::Duration;

use jid::Jid;
use serde::{Deserialize, Serialize};

use crate::repository::RepositoryConfig;
use crate::ExtCompError;

/// Default discovery category for connected components.
pub const DEFAULT_IDENTITY_TYPE: &str = "generic";

/// Default delay before redialing a dropped outbound component.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Default ceiling on reconnect attempts (120 minutes worth of millisecond
/// ticks, effectively unlimited).
pub const DEFAULT_MAX_RECONNECTS: u32 = 120 * 60 * 1000;

/// External component protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    /// Component repository selection
    pub repository: RepositoryConfig,
    /// Comma-separated extra hostnames each session asks its peer to bind
    pub bind_hostnames: Option<String>,
    /// Wrap packets forwarded to components in a route envelope
    pub pack_routed: bool,
    /// Announce connected components as service discovery items
    pub service_disco: bool,
    /// Discovery category label for announced components
    pub identity_type: String,
    /// Delay before redialing a dropped outbound component, in milliseconds
    pub reconnect_delay_ms: u64,
    /// Maximum redial attempts per outbound component
    pub max_reconnects: u32,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig::default(),
            bind_hostnames: None,
            pack_routed: false,
            service_disco: true,
            identity_type: DEFAULT_IDENTITY_TYPE.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
        }
    }
}

impl ComponentConfig {
    /// Parse the extra hostname list.
    ///
    /// Empty entries are skipped, so an empty string disables the feature.
    /// Any entry that is not a bare domain makes the whole list invalid.
    pub fn hostnames_to_bind(&self) -> Result<Vec<String>, ExtCompError> {
        let Some(raw) = self.bind_hostnames.as_deref() else {
            return Ok(Vec::new());
        };

        let mut hostnames = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let jid = Jid::new(entry).map_err(|e| {
                ExtCompError::config(format!("Invalid bind hostname '{}': {}", entry, e))
            })?;
            if jid.node().is_some() || jid.resource().is_some() {
                return Err(ExtCompError::config(format!(
                    "Bind hostname '{}' must be a bare domain",
                    entry
                )));
            }
            let host = entry.to_lowercase();
            if !hostnames.contains(&host) {
                hostnames.push(host);
            }
        }
        Ok(hostnames)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
