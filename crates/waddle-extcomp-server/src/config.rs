// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Waddle Social

//! Server configuration.
//!
//! Settings are layered: built-in defaults, then the TOML file given on the
//! command line (if it exists), then `EXTCOMP__*` environment variables,
//! then command line overrides.
//!
//! ```toml
//! listen_addr = "0.0.0.0:5347"
//! local_domain = "example.com"
//!
//! [component]
//! bind_hostnames = "pubsub.example.com"
//!
//! [[component.repository.components]]
//! domain = "muc.example.com"
//! secret = "s3cret"
//! ```
//!
//! Nested keys map to environment variables with `__`, e.g.
//! `EXTCOMP__COMPONENT__PACK_ROUTED=true`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;
use waddle_extcomp::ComponentConfig;

/// Customary XEP-0114 component port.
const DEFAULT_PORT: u16 = 5347;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept component connections on
    pub listen_addr: SocketAddr,
    /// Domain of this server, answered for service discovery
    pub local_domain: String,
    /// TLS certificate path (PEM format) for STARTTLS on accepted streams
    pub tls_cert_path: Option<PathBuf>,
    /// TLS private key path (PEM, PKCS#8)
    pub tls_key_path: Option<PathBuf>,
    /// CA bundle trusted when upgrading outbound streams
    pub tls_ca_path: Option<PathBuf>,
    /// Protocol settings
    pub component: ComponentConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            local_domain: "localhost".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            component: ComponentConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("EXTCOMP")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Log the configuration (secrets excluded).
    pub fn log_config(&self) {
        info!(
            listen_addr = %self.listen_addr,
            local_domain = %self.local_domain,
            tls = self.tls_cert_path.is_some(),
            outbound_tls = self.tls_ca_path.is_some(),
            repository = %self.component.repository.kind,
            inline_components = self.component.repository.components.len(),
            bind_hostnames = ?self.component.bind_hostnames,
            pack_routed = self.component.pack_routed,
            service_disco = self.component.service_disco,
            "Server configuration loaded"
        );
    }
}
