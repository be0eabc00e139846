// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Waddle Social

//! Waddle external component server.
//!
//! Accepts XEP-0114 component connections (and dials components configured
//! with a port), routing packets between the connected components.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use waddle_extcomp::transport::{ComponentTransport, TlsContext};
use waddle_extcomp::{
    ComponentProtocol, ConnectionSpec, InMemoryRoutingTable, Packet, PacketRouter,
    ReconnectScheduler,
};

mod config;
mod telemetry;

use config::ServerConfig;

/// Waddle external component server
#[derive(Parser, Debug)]
#[command(name = "waddle-extcomp-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML); missing files fall back to defaults
    #[arg(short, long, default_value = "extcomp.toml")]
    config: PathBuf,

    /// Component listener address (overrides the configuration file)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Local server domain
    #[arg(short, long)]
    domain: Option<String>,

    /// Comma-separated extra hostnames every component session binds
    #[arg(long)]
    bind_hostnames: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(domain) = &self.domain {
            config.local_domain = domain.clone();
        }
        if let Some(hostnames) = &self.bind_hostnames {
            config.component.bind_hostnames = Some(hostnames.clone());
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::load(Some(cli.config.as_path()))?;
    cli.apply(&mut config);

    let (table, deliveries) = InMemoryRoutingTable::new();
    let table = Arc::new(table);
    let (scheduler, specs) = ReconnectScheduler::new(config.component.reconnect_delay());
    let protocol = Arc::new(ComponentProtocol::new(table.clone(), Arc::new(scheduler)));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(protocol.processing_threads())
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(config, protocol, table, deliveries, specs))
}

async fn run(
    config: ServerConfig,
    protocol: Arc<ComponentProtocol>,
    table: Arc<InMemoryRoutingTable>,
    deliveries: mpsc::UnboundedReceiver<Packet>,
    specs: mpsc::UnboundedReceiver<ConnectionSpec>,
) -> Result<()> {
    // Install the ring crypto provider for rustls (STARTTLS on component streams)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    telemetry::init(otlp_endpoint.as_deref())?;

    info!("Waddle external component server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let tls = TlsContext::from_paths(
        config.tls_cert_path.as_deref(),
        config.tls_key_path.as_deref(),
        config.tls_ca_path.as_deref(),
    )?;
    let shutdown = CancellationToken::new();

    let router = PacketRouter::new(Arc::clone(&protocol), table, config.local_domain.clone())
        .spawn(deliveries, protocol.processing_threads(), shutdown.clone());

    let transport = ComponentTransport::new(Arc::clone(&protocol), tls, shutdown.clone());
    let manager = transport.spawn_connection_manager(specs);
    let listener = transport
        .listen(config.listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen_addr))?;

    // Starts per-component listeners and dials; the main port must be bound first.
    protocol.apply_config(&config.component);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    let _ = tokio::join!(router, manager, listener);

    let stats = protocol.statistics();
    info!(
        domains = stats.domains,
        connections = stats.connections,
        connection_attempts = stats.connection_attempts,
        "Component server stopped"
    );

    telemetry::shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "waddle-extcomp-server",
            "--listen",
            "127.0.0.1:7000",
            "--domain",
            "example.com",
            "--bind-hostnames",
            "a.example.com,b.example.com",
        ]);
        let mut config = ServerConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.listen_addr.port(), 7000);
        assert_eq!(config.local_domain, "example.com");
        assert_eq!(config.component.hostnames_to_bind().unwrap().len(), 2);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["waddle-extcomp-server"]);
        assert_eq!(cli.config, PathBuf::from("extcomp.toml"));
        assert!(cli.listen.is_none());
    }
}
