//! sniproxy
//!
//! TLS passthrough proxy with SNI routing.
//!
//! This service:
//! - Loads hostname pattern -> backend rules from an endpoint file
//! - Accepts TCP connections on the configured listener
//! - Peeks the TLS ClientHello for the SNI hostname, without decrypting
//! - Relays the connection to the first matching backend
//! - Optionally reloads the endpoint file when it changes

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sniproxy::proxy::WILDCARD_HOSTNAME;
use sniproxy::{EndpointDb, Listener};

mod config;

use config::{Config, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting sniproxy");
    info!(
        listen = %config.listen,
        endpoints = %config.endpoints.display(),
        peek_timeout_secs = config.peek_timeout_secs,
        connect_timeout_secs = config.connect_timeout_secs,
        max_connections = config.max_connections,
        reload_interval_secs = ?config.reload_interval_secs,
        "Configuration loaded"
    );

    let endpoints = Arc::new(EndpointDb::load(&config.endpoints).with_context(|| {
        format!(
            "Failed to load endpoints from {}",
            config.endpoints.display()
        )
    })?);

    for key in endpoints.snapshot().unrouted_fallbacks() {
        let traffic = if key == WILDCARD_HOSTNAME {
            "non-TLS connections"
        } else {
            "ClientHellos without SNI"
        };
        warn!(hostname = ?key, "No endpoint matches {:?}; {} will be rejected", key, traffic);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = Listener::bind(config.listener_config(), Arc::clone(&endpoints))
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.listen))?;
    let listener = Arc::new(listener);

    let mut listener_handle = tokio::spawn({
        let listener = Arc::clone(&listener);
        let shutdown_rx = shutdown_rx.clone();
        async move { listener.run(shutdown_rx).await }
    });

    if let Some(interval) = config.reload_interval() {
        tokio::spawn(Arc::clone(&endpoints).watch(interval, shutdown_rx.clone()));
    }

    // Wait for shutdown signal
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        }
        result = &mut listener_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e).context("Listener failed"),
                Err(e) => Err(e).context("Listener task panicked"),
            };
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    if let Err(e) = listener_handle.await {
        error!(error = %e, "Listener task panicked");
    }

    let stats = listener.stats();
    info!(
        connections_accepted = stats.connections_accepted.load(Ordering::Relaxed),
        relayed = stats.relayed.load(Ordering::Relaxed),
        "sniproxy shutdown complete"
    );
    Ok(())
}
