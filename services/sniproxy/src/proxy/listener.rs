//! TCP listener and connection handling.
//!
//! This module accepts TCP connections, hands each one to its own task
//! running the [`Relay`], and keeps per-listener statistics.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::peek::ServerName;
use super::relay::{Relay, RelayConfig};
use crate::endpoints::EndpointDb;
use crate::error::ProxyError;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection timeouts.
    pub relay: RelayConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            relay: RelayConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// ClientHellos carrying an SNI hostname.
    pub sni_found: AtomicU64,
    /// ClientHellos without a usable SNI hostname.
    pub sni_absent: AtomicU64,
    /// Connections that were not TLS.
    pub not_tls: AtomicU64,
    /// Peek timeouts and read failures.
    pub peek_failed: AtomicU64,
    /// Connections with no matching endpoint.
    pub routes_failed: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Connections relayed to a backend.
    pub relayed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record_error(&self, err: &ProxyError) {
        let counter = match err {
            ProxyError::ReadTimeout { .. } | ProxyError::ReadFailure(_) => &self.peek_failed,
            ProxyError::RoutingFailure { .. } => &self.routes_failed,
            ProxyError::DialFailure { .. } | ProxyError::DialTimeout { .. } => &self.backend_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_server_name(&self, server_name: &ServerName) {
        let counter = match server_name {
            ServerName::Host(_) => &self.sni_found,
            ServerName::Absent => &self.sni_absent,
            ServerName::NotTls => &self.not_tls,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A TCP listener for the SNI proxy.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Connection handler.
    relay: Relay,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: ListenerStats,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, endpoints: Arc<EndpointDb>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            peek_timeout_ms = config.relay.peek_timeout.as_millis() as u64,
            "Listener bound"
        );

        Ok(Self {
            listener,
            relay: Relay::new(endpoints, config.relay),
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            stats: ListenerStats::default(),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections until `shutdown`
    /// flips to `true`. Connections already accepted run to completion.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                changed = shutdown.changed() => {
                    // A dropped sender also means shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!(bind_addr = %local_addr, "Listener shutting down");
                        return Ok(());
                    }
                    continue;
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);

                    tokio::spawn(
                        async move {
                            listener.handle_connection(stream).await;

                            listener
                                .stats
                                .connections_active
                                .fetch_sub(1, Ordering::Relaxed);
                            listener
                                .stats
                                .connections_closed
                                .fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection and record its outcome.
    async fn handle_connection(&self, client: TcpStream) {
        if let Err(e) = client.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on client connection");
        }

        match self.relay.handle(client).await {
            Ok(outcome) => {
                self.stats.record_server_name(&outcome.server_name);
                self.stats.relayed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_to_backend
                    .fetch_add(outcome.bytes_to_backend, Ordering::Relaxed);
                self.stats
                    .bytes_from_backend
                    .fetch_add(outcome.bytes_from_backend, Ordering::Relaxed);

                debug!(
                    sni = %outcome.server_name,
                    backend_addr = %outcome.backend,
                    bytes_to_backend = outcome.bytes_to_backend,
                    bytes_from_backend = outcome.bytes_from_backend,
                    "Connection closed"
                );
            }
            Err(e) => {
                self.stats.record_error(&e);
                match &e {
                    ProxyError::RoutingFailure { .. } | ProxyError::ReadTimeout { .. } => {
                        warn!(reason = e.reason_code(), error = %e, "Connection aborted");
                    }
                    _ => {
                        debug!(reason = e.reason_code(), error = %e, "Connection aborted");
                    }
                }
            }
        }
    }
}
