//! TLS passthrough proxy.
//!
//! This module provides:
//! - ClientHello record parsing and SNI extraction
//! - Lossless ClientHello peeking
//! - Connection relaying to the routed backend
//! - TCP listener management
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Peeker (ClientHello) -> EndpointDb -> Relay -> Backend
//!                          |                                    ^
//!                          +---------- peeked bytes ------------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use sniproxy::{EndpointDb, Listener, ListenerConfig};
//!
//! let endpoints = Arc::new(EndpointDb::load("endpoints.txt")?);
//! let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//! let config = ListenerConfig::new("[::]:443".parse()?);
//! let listener = Listener::bind(config, endpoints).await?;
//! Arc::new(listener).run(shutdown_rx).await?;
//! ```

mod listener;
mod peek;
mod relay;
mod sni;

pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use peek::{
    ClientHelloPeeker, PeekError, PeekResult, ServerName, DEFAULT_READ_WINDOW, NO_SNI_HOSTNAME,
    WILDCARD_HOSTNAME,
};
pub use relay::{
    splice, Relay, RelayConfig, RelayOutcome, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PEEK_TIMEOUT,
};
pub use sni::{
    extract_sni, parse_record, RecordOutcome, RejectReason, TlsRecord, CONTENT_TYPE_HANDSHAKE,
    RECORD_HEADER_LEN, TLS_VERSIONS,
};
