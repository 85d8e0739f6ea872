//! ClientHello peeking.
//!
//! The peeker reads from a client stream until the accumulated bytes form a
//! complete TLS record, or until they are proven not to be TLS. Every byte
//! it reads is kept, in order, and handed back to the caller: those bytes
//! are already gone from the socket and must be replayed to the backend.

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use super::sni::{extract_sni, parse_record, RecordOutcome};

/// Default size of a single read while peeking.
pub const DEFAULT_READ_WINDOW: usize = 1024;

/// Hostname used to route connections that are not TLS.
pub const WILDCARD_HOSTNAME: &str = "*";

/// Hostname used to route ClientHellos that carry no SNI.
pub const NO_SNI_HOSTNAME: &str = "";

/// What the peeker learned about the server name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerName {
    /// ClientHello carried a `host_name` SNI entry.
    Host(String),
    /// Complete handshake record, but no usable SNI.
    Absent,
    /// The stream is not a TLS ClientHello.
    NotTls,
}

impl ServerName {
    fn from_extracted(hostname: String) -> Self {
        if hostname.is_empty() {
            ServerName::Absent
        } else {
            ServerName::Host(hostname)
        }
    }

    /// Key looked up in the endpoint table.
    ///
    /// `Absent` routes as [`NO_SNI_HOSTNAME`], `NotTls` as [`WILDCARD_HOSTNAME`].
    pub fn route_key(&self) -> &str {
        match self {
            ServerName::Host(hostname) => hostname,
            ServerName::Absent => NO_SNI_HOSTNAME,
            ServerName::NotTls => WILDCARD_HOSTNAME,
        }
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.route_key())
    }
}

/// Result of a successful peek.
#[derive(Debug, Clone)]
pub struct PeekResult {
    pub server_name: ServerName,
    /// Every byte read from the source, in order.
    pub consumed: Vec<u8>,
}

/// The source failed while the parser still needed data.
#[derive(Debug, Error)]
#[error("read failed after {} peeked bytes: {source}", .consumed.len())]
pub struct PeekError {
    /// Bytes read before the failure.
    pub consumed: Vec<u8>,
    #[source]
    pub source: io::Error,
}

/// Incremental ClientHello reader.
#[derive(Debug, Clone)]
pub struct ClientHelloPeeker {
    read_window: usize,
}

impl ClientHelloPeeker {
    /// Create a peeker with the default read window.
    pub fn new() -> Self {
        Self {
            read_window: DEFAULT_READ_WINDOW,
        }
    }

    /// Create a peeker reading at most `read_window` bytes at a time.
    pub fn with_read_window(read_window: usize) -> Self {
        Self {
            read_window: read_window.max(1),
        }
    }

    /// Read from `source` until the first TLS record is complete or rejected.
    ///
    /// Reads never go past the end of the first record, so bytes the client
    /// sends after its ClientHello stay in the source. A clean end of stream
    /// before the record completes is reported as [`ServerName::NotTls`].
    pub async fn peek<R>(&self, source: &mut R) -> Result<PeekResult, PeekError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut captured = Vec::with_capacity(self.read_window);
        let mut window = vec![0u8; self.read_window];

        loop {
            let needed = match parse_record(&captured) {
                RecordOutcome::Parsed(record) => {
                    let hostname = extract_sni(record.body);
                    trace!(
                        record_version = record.version,
                        record_len = record.body.len(),
                        sni = %hostname,
                        "ClientHello record complete"
                    );
                    return Ok(PeekResult {
                        server_name: ServerName::from_extracted(hostname),
                        consumed: captured,
                    });
                }
                RecordOutcome::Rejected(reason) => {
                    debug!(reason = %reason, peeked = captured.len(), "Not a TLS ClientHello");
                    return Ok(PeekResult {
                        server_name: ServerName::NotTls,
                        consumed: captured,
                    });
                }
                RecordOutcome::NeedMore { needed } => needed,
            };

            let want = needed
                .saturating_sub(captured.len())
                .clamp(1, self.read_window);

            let n = match source.read(&mut window[..want]).await {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(PeekError {
                        consumed: captured,
                        source,
                    })
                }
            };

            if n == 0 {
                debug!(
                    peeked = captured.len(),
                    needed = needed,
                    "End of stream before ClientHello completed"
                );
                return Ok(PeekResult {
                    server_name: ServerName::NotTls,
                    consumed: captured,
                });
            }

            captured.extend_from_slice(&window[..n]);
        }
    }
}

impl Default for ClientHelloPeeker {
    fn default() -> Self {
        Self::new()
    }
}
