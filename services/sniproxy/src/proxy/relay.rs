//! Per-connection handling: peek, route, dial, relay.
//!
//! ```text
//! Peeking -> Routing -> Dialing -> Relaying -> Closed
//!    |          |          |
//!    +----------+----------+------> Closed (on error)
//! ```
//!
//! No state is retried. The client stream is owned by [`Relay::handle`], so
//! it is closed on every exit path when the call returns.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::peek::{ClientHelloPeeker, ServerName};
use crate::endpoints::EndpointDb;
use crate::error::ProxyError;

/// Default deadline for the client to deliver its ClientHello.
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Copy buffer size for each relay direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// Timeouts for a single connection.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Deadline for the peek phase only. Relaying has no idle timeout.
    pub peek_timeout: Duration,
    /// Deadline for the single backend connect attempt.
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Summary of a relayed connection.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub server_name: ServerName,
    /// Backend address the connection was routed to.
    pub backend: String,
    /// Client to backend, including the replayed ClientHello bytes.
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Connection handler shared by all connections of a listener.
pub struct Relay {
    endpoints: Arc<EndpointDb>,
    peeker: ClientHelloPeeker,
    config: RelayConfig,
}

impl Relay {
    pub fn new(endpoints: Arc<EndpointDb>, config: RelayConfig) -> Self {
        Self {
            endpoints,
            peeker: ClientHelloPeeker::new(),
            config,
        }
    }

    /// Handle one accepted client connection to completion.
    pub async fn handle<S>(&self, mut client: S) -> Result<RelayOutcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Peeking
        let peeked = match timeout(self.config.peek_timeout, self.peeker.peek(&mut client)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProxyError::ReadTimeout {
                    after: self.config.peek_timeout,
                })
            }
        };

        debug!(
            sni = %peeked.server_name,
            peeked = peeked.consumed.len(),
            "ClientHello peeked"
        );

        // Routing
        let endpoint = self.endpoints.get(peeked.server_name.route_key())?;
        let address = endpoint.address().to_string();

        // Dialing
        let backend = match timeout(self.config.connect_timeout, TcpStream::connect(&address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ProxyError::DialFailure { address, source }),
            Err(_) => {
                return Err(ProxyError::DialTimeout {
                    address,
                    after: self.config.connect_timeout,
                })
            }
        };
        if let Err(e) = backend.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on backend connection");
        }

        debug!(backend_addr = %address, "Connected to backend");

        // Relaying
        let (bytes_to_backend, bytes_from_backend) =
            splice(client, peeked.consumed, backend).await;

        Ok(RelayOutcome {
            server_name: peeked.server_name,
            backend: address,
            bytes_to_backend,
            bytes_from_backend,
        })
    }
}

/// Relay bytes between `client` and `backend` until the connection ends.
///
/// `replay` is sent to the backend ahead of the live client stream. A clean
/// end of stream from the client is forwarded as a half-close, and the
/// backend may keep answering until it closes. The backend closing, or an
/// I/O error in either direction, ends the whole connection. Both streams
/// are dropped before returning.
///
/// Returns (bytes_to_backend, bytes_from_backend).
pub async fn splice<S>(client: S, replay: Vec<u8>, backend: TcpStream) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = backend.into_split();

    let client_stream = io::Cursor::new(replay).chain(client_read);

    let mut bytes_to_backend = 0u64;
    let mut bytes_from_backend = 0u64;
    {
        let upstream = copy_and_close(client_stream, backend_write, &mut bytes_to_backend);
        let downstream = copy_and_close(backend_read, client_write, &mut bytes_from_backend);
        tokio::pin!(upstream, downstream);

        tokio::select! {
            result = &mut upstream => {
                let client_done = result.is_ok();
                log_direction("client_to_backend", result);
                if client_done {
                    log_direction("backend_to_client", downstream.await);
                }
            }
            result = &mut downstream => {
                log_direction("backend_to_client", result);
            }
        }
    }

    (bytes_to_backend, bytes_from_backend)
}

/// Copy until end of stream or error, then shut down `writer`.
///
/// `total` counts bytes written and stays valid if the copy is dropped.
async fn copy_and_close<R, W>(mut reader: R, mut writer: W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let result = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        *total += n as u64;
    };

    // Propagate the close even when the copy failed.
    let shutdown = writer.shutdown().await;

    result.and(shutdown)
}

fn log_direction(direction: &'static str, result: io::Result<()>) {
    if let Err(e) = result {
        debug!(direction = direction, error = %e, "Relay direction ended with error");
    }
}
