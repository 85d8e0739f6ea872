//! Error types for the proxy.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::proxy::PeekError;

/// Per-connection failures. None of these are fatal to the process.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Client did not complete its ClientHello within the peek deadline.
    #[error("read_timeout: no complete ClientHello within {after:?}")]
    ReadTimeout { after: Duration },

    /// Reading from the client failed during the peek.
    #[error("read_failure: {0}")]
    ReadFailure(#[source] io::Error),

    /// No endpoint pattern matches the hostname.
    #[error("routing_failure: no endpoint matches {hostname:?}")]
    RoutingFailure { hostname: String },

    /// Backend refused or could not be reached.
    #[error("dial_failure: {address}: {source}")]
    DialFailure {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Backend did not accept the connection within the connect timeout.
    #[error("dial_timeout: {address} after {after:?}")]
    DialTimeout { address: String, after: Duration },
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::ReadTimeout { .. } => "read_timeout",
            ProxyError::ReadFailure(_) => "read_failure",
            ProxyError::RoutingFailure { .. } => "routing_failure",
            ProxyError::DialFailure { .. } => "dial_failure",
            ProxyError::DialTimeout { .. } => "dial_timeout",
        }
    }
}

impl From<PeekError> for ProxyError {
    fn from(err: PeekError) -> Self {
        ProxyError::ReadFailure(err.source)
    }
}

/// Endpoint file errors.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Endpoint file could not be read.
    #[error("failed to read endpoints file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A pattern is not a valid regular expression.
    #[error("invalid pattern {pattern:?} on line {line}: {source}")]
    InvalidPattern {
        line: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = ProxyError::RoutingFailure {
            hostname: "a.test".to_string(),
        };
        assert_eq!(err.reason_code(), "routing_failure");
        assert_eq!(
            err.to_string(),
            "routing_failure: no endpoint matches \"a.test\""
        );

        let err = ProxyError::from(PeekError {
            consumed: vec![0x16],
            source: io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        });
        assert_eq!(err.reason_code(), "read_failure");
    }
}
