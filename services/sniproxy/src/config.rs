//! sniproxy configuration.
//!
//! Every flag can also be set through its `SNIPROXY_*` environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use sniproxy::{ListenerConfig, RelayConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable text.
    Text,
}

/// TLS passthrough proxy routing connections by SNI hostname.
#[derive(Debug, Clone, Parser)]
#[command(name = "sniproxy", version, about)]
pub struct Config {
    /// Address to accept client connections on.
    #[arg(long, env = "SNIPROXY_LISTEN", default_value = "[::]:443")]
    pub listen: SocketAddr,

    /// Endpoint file, one `<pattern>,<host:port>` rule per line.
    #[arg(long, env = "SNIPROXY_ENDPOINTS")]
    pub endpoints: PathBuf,

    /// Seconds a client has to deliver its ClientHello.
    #[arg(
        long,
        env = "SNIPROXY_PEEK_TIMEOUT_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub peek_timeout_secs: u64,

    /// Seconds to wait for a backend connection.
    #[arg(
        long,
        env = "SNIPROXY_CONNECT_TIMEOUT_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub connect_timeout_secs: u64,

    /// Maximum concurrent client connections.
    #[arg(long, env = "SNIPROXY_MAX_CONNECTIONS", default_value_t = sniproxy::proxy::DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Poll the endpoint file every N seconds and reload it on change.
    #[arg(
        long,
        env = "SNIPROXY_RELOAD_INTERVAL_SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub reload_interval_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "SNIPROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "SNIPROXY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn peek_timeout(&self) -> Duration {
        Duration::from_secs(self.peek_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reload_interval(&self) -> Option<Duration> {
        self.reload_interval_secs.map(Duration::from_secs)
    }

    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen);
        config.max_connections = self.max_connections;
        config.relay = RelayConfig {
            peek_timeout: self.peek_timeout(),
            connect_timeout: self.connect_timeout(),
        };
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["sniproxy", "--endpoints", "/etc/sniproxy/endpoints"])
            .unwrap();

        assert_eq!(config.listen, "[::]:443".parse().unwrap());
        assert_eq!(config.peek_timeout(), Duration::from_secs(60));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.reload_interval(), None);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_listener_config() {
        let config = Config::try_parse_from([
            "sniproxy",
            "--endpoints",
            "endpoints.txt",
            "--listen",
            "127.0.0.1:8443",
            "--peek-timeout-secs",
            "5",
            "--max-connections",
            "42",
            "--reload-interval-secs",
            "30",
            "--log-format",
            "text",
        ])
        .unwrap();

        let listener = config.listener_config();
        assert_eq!(listener.bind_addr, "127.0.0.1:8443".parse().unwrap());
        assert_eq!(listener.max_connections, 42);
        assert_eq!(listener.relay.peek_timeout, Duration::from_secs(5));
        assert_eq!(config.reload_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = Config::try_parse_from([
            "sniproxy",
            "--endpoints",
            "endpoints.txt",
            "--peek-timeout-secs",
            "0",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_endpoints_required() {
        assert!(Config::try_parse_from(["sniproxy"]).is_err());
    }
}
