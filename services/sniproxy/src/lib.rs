pub mod endpoints;
pub mod error;
pub mod proxy;

pub use endpoints::{EndpointDb, EndpointEntry, EndpointTable};
pub use error::{EndpointError, ProxyError};
pub use proxy::{
    ClientHelloPeeker, Listener, ListenerConfig, ListenerStats, PeekError, PeekResult, Relay,
    RelayConfig, RelayOutcome, ServerName, NO_SNI_HOSTNAME, WILDCARD_HOSTNAME,
};
