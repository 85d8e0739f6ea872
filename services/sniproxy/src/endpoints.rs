//! Endpoint table: hostname patterns mapped to backend addresses.
//!
//! The endpoint file holds one `<pattern>,<address>` rule per line:
//! - The line is split at its *last* comma, so a pattern may contain commas
//!   only if the address does not. Quantifiers like `{2,3}` therefore cannot
//!   be used unless the line still ends with `,<address>`; the last comma
//!   always wins.
//! - Blank lines and lines without a comma are skipped.
//! - `<pattern>` is a regular expression searched (unanchored) in the SNI
//!   hostname, the empty string (ClientHello without SNI), or `*` (not TLS).
//! - `<address>` is a `host:port` string handed to the dialer as-is.
//!
//! Rules are tried in file order; the first match wins.
//!
//! The table is an immutable snapshot. Reloads build a new snapshot and
//! swap it in atomically, so lookups never block on a reload.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{EndpointError, ProxyError};
use crate::proxy::{NO_SNI_HOSTNAME, WILDCARD_HOSTNAME};

/// One routing rule.
#[derive(Debug, Clone)]
pub struct EndpointEntry {
    pattern: String,
    address: String,
    matcher: Regex,
}

impl EndpointEntry {
    /// Compile `pattern` into a rule routing to `address`.
    pub fn new(
        pattern: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let pattern = pattern.into();
        let matcher = Regex::new(&pattern)?;
        Ok(Self {
            pattern,
            address: address.into(),
            matcher,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether this rule applies to `hostname`.
    pub fn matches(&self, hostname: &str) -> bool {
        self.matcher.is_match(hostname)
    }
}

/// Ordered, immutable set of rules.
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    entries: Vec<EndpointEntry>,
}

impl EndpointTable {
    pub fn new(entries: Vec<EndpointEntry>) -> Self {
        Self { entries }
    }

    /// Parse the endpoint file format.
    pub fn parse(text: &str) -> Result<Self, EndpointError> {
        let mut entries = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let Some((pattern, address)) = line.rsplit_once(',') else {
                continue;
            };

            let entry = EndpointEntry::new(pattern, address).map_err(|source| {
                EndpointError::InvalidPattern {
                    line: index + 1,
                    pattern: pattern.to_string(),
                    source,
                }
            })?;
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    /// Read and parse an endpoint file.
    pub fn from_file(path: &Path) -> Result<Self, EndpointError> {
        let text = fs::read_to_string(path).map_err(|source| EndpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// First rule matching `hostname`.
    pub fn get(&self, hostname: &str) -> Option<&EndpointEntry> {
        self.entries.iter().find(|entry| entry.matches(hostname))
    }

    /// Fallback route keys no rule matches: [`WILDCARD_HOSTNAME`] for
    /// non-TLS streams and [`NO_SNI_HOSTNAME`] for ClientHellos without SNI.
    pub fn unrouted_fallbacks(&self) -> Vec<&'static str> {
        [WILDCARD_HOSTNAME, NO_SNI_HOSTNAME]
            .into_iter()
            .filter(|key| self.get(key).is_none())
            .collect()
    }

    pub fn entries(&self) -> &[EndpointEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromStr for EndpointTable {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Shared endpoint database.
///
/// Uses ArcSwap for lock-free atomic table updates.
/// Readers get consistent snapshots without blocking.
/// Writers atomically swap in new snapshots.
pub struct EndpointDb {
    snapshot: ArcSwap<EndpointTable>,
    /// File the table was loaded from, if any.
    path: Option<PathBuf>,
}

impl EndpointDb {
    /// Create a database serving a fixed table.
    pub fn new(table: EndpointTable) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(table),
            path: None,
        }
    }

    /// Load the database from an endpoint file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, EndpointError> {
        let path = path.into();
        let table = EndpointTable::from_file(&path)?;
        info!(path = %path.display(), endpoint_count = table.len(), "Endpoints loaded");

        Ok(Self {
            snapshot: ArcSwap::from_pointee(table),
            path: Some(path),
        })
    }

    /// Resolve `hostname` to the first matching rule.
    pub fn get(&self, hostname: &str) -> Result<EndpointEntry, ProxyError> {
        let snapshot = self.snapshot.load();
        match snapshot.get(hostname) {
            Some(entry) => {
                debug!(
                    hostname = %hostname,
                    pattern = %entry.pattern(),
                    address = %entry.address(),
                    "Endpoint matched"
                );
                Ok(entry.clone())
            }
            None => Err(ProxyError::RoutingFailure {
                hostname: hostname.to_string(),
            }),
        }
    }

    /// Current table snapshot.
    pub fn snapshot(&self) -> Arc<EndpointTable> {
        self.snapshot.load_full()
    }

    /// Replace the whole table atomically.
    pub fn replace(&self, table: EndpointTable) {
        let endpoint_count = table.len();
        self.snapshot.store(Arc::new(table));
        info!(endpoint_count = endpoint_count, "Endpoint table updated atomically");
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the endpoint file and swap in the new table.
    ///
    /// On error the current table stays active. Returns the new rule count.
    pub async fn reload(&self) -> Result<usize, EndpointError> {
        let Some(path) = &self.path else {
            return Ok(self.snapshot.load().len());
        };

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| EndpointError::Io {
                path: path.clone(),
                source,
            })?;
        let table = EndpointTable::parse(&text)?;
        let endpoint_count = table.len();
        self.replace(table);
        Ok(endpoint_count)
    }

    /// Poll the endpoint file and reload it whenever its modification time
    /// changes, until `shutdown` flips to `true`.
    pub async fn watch(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let Some(path) = self.path.clone() else {
            debug!("Endpoint table has no backing file, not watching");
            return;
        };

        info!(
            path = %path.display(),
            interval_ms = interval.as_millis() as u64,
            "Starting endpoint reload loop"
        );

        let mut last_modified = modified(&path).await;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = modified(&path).await;
                    if current.is_none() || current == last_modified {
                        continue;
                    }

                    match self.reload().await {
                        Ok(endpoint_count) => {
                            info!(
                                path = %path.display(),
                                endpoint_count = endpoint_count,
                                "Endpoints reloaded"
                            );
                            last_modified = current;
                        }
                        Err(e) => {
                            warn!(
                                path = %path.display(),
                                error = %e,
                                "Endpoint reload failed, keeping previous table"
                            );
                            // Don't retry the same broken file every tick.
                            last_modified = current;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Endpoint reload loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.modified().ok(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot stat endpoints file");
            None
        }
    }
}
