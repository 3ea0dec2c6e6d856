//! Transport configuration, loadable from TOML or JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::backoff::{ResurrectBackoff, RetryBackoff};
use crate::connection::{normalize_url, NodeDescriptor};
use crate::error::{Result, TransportError};
use crate::pool::{NodeFilter, PoolConfig, Selector};
use crate::request::RetryableStatusCodes;
use crate::resurrect::ResurrectStrategy;
use crate::sniffer::{SnifferConfig, DEFAULT_SNIFF_ENDPOINT};

/// Everything needed to build a [`crate::Transport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Seed nodes. Entries may be plain URL strings or full descriptors.
    #[serde(deserialize_with = "deserialize_nodes")]
    pub nodes: Vec<NodeDescriptor>,
    /// Retries after the first attempt (default: 3).
    pub max_retries: u32,
    /// Per-attempt timeout in milliseconds (default: 30000).
    pub request_timeout_ms: u64,
    /// Timeout of a resurrect ping in milliseconds (default: 3000).
    pub ping_timeout_ms: u64,
    /// Resurrect strategy (default: ping).
    pub resurrect_strategy: ResurrectStrategy,
    /// Quarantine after the first failure in milliseconds (default: 60000).
    pub resurrect_timeout_ms: u64,
    /// Highest backoff exponent (default: 5).
    pub resurrect_timeout_cutoff: u32,
    /// Quarantine ceiling in seconds (default: 3600).
    pub max_resurrect_timeout_secs: u64,
    /// Interval sniffing period in milliseconds; unset disables it.
    pub sniff_interval_ms: Option<u64>,
    /// Sniff when the transport is created (default: false).
    pub sniff_on_start: bool,
    /// Sniff when a failure leaves no alive connection (default: false).
    pub sniff_on_connection_fault: bool,
    /// Discovery path (default: `/_nodes/_all/http`).
    pub sniff_endpoint: String,
    /// Statuses that mark a node dead (default: 502, 503, 504).
    pub retryable_status_codes: Vec<u16>,
    /// Selection among alive connections (default: round robin).
    pub selector: Selector,
    /// Which nodes serve requests (default: all but dedicated masters).
    pub node_filter: NodeFilter,
    /// Pause between retries (disabled by default).
    pub retry_backoff: RetryBackoff,
    /// Client name reported in events (default: `searchwire`).
    pub name: String,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
    /// Capacity of the event channel (default: 1024).
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            max_retries: 3,
            request_timeout_ms: 30_000,
            ping_timeout_ms: 3_000,
            resurrect_strategy: ResurrectStrategy::Ping,
            resurrect_timeout_ms: 60_000,
            resurrect_timeout_cutoff: 5,
            max_resurrect_timeout_secs: 3_600,
            sniff_interval_ms: None,
            sniff_on_start: false,
            sniff_on_connection_fault: false,
            sniff_endpoint: DEFAULT_SNIFF_ENDPOINT.to_string(),
            retryable_status_codes: vec![502, 503, 504],
            selector: Selector::RoundRobin,
            node_filter: NodeFilter::ExcludeMasterOnly,
            retry_backoff: RetryBackoff::default(),
            name: "searchwire".to_string(),
            headers: BTreeMap::new(),
            event_capacity: 1024,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NodeEntry {
    Url(String),
    Descriptor(NodeDescriptor),
}

fn deserialize_nodes<'de, D>(deserializer: D) -> std::result::Result<Vec<NodeDescriptor>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<NodeEntry>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            NodeEntry::Url(url) => NodeDescriptor::new(url),
            NodeEntry::Descriptor(descriptor) => descriptor,
        })
        .collect())
}

impl TransportConfig {
    /// Config with the given seed URLs and defaults elsewhere.
    pub fn with_nodes<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: urls.into_iter().map(NodeDescriptor::new).collect(),
            ..Self::default()
        }
    }

    /// Loads a config file; the format follows the extension (`.toml` or `.json`).
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TransportConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| {
                TransportError::Configuration(format!("{}: {}", path.display(), e))
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| {
                TransportError::Configuration(format!("{}: {}", path.display(), e))
            })?,
            _ => {
                return Err(TransportError::Configuration(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the config for values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(TransportError::Configuration(
                "at least one node is required".to_string(),
            ));
        }
        for node in &self.nodes {
            normalize_url(&node.url)?;
        }
        let timeouts = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("resurrect_timeout_ms", self.resurrect_timeout_ms),
            ("max_resurrect_timeout_secs", self.max_resurrect_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(TransportError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if self.sniff_interval_ms == Some(0) {
            return Err(TransportError::Configuration(
                "sniff_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !self.sniff_endpoint.starts_with('/') {
            return Err(TransportError::Configuration(format!(
                "sniff_endpoint must start with '/': {:?}",
                self.sniff_endpoint
            )));
        }
        if let Some(code) = self
            .retryable_status_codes
            .iter()
            .find(|c| !(100..=599).contains(*c))
        {
            return Err(TransportError::Configuration(format!(
                "invalid retryable status code {}",
                code
            )));
        }
        Ok(())
    }

    /// Per-attempt timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Resurrect ping timeout.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Interval sniffing period, if enabled.
    pub fn sniff_interval(&self) -> Option<Duration> {
        self.sniff_interval_ms.map(Duration::from_millis)
    }

    /// Quarantine schedule.
    pub fn resurrect_backoff(&self) -> ResurrectBackoff {
        ResurrectBackoff {
            base: Duration::from_millis(self.resurrect_timeout_ms),
            cutoff: self.resurrect_timeout_cutoff,
            max: Duration::from_secs(self.max_resurrect_timeout_secs),
        }
    }

    /// Pool settings derived from this config.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            resurrect_backoff: self.resurrect_backoff(),
            selector: self.selector,
        }
    }

    /// Sniffer settings derived from this config.
    pub fn sniffer_config(&self) -> SnifferConfig {
        SnifferConfig {
            interval: self.sniff_interval(),
            on_start: self.sniff_on_start,
            on_connection_fault: self.sniff_on_connection_fault,
            endpoint: self.sniff_endpoint.clone(),
            timeout: self.request_timeout(),
        }
    }

    /// Statuses that mark a node dead.
    pub fn retryable(&self) -> RetryableStatusCodes {
        RetryableStatusCodes::new(self.retryable_status_codes.iter().copied())
    }
}
