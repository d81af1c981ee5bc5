//! Router Configuration
//!
//! The options consumed by the routing core: retry budget, scan batch sizing, the topology
//! refresh bound and per-request deadlines. Values can be built in code, deserialized from JSON,
//! or parsed from `--flag value` command line pairs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, RouterError};
use crate::topology::types::Address;

/// How much of the cluster layout the client is allowed to exploit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ClientIntelligence {
    /// Ignore pushed topologies; balance across the initial servers only.
    Basic,
    /// Follow the pushed server list but never hash keys to owners.
    TopologyAware,
    /// Route every key to its owners.
    #[default]
    HashDistributionAware,
}

impl std::str::FromStr for ClientIntelligence {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(ClientIntelligence::Basic),
            "topology" | "topology_aware" => Ok(ClientIntelligence::TopologyAware),
            "hash" | "hash_distribution_aware" => Ok(ClientIntelligence::HashDistributionAware),
            other => Err(RouterError::InvalidConfig(format!(
                "unknown client intelligence '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Owner-rotation retries allowed per logical operation, on top of the first attempt.
    pub max_retries: u32,
    /// Global scan batch size, divided across the servers a scan fans out to.
    pub scan_batch_size: usize,
    /// Upper bound on waiting for a newer topology after a stale response.
    pub topology_refresh_timeout: Duration,
    /// Deadline of a single network round trip.
    pub request_timeout: Duration,
    /// Overall deadline of one scan; `None` leaves only the all-servers-failed backstop.
    pub scan_timeout: Option<Duration>,
    pub initial_servers: Vec<Address>,
    pub intelligence: ClientIntelligence,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            scan_batch_size: 100,
            topology_refresh_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            scan_timeout: Some(Duration::from_secs(300)),
            initial_servers: Vec::new(),
            intelligence: ClientIntelligence::default(),
        }
    }
}

impl RouterConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_scan_batch_size(mut self, scan_batch_size: usize) -> Self {
        self.scan_batch_size = scan_batch_size;
        self
    }

    pub fn with_topology_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.topology_refresh_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn with_initial_servers<I, A>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        self.initial_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_intelligence(mut self, intelligence: ClientIntelligence) -> Self {
        self.intelligence = intelligence;
        self
    }

    /// Parses `--flag value` pairs, ignoring anything it does not recognize.
    ///
    /// Durations are given in milliseconds. `--server` may repeat.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = RouterConfig::default();

        let mut i = 0;
        while i < args.len() {
            let value = args.get(i + 1);
            match (args[i].as_str(), value) {
                ("--server", Some(v)) => {
                    config.initial_servers.push(Address::new(v.as_str()));
                    i += 2;
                }
                ("--max-retries", Some(v)) => {
                    config.max_retries = parse_number(v, "--max-retries")?;
                    i += 2;
                }
                ("--batch-size", Some(v)) => {
                    config.scan_batch_size = parse_number(v, "--batch-size")?;
                    i += 2;
                }
                ("--refresh-timeout-ms", Some(v)) => {
                    config.topology_refresh_timeout =
                        Duration::from_millis(parse_number(v, "--refresh-timeout-ms")?);
                    i += 2;
                }
                ("--request-timeout-ms", Some(v)) => {
                    config.request_timeout =
                        Duration::from_millis(parse_number(v, "--request-timeout-ms")?);
                    i += 2;
                }
                ("--scan-timeout-ms", Some(v)) => {
                    let ms: u64 = parse_number(v, "--scan-timeout-ms")?;
                    config.scan_timeout = (ms > 0).then(|| Duration::from_millis(ms));
                    i += 2;
                }
                ("--intelligence", Some(v)) => {
                    config.intelligence = v.parse()?;
                    i += 2;
                }
                _ => {
                    i += 1;
                }
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_batch_size == 0 {
            return Err(RouterError::InvalidConfig(
                "scan_batch_size must be positive".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(RouterError::InvalidConfig(
                "request_timeout must be positive".to_string(),
            ));
        }
        if self.initial_servers.is_empty() {
            return Err(RouterError::InvalidConfig(
                "at least one initial server is required".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| RouterError::InvalidConfig(format!("{} expects a number, got '{}'", flag, value)))
}
