//! Router Node Protocol
//!
//! Endpoints and DTOs of the router's own HTTP front end. Values travel as plain JSON; the
//! router stores them on the cluster as serialized JSON strings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::scan::types::ScanOptions;
use crate::topology::types::CacheTopologyInfo;

// --- API Endpoints ---

/// Key operations (`/cache/:cache/:key`) and full scans (`/cache/:cache`).
pub const ENDPOINT_CACHE: &str = "/cache";
/// Router counters and per-cache topology summaries.
pub const ENDPOINT_STATS: &str = "/stats";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Answer to a put or remove, carrying the value that was replaced.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResponse {
    pub success: bool,
    pub previous: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopologyPushResponse {
    pub accepted: bool,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Query string of a scan, e.g. `?partitions=0,3&filter=user:&metadata=true`.
#[derive(Debug, Default, Deserialize)]
pub struct ScanQuery {
    /// Comma-separated partition ids.
    pub partitions: Option<String>,
    pub filter: Option<String>,
    pub metadata: Option<bool>,
    pub batch_size: Option<usize>,
}

impl ScanQuery {
    pub fn into_options(self) -> Result<ScanOptions, String> {
        let mut options = ScanOptions::default();
        if let Some(list) = self.partitions {
            let partitions = list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| {
                    s.trim()
                        .parse::<u32>()
                        .map_err(|e| format!("invalid partition '{}': {}", s, e))
                })
                .collect::<Result<BTreeSet<u32>, String>>()?;
            options.partitions = Some(partitions);
        }
        options.filter = self.filter;
        options.include_metadata = self.metadata.unwrap_or(false);
        options.batch_size = self.batch_size.filter(|size| *size > 0);
        Ok(options)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanEntryDto {
    pub key: String,
    pub value: serde_json::Value,
    pub partition: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanResponse {
    pub complete: bool,
    pub entries: Vec<ScanEntryDto>,
    /// Partitions never confirmed when the scan aborted.
    #[serde(default)]
    pub missed_partitions: BTreeSet<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheStats {
    pub name: String,
    pub topology: Option<CacheTopologyInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RouterStats {
    /// Owner-rotation retries across all operations.
    pub retries: u64,
    pub pending_dispatches: usize,
    pub caches: Vec<CacheStats>,
}
