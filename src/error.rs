//! Router Error Taxonomy
//!
//! Every failure the routing layer can surface. Transport and topology-staleness failures are
//! recovered internally by the retry and scan coordinators and only reach the caller once a
//! bound is exceeded; application errors pass through untouched.

use std::collections::BTreeSet;

use crate::topology::types::Address;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RouterError {
    #[error("server {address} is unreachable: {reason}")]
    Unreachable { address: Address, reason: String },

    #[error("request to {address} timed out")]
    Timeout { address: Address },

    #[error("server {address} is not authoritative for topology {version}")]
    TopologyStale { address: Address, version: u64 },

    #[error("application error: {message}")]
    Application { message: String },

    #[error("iteration {token} is unknown to server {address}")]
    InvalidIteration { address: Address, token: String },

    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: Box<RouterError>,
    },

    #[error("no owner available for partition {partition:?}")]
    NoOwnersAvailable { partition: Option<u32> },

    #[error("scan aborted with {} partition(s) outstanding: {missed:?}", missed.len())]
    ScanAborted { missed: BTreeSet<u32> },

    #[error("timed out waiting for topology newer than {version} of cache '{cache}'")]
    TopologyWaitTimeout { cache: String, version: u64 },

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl RouterError {
    /// Connection-level failures that owner rotation can recover from.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RouterError::Unreachable { .. } | RouterError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(e: serde_json::Error) -> Self {
        RouterError::Serialization(e.to_string())
    }
}
