//! Router Wire Protocol
//!
//! Payload shapes exchanged with cache servers. The byte encoding belongs to the transport;
//! the default `HttpTransport` sends these as JSON over HTTP.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::types::OperationKind;
use crate::topology::protocol::TopologyUpdate;

/// Single endpoint every request is posted to.
pub const ENDPOINT_REQUEST: &str = "/hotrod";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    Operation {
        cache: String,
        kind: OperationKind,
        key: String,
        value_json: Option<String>,
        /// Topology version the client routed with.
        topology_version: u64,
    },
    ScanStart {
        cache: String,
        partitions: BTreeSet<u32>,
        batch_size: usize,
        filter: Option<String>,
        include_metadata: bool,
    },
    ScanNext {
        cache: String,
        token: String,
    },
    ScanEnd {
        cache: String,
        token: String,
    },
}

impl Request {
    pub fn cache(&self) -> &str {
        match self {
            Request::Operation { cache, .. }
            | Request::ScanStart { cache, .. }
            | Request::ScanNext { cache, .. }
            | Request::ScanEnd { cache, .. } => cache,
        }
    }
}

/// Every response may carry a newer topology for the request's cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub body: Response,
    #[serde(default)]
    pub topology: Option<TopologyUpdate>,
}

impl From<Response> for ResponseEnvelope {
    fn from(body: Response) -> Self {
        Self {
            body,
            topology: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    /// Result of a key operation: the current or previous value, if any.
    Value { value_json: Option<String> },
    Flag { value: bool },
    ScanStarted {
        token: String,
        batch: ScanBatch,
        /// Partitions the server accepted to serve; the rest of the request it does not own.
        remaining_partitions: BTreeSet<u32>,
    },
    ScanPage { batch: ScanBatch },
    Ack,
    Error { kind: ServerErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// The operation ran and failed; never retried by the router.
    Application,
    /// The server no longer owns the partition for the client's topology.
    TopologyStale,
    /// The iteration token is unknown to the server.
    InvalidIteration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScanBatch {
    pub entries: Vec<WireEntry>,
    /// Partitions this server has fully delivered, including through this batch.
    pub finished_partitions: BTreeSet<u32>,
}

impl ScanBatch {
    /// An empty page means the server has nothing more for the iteration.
    pub fn is_exhausted(&self) -> bool {
        self.entries.is_empty() && self.finished_partitions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EntryStatus {
    #[default]
    Present,
    /// Removed while the iteration was running; tracked, never emitted.
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEntry {
    pub key: String,
    pub value_json: String,
    pub partition: u32,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default)]
    pub metadata: Option<EntryMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryMetadata {
    pub version: u64,
    pub lifespan_ms: Option<u64>,
    pub max_idle_ms: Option<u64>,
}
