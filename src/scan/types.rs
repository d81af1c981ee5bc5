use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::dispatch::protocol::EntryMetadata;
use crate::topology::types::Address;

/// Caller-side knobs of a full iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Restricts the scan to these partitions; every partition when `None`.
    pub partitions: Option<BTreeSet<u32>>,
    /// Server-side filter expression, passed through untouched.
    pub filter: Option<String>,
    pub include_metadata: bool,
    /// Overrides the configured global batch size.
    pub batch_size: Option<usize>,
}

impl ScanOptions {
    pub fn with_partitions(mut self, partitions: impl IntoIterator<Item = u32>) -> Self {
        self.partitions = Some(partitions.into_iter().collect());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_metadata(mut self) -> Self {
        self.include_metadata = true;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// One entry delivered to the scan consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanEntry {
    pub key: String,
    pub value_json: String,
    pub partition: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
}

/// A server-scoped scan conversation over a subset of partitions.
#[derive(Debug, Clone)]
pub struct SubSession {
    pub address: Address,
    /// Partitions requested from the server. Empty asks the server for all of them.
    pub requested: BTreeSet<u32>,
    /// Partitions the server accepted and has not yet confirmed finished.
    pub open: BTreeSet<u32>,
    pub batch_size: usize,
    /// Iteration token; taken when the server cursor is released.
    pub token: Option<String>,
}

impl SubSession {
    pub fn new(address: Address, requested: BTreeSet<u32>, batch_size: usize) -> Self {
        Self {
            address,
            requested,
            open: BTreeSet::new(),
            batch_size,
            token: None,
        }
    }
}

/// Per-group batch size so the total in flight stays near the global size.
pub fn group_batch_size(global: usize, groups: usize) -> usize {
    global.div_ceil(groups.max(1)).max(1)
}

/// How a sub-session ended.
#[derive(Debug)]
pub(crate) enum SubSessionOutcome {
    /// The server confirmed every partition it accepted, or ran dry.
    Completed,
    /// Connection-level failure; the server joins the session's failed set.
    Failed,
    /// The server forgot the iteration or left the topology; partitions go back to planning.
    Abandoned,
    Cancelled,
    /// Non-retriable error that terminates the scan.
    Fatal(crate::error::RouterError),
}
