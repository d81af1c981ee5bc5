use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protocol::Request;
use crate::error::RouterError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationKind {
    Get,
    Put,
    Remove,
    ContainsKey,
}

/// One logical client call against a single key.
///
/// The retry bookkeeping (attempt count, excluded addresses) lives in the `RetryState` that
/// drives it, so the operation itself stays immutable across attempts.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: Uuid,
    pub cache: String,
    pub kind: OperationKind,
    pub key: String,
    pub value_json: Option<String>,
}

impl Operation {
    pub fn new(cache: &str, kind: OperationKind, key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cache: cache.to_string(),
            kind,
            key: key.into(),
            value_json: None,
        }
    }

    pub fn with_value(mut self, value_json: String) -> Self {
        self.value_json = Some(value_json);
        self
    }

    pub fn request(&self, topology_version: u64) -> Request {
        Request::Operation {
            cache: self.cache.clone(),
            kind: self.kind,
            key: self.key.clone(),
            value_json: self.value_json.clone(),
            topology_version,
        }
    }

    pub fn describe(&self) -> String {
        format!("{:?} '{}' on cache '{}'", self.kind, self.key, self.cache)
    }
}

/// How the router reacts to a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection-level fault; rotate to another owner.
    Unreachable,
    /// Server is not authoritative; refresh the topology, free of charge.
    TopologyStale,
    /// Ran and failed; surface verbatim.
    ApplicationError,
    /// Deadline exceeded; handled like `Unreachable` without penalizing the server.
    Timeout,
}

impl FailureKind {
    pub fn classify(error: &RouterError) -> Self {
        match error {
            RouterError::Unreachable { .. } => FailureKind::Unreachable,
            RouterError::Timeout { .. } => FailureKind::Timeout,
            RouterError::TopologyStale { .. } => FailureKind::TopologyStale,
            _ => FailureKind::ApplicationError,
        }
    }

    pub fn is_retriable(self) -> bool {
        !matches!(self, FailureKind::ApplicationError)
    }
}
