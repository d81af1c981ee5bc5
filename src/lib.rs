//! Partition-Aware Request Router Library
//!
//! Client-side routing core for a partitioned, replicated key-value cluster. It sends every
//! key operation to the server that owns the key, survives servers dying and ownership moving
//! while requests are in flight, and drives full-cache scans that visit each entry exactly
//! once. The binary (`main.rs`) exposes it as an HTTP router node.
//!
//! ## Architecture Modules
//!
//! - **`topology`**: Versioned partition-to-owner snapshots per cache, the hashing that maps
//!   keys to partitions, and the registry that swaps snapshots and wakes waiting operations.
//! - **`dispatch`**: The transport boundary, failure classification and the bounded retry
//!   state machine for single-key operations.
//! - **`scan`**: Full iteration across owners with failover, deduplication and explicit cursor
//!   release.
//! - **`client`**: The `Router` facade, typed `RemoteCache` views and the HTTP handlers.
//! - **`config`** / **`error`**: Recognized options and the error taxonomy.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod scan;
pub mod topology;

#[cfg(test)]
pub(crate) mod test_support;
