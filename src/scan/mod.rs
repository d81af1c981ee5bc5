//! Scan Module
//!
//! Full iteration of a partitioned cache that visits every entry exactly once, while owners die
//! and topologies change underneath it.
//!
//! ## Core Concepts
//! - **Sub-session**: one server-scoped cursor over a subset of partitions, paged with
//!   start/next requests and released with an explicit end request.
//! - **Planning cycle**: residual partitions are regrouped by owner and dispatched again until
//!   every partition has been confirmed finished.
//! - **Deduplication**: a partition restarted on another server replays keys the consumer has
//!   already seen; the tracker suppresses them.
//!
//! ## Submodules
//! - **`types`**: Scan options, delivered entries and sub-session bookkeeping.
//! - **`tracker`**: `SegmentKeyTracker`, partition completion and seen-key sets.
//! - **`coordinator`**: `ScanCoordinator`, the planning loop and the consumer-facing `ScanStream`.

pub mod coordinator;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod tests;
