//! Topology Module
//!
//! The client's view of how the keyspace is laid out over the cluster.
//!
//! ## Core Concepts
//! - **Partitioning**: Keys hash into a fixed number of partitions (`partition`).
//! - **Snapshots**: A `Topology` is an immutable, versioned owner table; partition `p`'s first
//!   owner is its primary.
//! - **Registry**: `TopologyRegistry` keeps the current snapshot per cache, refuses stale
//!   versions and wakes operations waiting for a refresh.
//! - **Push Protocol**: `TopologyUpdate` is what the cluster sends when the layout changes.

pub mod partition;
pub mod protocol;
pub mod registry;
pub mod types;
