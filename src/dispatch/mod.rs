//! Dispatch Module
//!
//! Gets a single request to the right server and recovers when it cannot.
//!
//! ## Flow
//! 1. **Resolve**: the key is hashed to a partition and its ordered owners are read from the
//!    current topology snapshot (or the balancer is asked when no topology is known).
//! 2. **Send**: `OperationDispatcher` performs the round trip through a `Transport` and
//!    classifies failures as unreachable, timeout, stale topology or application error.
//! 3. **Retry**: `RetryCoordinator` rotates owners on connection failures within a fixed
//!    budget, and waits for a newer topology on stale responses without spending budget.
//!
//! ## Submodules
//! - **`protocol`**: Request/response payload shapes.
//! - **`transport`**: The network boundary and its HTTP implementation.
//! - **`balancer`**: Round-robin fallback server selection.
//! - **`dispatcher`**: Single round trips, failure classification, failed-server tracking.
//! - **`retry`**: The retry state machine and its driving loop.

pub mod balancer;
pub mod dispatcher;
pub mod protocol;
pub mod retry;
pub mod transport;
pub mod types;
