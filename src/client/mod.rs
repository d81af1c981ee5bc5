//! Client Module
//!
//! The public face of the routing layer.
//!
//! ## Submodules
//! - **`cache`**: `Router`, which assembles registry, dispatcher and coordinators, and the typed
//!   `RemoteCache<K, V>` view with `get`, `put`, `remove`, `contains_key` and scans.
//! - **`handlers`**: Axum handlers of the router node (topology pushes, key operations, scans,
//!   stats).
//! - **`protocol`**: Front-end endpoints and DTOs.

pub mod cache;
pub mod handlers;
pub mod protocol;
