use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::topology::types::Address;

/// Round-robin server picker used whenever a request has no owner to go to.
///
/// Starts at a random offset so that many clients do not all hit the first server.
pub struct RoundRobinBalancer {
    index: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(rand::thread_rng().gen_range(0..1024)),
        }
    }

    /// Next server of `servers` that is not in `failed`, if any.
    pub fn next_server(&self, servers: &[Address], failed: &HashSet<Address>) -> Option<Address> {
        if servers.is_empty() {
            return None;
        }
        for _ in 0..servers.len() {
            let i = self.index.fetch_add(1, Ordering::Relaxed) % servers.len();
            let server = &servers[i];
            if !failed.contains(server) {
                return Some(server.clone());
            }
        }
        None
    }

    /// Next server of `servers`, failed or not.
    pub fn next_any(&self, servers: &[Address]) -> Option<Address> {
        self.next_server(servers, &HashSet::new())
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}
