//! Topology Push Protocol
//!
//! The shape in which the cluster announces a new layout, either pushed by the membership
//! collaborator or piggy-backed on a server response.

use serde::{Deserialize, Serialize};

use super::types::{Address, PartitionStrategy, Topology};
use crate::error::{Result, RouterError};

/// Endpoint the membership collaborator pushes topologies to (`/topology/:cache`).
pub const ENDPOINT_TOPOLOGY_PUSH: &str = "/topology";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologyUpdate {
    pub version: u64,
    /// 0 = server list only, 1 = ring, 2 = segmented.
    pub hash_version: u8,
    pub partition_count: u32,
    /// `owners[p]` lists the owners of partition `p`, primary first.
    #[serde(default)]
    pub owners: Vec<Vec<Address>>,
    /// Full server list; derived from `owners` when empty.
    #[serde(default)]
    pub servers: Vec<Address>,
}

impl TopologyUpdate {
    pub fn into_topology(self) -> Result<Topology> {
        match PartitionStrategy::for_hash_version(self.hash_version, self.partition_count)? {
            None => {
                let mut servers = self.servers;
                for list in &self.owners {
                    for address in list {
                        if !servers.contains(address) {
                            servers.push(address.clone());
                        }
                    }
                }
                Ok(Topology::servers_only(self.version, servers))
            }
            Some(strategy) => {
                if self.owners.len() != self.partition_count as usize {
                    return Err(RouterError::InvalidTopology(format!(
                        "owner table has {} rows for {} partitions",
                        self.owners.len(),
                        self.partition_count
                    )));
                }
                Topology::new(self.version, strategy, self.owners)
            }
        }
    }
}
