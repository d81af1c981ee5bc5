use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::partition::{HASH_SPACE, normalized_hash};
use crate::error::{Result, RouterError};

/// Opaque network endpoint of a cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address::new(s)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Address(s)
    }
}

/// Where a group of partitions should be sent.
///
/// `Any` is the fallback used when no topology is known yet or every owner of a partition
/// has failed: the dispatcher then picks whichever server the balancer offers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Server(Address),
    Any,
}

/// How keys are laid out over partitions, selected once per topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// Each partition owns the ring arc ending at its token; `tokens` is sorted and
    /// `tokens[i]` closes partition `i`. Hashes past the last token wrap to partition 0.
    Ring { tokens: Vec<u32> },
    /// Partitions are contiguous slices of the positive hash space, `segment_size` wide.
    Segmented { segment_size: u32 },
}

impl PartitionStrategy {
    /// Evenly spaced ring tokens for `partition_count` partitions.
    pub fn ring(partition_count: u32) -> Self {
        assert!(partition_count > 0, "partition count must be positive");
        let width = HASH_SPACE as u64 / partition_count as u64;
        let tokens = (1..=partition_count as u64)
            .map(|i| {
                if i == partition_count as u64 {
                    HASH_SPACE
                } else {
                    (i * width) as u32
                }
            })
            .collect();
        PartitionStrategy::Ring { tokens }
    }

    pub fn segmented(partition_count: u32) -> Self {
        assert!(partition_count > 0, "partition count must be positive");
        PartitionStrategy::Segmented {
            segment_size: HASH_SPACE.div_ceil(partition_count),
        }
    }

    /// Picks the strategy announced by a topology push.
    pub fn for_hash_version(hash_version: u8, partition_count: u32) -> Result<Option<Self>> {
        match hash_version {
            0 => Ok(None),
            _ if partition_count == 0 => Err(RouterError::InvalidTopology(
                "hash-aware topology with zero partitions".to_string(),
            )),
            1 => Ok(Some(Self::ring(partition_count))),
            2 => Ok(Some(Self::segmented(partition_count))),
            other => Err(RouterError::InvalidTopology(format!(
                "unsupported hash version {}",
                other
            ))),
        }
    }

    pub fn partition_of(&self, key: &[u8]) -> u32 {
        let hash = normalized_hash(key);
        match self {
            PartitionStrategy::Segmented { segment_size } => hash / segment_size,
            PartitionStrategy::Ring { tokens } => {
                let idx = tokens.partition_point(|&token| token < hash);
                if idx == tokens.len() { 0 } else { idx as u32 }
            }
        }
    }

    pub fn hash_version(&self) -> u8 {
        match self {
            PartitionStrategy::Ring { .. } => 1,
            PartitionStrategy::Segmented { .. } => 2,
        }
    }
}

/// Immutable snapshot of one cache's layout.
///
/// Never mutated after construction; the registry swaps whole snapshots so readers always see
/// a consistent owner table.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    version: u64,
    partition_count: u32,
    strategy: Option<PartitionStrategy>,
    owners: Vec<Vec<Address>>,
    primary_by_address: HashMap<Address, BTreeSet<u32>>,
    servers: Vec<Address>,
}

impl Topology {
    /// Builds a hash-aware topology. `owners[p]` lists the owners of partition `p`, primary first.
    pub fn new(
        version: u64,
        strategy: PartitionStrategy,
        owners: Vec<Vec<Address>>,
    ) -> Result<Self> {
        let partition_count = u32::try_from(owners.len())
            .map_err(|_| RouterError::InvalidTopology("too many partitions".to_string()))?;
        if partition_count == 0 {
            return Err(RouterError::InvalidTopology(
                "owner table is empty".to_string(),
            ));
        }
        if let PartitionStrategy::Ring { tokens } = &strategy
            && tokens.len() != owners.len()
        {
            return Err(RouterError::InvalidTopology(format!(
                "{} ring tokens for {} partitions",
                tokens.len(),
                owners.len()
            )));
        }

        let mut primary_by_address: HashMap<Address, BTreeSet<u32>> = HashMap::new();
        let mut servers: Vec<Address> = Vec::new();
        for (partition, list) in owners.iter().enumerate() {
            if let Some(primary) = list.first() {
                primary_by_address
                    .entry(primary.clone())
                    .or_default()
                    .insert(partition as u32);
            }
            for address in list {
                if !servers.contains(address) {
                    servers.push(address.clone());
                }
            }
        }

        Ok(Self {
            version,
            partition_count,
            strategy: Some(strategy),
            owners,
            primary_by_address,
            servers,
        })
    }

    /// A topology that only knows the server list (hash version 0).
    pub fn servers_only(version: u64, servers: Vec<Address>) -> Self {
        Self {
            version,
            partition_count: 0,
            strategy: None,
            owners: Vec::new(),
            primary_by_address: HashMap::new(),
            servers,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn strategy(&self) -> Option<&PartitionStrategy> {
        self.strategy.as_ref()
    }

    pub fn is_hash_aware(&self) -> bool {
        self.strategy.is_some()
    }

    pub fn servers(&self) -> &[Address] {
        &self.servers
    }

    pub fn contains_server(&self, address: &Address) -> bool {
        self.servers.contains(address)
    }

    pub fn owners(&self, partition: u32) -> &[Address] {
        self.owners
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary_partitions(&self) -> &HashMap<Address, BTreeSet<u32>> {
        &self.primary_by_address
    }

    /// Every partition id of this topology.
    pub fn all_partitions(&self) -> BTreeSet<u32> {
        (0..self.partition_count).collect()
    }
}

/// Read-only view of a cache's layout for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheTopologyInfo {
    pub version: u64,
    pub partition_count: u32,
    pub partitions_per_server: HashMap<Address, BTreeSet<u32>>,
}
