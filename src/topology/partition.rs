use std::collections::{BTreeSet, HashMap};
use xxhash_rust::xxh3::xxh3_64;

use super::types::{Address, Target, Topology};

/// Size of the positive hash space keys are normalized into.
pub const HASH_SPACE: u32 = 1 << 31;

/// Deterministic hash of a key, cleared of its sign bit.
pub fn normalized_hash(key: &[u8]) -> u32 {
    (xxh3_64(key) & 0x7fff_ffff) as u32
}

/// Maps a key to its partition for the given partition count.
///
/// Pure and stable across processes: the same bytes and count always give the same id.
pub fn partition_of(key: &[u8], partition_count: u32) -> u32 {
    assert!(partition_count > 0, "partition count must be positive");
    let segment_size = HASH_SPACE.div_ceil(partition_count);
    normalized_hash(key) / segment_size
}

/// Owners of a partition, primary first. Empty when the partition is unknown.
pub fn owners_of(topology: &Topology, partition: u32) -> &[Address] {
    topology.owners(partition)
}

/// Partition and owners a key routes to under a hash-aware topology.
pub fn route_key<'a>(topology: &'a Topology, key: &[u8]) -> Option<(u32, &'a [Address])> {
    let strategy = topology.strategy()?;
    let partition = strategy.partition_of(key);
    Some((partition, topology.owners(partition)))
}

/// Groups partitions by their primary owner.
///
/// Without a hash-aware topology everything lands in a single `Target::Any` group, as do
/// partitions that currently have no owner.
pub fn group_partitions_by_owner(
    topology: Option<&Topology>,
    partitions: &BTreeSet<u32>,
) -> HashMap<Target, BTreeSet<u32>> {
    let mut groups: HashMap<Target, BTreeSet<u32>> = HashMap::new();
    if partitions.is_empty() {
        return groups;
    }

    match topology.filter(|t| t.is_hash_aware()) {
        None => {
            groups.insert(Target::Any, partitions.clone());
        }
        Some(topology) => {
            for &partition in partitions {
                let target = topology
                    .owners(partition)
                    .first()
                    .map(|primary| Target::Server(primary.clone()))
                    .unwrap_or(Target::Any);
                groups.entry(target).or_default().insert(partition);
            }
        }
    }

    groups
}
