//! Topology Registry
//!
//! Holds the current `Topology` of every named cache. Each cache slot is a `watch` channel:
//! updates replace the whole snapshot, readers take an `Arc` once per resolution step, and
//! operations blocked on a stale topology wait on the channel for a newer version.
//!
//! Dispatches that are in flight register themselves as pending. When a new topology drops
//! the server a pending dispatch is bound to, `update` wakes it so the operation can be
//! rerouted immediately instead of waiting for its deadline.

use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use super::types::{Address, CacheTopologyInfo, Topology};
use crate::error::{Result, RouterError};

type Slot = watch::Sender<Option<Arc<Topology>>>;

struct PendingEntry {
    cache: String,
    address: Address,
    version: u64,
    reschedule: oneshot::Sender<Arc<Topology>>,
}

#[derive(Default)]
pub struct TopologyRegistry {
    caches: DashMap<String, Slot>,
    pending: DashMap<Uuid, PendingEntry>,
}

impl TopologyRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_slot<R>(&self, cache: &str, f: impl FnOnce(&Slot) -> R) -> R {
        if let Some(slot) = self.caches.get(cache) {
            return f(slot.value());
        }
        let slot = self
            .caches
            .entry(cache.to_string())
            .or_insert_with(|| watch::channel(None).0);
        f(slot.value())
    }

    /// Current snapshot of a cache, if a topology has been installed.
    pub fn get(&self, cache: &str) -> Option<Arc<Topology>> {
        self.caches
            .get(cache)
            .and_then(|slot| slot.value().borrow().clone())
    }

    /// Version of the current snapshot, `0` when none is installed.
    pub fn version(&self, cache: &str) -> u64 {
        self.get(cache).map(|t| t.version()).unwrap_or(0)
    }

    /// Installs `topology` unless it is not newer than the current one.
    ///
    /// Returns whether the snapshot was replaced. Accepted updates wake every waiter and
    /// reschedule pending dispatches bound to servers the new topology no longer contains.
    pub fn update(&self, cache: &str, topology: Topology) -> bool {
        let topology = Arc::new(topology);
        let accepted = self.with_slot(cache, |slot| {
            slot.send_if_modified(|current| match current {
                Some(existing) if topology.version() <= existing.version() => false,
                _ => {
                    *current = Some(topology.clone());
                    true
                }
            })
        });

        if !accepted {
            tracing::debug!(
                cache,
                version = topology.version(),
                current = self.version(cache),
                "Ignoring outdated topology"
            );
            return false;
        }

        tracing::info!(
            cache,
            version = topology.version(),
            partitions = topology.partition_count(),
            servers = topology.servers().len(),
            "Installed new topology"
        );

        let rescheduled = self.reschedule_orphaned(cache, &topology);
        if rescheduled > 0 {
            tracing::info!(cache, rescheduled, "Rescheduled dispatches bound to removed servers");
        }
        true
    }

    /// Forgets the current snapshot so the cache falls back to the initial server list.
    /// The next pushed topology is accepted whatever its version.
    pub fn reset(&self, cache: &str) {
        self.with_slot(cache, |slot| {
            slot.send_replace(None);
        });
        tracing::warn!(cache, "Reverted cache to the initial server list");
    }

    /// Subscribes to topology changes of a cache.
    pub fn subscribe(&self, cache: &str) -> watch::Receiver<Option<Arc<Topology>>> {
        self.with_slot(cache, |slot| slot.subscribe())
    }

    /// Waits until the cache holds a topology strictly newer than `version`.
    pub async fn wait_for_newer(
        &self,
        cache: &str,
        version: u64,
        timeout: Duration,
    ) -> Result<Arc<Topology>> {
        let mut rx = self.subscribe(cache);
        let newer = rx.wait_for(|current| current.as_ref().is_some_and(|t| t.version() > version));

        match tokio::time::timeout(timeout, newer).await {
            Ok(Ok(current)) => current.clone().ok_or_else(|| RouterError::TopologyWaitTimeout {
                cache: cache.to_string(),
                version,
            }),
            Ok(Err(_)) | Err(_) => Err(RouterError::TopologyWaitTimeout {
                cache: cache.to_string(),
                version,
            }),
        }
    }

    /// Registers a dispatch to `address` made under topology `version`.
    ///
    /// The returned guard resolves once a newer topology without `address` is installed, and
    /// deregisters the dispatch when dropped. A topology that already dropped `address` before
    /// registration resolves the guard at once.
    pub fn track_pending(&self, cache: &str, address: &Address, version: u64) -> PendingDispatch<'_> {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        self.pending.insert(
            id,
            PendingEntry {
                cache: cache.to_string(),
                address: address.clone(),
                version,
                reschedule: tx,
            },
        );

        // Checked after inserting so an update racing with registration is seen by one side.
        if let Some(current) = self.get(cache)
            && current.version() > version
            && !current.contains_server(address)
            && let Some((_, pending)) = self.pending.remove(&id)
        {
            tracing::debug!(
                cache,
                address = %address,
                version,
                current = current.version(),
                "Dispatch target already left the topology"
            );
            let _ = pending.reschedule.send(current);
        }

        PendingDispatch {
            registry: self,
            id,
            rx,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn reschedule_orphaned(&self, cache: &str, topology: &Arc<Topology>) -> usize {
        let orphaned: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| {
                let pending = entry.value();
                pending.cache == cache
                    && pending.version < topology.version()
                    && !topology.contains_server(&pending.address)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut count = 0;
        for id in orphaned {
            if let Some((_, pending)) = self.pending.remove(&id) {
                tracing::debug!(
                    cache,
                    address = %pending.address,
                    "Server left the topology while a dispatch was queued"
                );
                if pending.reschedule.send(topology.clone()).is_ok() {
                    count += 1;
                }
            }
        }
        count
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn cache_topology_info(&self, cache: &str) -> Option<CacheTopologyInfo> {
        let topology = self.get(cache)?;
        let mut partitions_per_server: HashMap<Address, BTreeSet<u32>> = HashMap::new();
        for partition in 0..topology.partition_count() {
            for owner in topology.owners(partition) {
                partitions_per_server
                    .entry(owner.clone())
                    .or_default()
                    .insert(partition);
            }
        }
        Some(CacheTopologyInfo {
            version: topology.version(),
            partition_count: topology.partition_count(),
            partitions_per_server,
        })
    }

    pub fn primary_partitions_by_address(&self, cache: &str) -> HashMap<Address, BTreeSet<u32>> {
        self.get(cache)
            .map(|t| t.primary_partitions().clone())
            .unwrap_or_default()
    }
}

/// A dispatch registered with the registry while its request is in flight.
pub struct PendingDispatch<'a> {
    registry: &'a TopologyRegistry,
    id: Uuid,
    rx: oneshot::Receiver<Arc<Topology>>,
}

impl PendingDispatch<'_> {
    /// Resolves with the topology that removed this dispatch's server.
    pub async fn rescheduled(&mut self) -> Arc<Topology> {
        match (&mut self.rx).await {
            Ok(topology) => topology,
            Err(_) => std::future::pending().await,
        }
    }
}

impl Drop for PendingDispatch<'_> {
    fn drop(&mut self) {
        self.registry.pending.remove(&self.id);
    }
}
