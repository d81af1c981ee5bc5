//! In-memory cluster used by the unit tests.
//!
//! `MockCluster` implements `Transport` on top of per-server partition maps, with knobs for
//! every failure the router has to survive: dead servers, slow servers, stale topologies,
//! partial scans and forgotten iteration cursors. Every request is logged.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::dispatch::protocol::{
    EntryMetadata, EntryStatus, Request, Response, ResponseEnvelope, ScanBatch, ServerErrorKind,
    WireEntry,
};
use crate::dispatch::transport::{Transport, TransportError};
use crate::dispatch::types::OperationKind;
use crate::topology::partition::partition_of;
use crate::topology::protocol::TopologyUpdate;
use crate::topology::types::{Address, PartitionStrategy, Topology};

#[derive(Default)]
pub struct MockServer {
    pub down: bool,
    /// Key operations routed with an older topology are refused as stale.
    pub stale_below: u64,
    pub app_error: Option<String>,
    pub max_batch: Option<usize>,
    /// Goes down right after serving this many scan pages.
    pub die_after_batches: Option<usize>,
    pub batches_served: usize,
    /// Partitions this server agrees to scan; all requested ones when `None`.
    pub owned: Option<BTreeSet<u32>>,
    pub data: BTreeMap<u32, BTreeMap<String, String>>,
    pub removed: BTreeSet<String>,
    pub delay: Option<Duration>,
    /// Drops the next iteration cursor asked for, once.
    pub forget_iterations: bool,
    pub piggyback: Option<TopologyUpdate>,
}

struct Cursor {
    server: Address,
    pending: VecDeque<WireEntry>,
    unreported: BTreeSet<u32>,
    batch_size: usize,
}

#[derive(Default)]
struct State {
    servers: HashMap<Address, MockServer>,
    cursors: HashMap<String, Cursor>,
    log: Vec<(Address, Request)>,
    next_token: u64,
}

pub struct MockCluster {
    partition_count: u32,
    state: Mutex<State>,
}

pub fn addr(s: &str) -> Address {
    Address::new(s)
}

/// Segmented topology where `owners[p]` owns partition `p`.
pub fn topology(version: u64, owners: Vec<Vec<&str>>) -> Topology {
    let count = owners.len() as u32;
    Topology::new(
        version,
        PartitionStrategy::segmented(count),
        owners
            .into_iter()
            .map(|list| list.into_iter().map(addr).collect())
            .collect(),
    )
    .unwrap()
}

impl MockCluster {
    pub fn new(partition_count: u32, servers: &[&str]) -> Self {
        let mut state = State::default();
        for s in servers {
            state.servers.insert(addr(s), MockServer::default());
        }
        Self {
            partition_count,
            state: Mutex::new(state),
        }
    }

    pub fn with_server<R>(&self, server: &str, f: impl FnOnce(&mut MockServer) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        let server = state.servers.entry(addr(server)).or_default();
        f(server)
    }

    /// Stores `key` in its hashed partition on every listed server.
    pub fn seed(&self, servers: &[&str], key: &str, value: &str) -> u32 {
        let partition = partition_of(key.as_bytes(), self.partition_count);
        for s in servers {
            self.seed_partition(s, partition, key, value);
        }
        partition
    }

    pub fn seed_partition(&self, server: &str, partition: u32, key: &str, value: &str) {
        self.with_server(server, |s| {
            s.data
                .entry(partition)
                .or_default()
                .insert(key.to_string(), value.to_string());
        });
    }

    pub fn set_down(&self, server: &str, down: bool) {
        self.with_server(server, |s| s.down = down);
    }

    pub fn requests(&self) -> Vec<(Address, Request)> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn requests_to(&self, server: &str) -> usize {
        let target = addr(server);
        self.requests().iter().filter(|(a, _)| *a == target).count()
    }

    pub fn operation_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|(_, r)| matches!(r, Request::Operation { .. }))
            .count()
    }

    pub fn scan_end_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|(_, r)| matches!(r, Request::ScanEnd { .. }))
            .count()
    }

    pub fn scan_starts(&self) -> Vec<(Address, BTreeSet<u32>, usize)> {
        self.requests()
            .into_iter()
            .filter_map(|(a, r)| match r {
                Request::ScanStart {
                    partitions,
                    batch_size,
                    ..
                } => Some((a, partitions, batch_size)),
                _ => None,
            })
            .collect()
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().unwrap().cursors.len()
    }

    fn handle(&self, state: &mut State, address: &Address, request: &Request) -> Result<ResponseEnvelope, TransportError> {
        let partition_count = self.partition_count;
        let Some(server) = state.servers.get_mut(address) else {
            return Err(TransportError::Unreachable(format!("unknown host {}", address)));
        };
        if server.down {
            return Err(TransportError::Unreachable("connection refused".to_string()));
        }
        let piggyback = server.piggyback.take();

        let body = match request {
            Request::Operation {
                kind,
                key,
                value_json,
                topology_version,
                ..
            } => {
                if *topology_version < server.stale_below {
                    error(ServerErrorKind::TopologyStale, "not owner")
                } else if let Some(message) = &server.app_error {
                    error(ServerErrorKind::Application, message)
                } else {
                    let partition = partition_of(key.as_bytes(), partition_count);
                    let store = server.data.entry(partition).or_default();
                    match kind {
                        OperationKind::Get => Response::Value {
                            value_json: store.get(key).cloned(),
                        },
                        OperationKind::Put => Response::Value {
                            value_json: store.insert(key.clone(), value_json.clone().unwrap_or_default()),
                        },
                        OperationKind::Remove => Response::Value {
                            value_json: store.remove(key),
                        },
                        OperationKind::ContainsKey => Response::Flag {
                            value: store.contains_key(key),
                        },
                    }
                }
            }
            Request::ScanStart {
                partitions,
                batch_size,
                filter,
                include_metadata,
                ..
            } => {
                if let Some(message) = &server.app_error {
                    error(ServerErrorKind::Application, message)
                } else {
                    let requested: BTreeSet<u32> = if partitions.is_empty() {
                        (0..partition_count).collect()
                    } else {
                        partitions.clone()
                    };
                    let served: BTreeSet<u32> = match &server.owned {
                        Some(owned) => requested.intersection(owned).copied().collect(),
                        None => requested,
                    };
                    let mut pending = VecDeque::new();
                    for partition in &served {
                        if let Some(entries) = server.data.get(partition) {
                            // Filters are key prefixes here.
                            let matching = entries
                                .iter()
                                .filter(|(key, _)| filter.as_ref().is_none_or(|f| key.starts_with(f.as_str())));
                            for (key, value) in matching {
                                pending.push_back(WireEntry {
                                    key: key.clone(),
                                    value_json: value.clone(),
                                    partition: *partition,
                                    status: if server.removed.contains(key) {
                                        EntryStatus::Removed
                                    } else {
                                        EntryStatus::Present
                                    },
                                    metadata: include_metadata.then_some(EntryMetadata {
                                        version: 1,
                                        lifespan_ms: None,
                                        max_idle_ms: None,
                                    }),
                                });
                            }
                        }
                    }
                    let mut cursor = Cursor {
                        server: address.clone(),
                        pending,
                        unreported: served.clone(),
                        batch_size: server.max_batch.map_or(*batch_size, |m| m.min(*batch_size)),
                    };
                    let batch = next_batch(&mut cursor, server);
                    state.next_token += 1;
                    let token = format!("it-{}", state.next_token);
                    state.cursors.insert(token.clone(), cursor);
                    Response::ScanStarted {
                        token,
                        batch,
                        remaining_partitions: served,
                    }
                }
            }
            Request::ScanNext { token, .. } => {
                let forgotten = std::mem::take(&mut server.forget_iterations);
                if forgotten {
                    state.cursors.remove(token);
                }
                let valid = !forgotten
                    && state
                        .cursors
                        .get(token)
                        .is_some_and(|c| &c.server == address);
                if valid {
                    let cursor = state.cursors.get_mut(token).unwrap();
                    let server = state.servers.get_mut(address).unwrap();
                    Response::ScanPage {
                        batch: next_batch(cursor, server),
                    }
                } else {
                    error(ServerErrorKind::InvalidIteration, token)
                }
            }
            Request::ScanEnd { token, .. } => {
                state.cursors.remove(token);
                Response::Ack
            }
        };

        Ok(ResponseEnvelope {
            body,
            topology: piggyback,
        })
    }
}

fn error(kind: ServerErrorKind, message: &str) -> Response {
    Response::Error {
        kind,
        message: message.to_string(),
    }
}

fn next_batch(cursor: &mut Cursor, server: &mut MockServer) -> ScanBatch {
    let take = cursor.batch_size.min(cursor.pending.len());
    let entries: Vec<WireEntry> = cursor.pending.drain(..take).collect();
    let still_pending: BTreeSet<u32> = cursor.pending.iter().map(|e| e.partition).collect();
    let finished: BTreeSet<u32> = cursor
        .unreported
        .iter()
        .filter(|p| !still_pending.contains(p))
        .copied()
        .collect();
    for p in &finished {
        cursor.unreported.remove(p);
    }

    server.batches_served += 1;
    if server
        .die_after_batches
        .is_some_and(|n| server.batches_served >= n)
    {
        server.down = true;
    }

    ScanBatch {
        entries,
        finished_partitions: finished,
    }
}

#[async_trait]
impl Transport for MockCluster {
    async fn send_request(
        &self,
        address: &Address,
        request: &Request,
        deadline: Duration,
    ) -> Result<ResponseEnvelope, TransportError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.log.push((address.clone(), request.clone()));
            state.servers.get(address).and_then(|s| s.delay)
        };
        if let Some(delay) = delay {
            if delay >= deadline {
                tokio::time::sleep(deadline).await;
                return Err(TransportError::Timeout);
            }
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        self.handle(&mut state, address, request)
    }
}
