//! Operation Dispatcher
//!
//! Sends one request to one address and classifies the outcome. Besides the round trip
//! itself it:
//! - enforces the per-request deadline,
//! - reroutes a request whose server was dropped by a newer topology, before or while it waits,
//! - installs topologies piggy-backed on responses,
//! - remembers servers whose last round trip failed and routes around them, reverting a cache
//!   to its initial servers once every server of its topology has failed.

use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::balancer::RoundRobinBalancer;
use super::protocol::{Request, Response, ServerErrorKind};
use super::transport::{Transport, TransportError};
use crate::config::{ClientIntelligence, RouterConfig};
use crate::error::{Result, RouterError};
use crate::topology::protocol::TopologyUpdate;
use crate::topology::registry::TopologyRegistry;
use crate::topology::types::{Address, Topology};

pub struct OperationDispatcher {
    registry: Arc<TopologyRegistry>,
    transport: Arc<dyn Transport>,
    balancer: RoundRobinBalancer,
    initial_servers: Vec<Address>,
    intelligence: ClientIntelligence,
    request_timeout: Duration,
    /// Servers whose most recent round trip failed at connection level.
    connection_failed: DashSet<Address>,
    retries: AtomicU64,
}

impl OperationDispatcher {
    pub fn new(
        config: &RouterConfig,
        registry: Arc<TopologyRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            registry,
            transport,
            balancer: RoundRobinBalancer::new(),
            initial_servers: config.initial_servers.clone(),
            intelligence: config.intelligence,
            request_timeout: config.request_timeout,
            connection_failed: DashSet::new(),
            retries: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    /// Topology used for owner routing, `None` when keys must go through the balancer.
    pub fn routing_topology(&self, cache: &str) -> Option<Arc<Topology>> {
        self.registry.get(cache).filter(|t| self.routes_by_hash(t))
    }

    /// Whether keys are hashed to owners under `topology`.
    pub fn routes_by_hash(&self, topology: &Topology) -> bool {
        self.intelligence == ClientIntelligence::HashDistributionAware && topology.is_hash_aware()
    }

    /// Servers the balancer chooses from for a cache.
    pub fn servers(&self, cache: &str) -> Vec<Address> {
        if self.intelligence == ClientIntelligence::Basic {
            return self.initial_servers.clone();
        }
        match self.registry.get(cache) {
            Some(topology) if !topology.servers().is_empty() => topology.servers().to_vec(),
            _ => self.initial_servers.clone(),
        }
    }

    pub fn is_suspected(&self, address: &Address) -> bool {
        self.connection_failed.contains(address)
    }

    /// A live server outside `excluded` and outside the suspected set.
    pub fn next_server(&self, cache: &str, excluded: &HashSet<Address>) -> Option<Address> {
        let mut skip = excluded.clone();
        skip.extend(self.connection_failed.iter().map(|a| a.key().clone()));
        let servers = self.servers(cache);
        self.balancer
            .next_server(&servers, &skip)
            .or_else(|| self.balancer.next_server(&servers, excluded))
    }

    /// Any server at all, ignoring every failure mark.
    pub fn any_server(&self, cache: &str) -> Option<Address> {
        self.balancer.next_any(&self.servers(cache))
    }

    /// Installs a topology announced by the cluster. Returns whether it replaced the current one.
    pub fn on_topology_push(&self, cache: &str, update: TopologyUpdate) -> Result<bool> {
        if self.intelligence == ClientIntelligence::Basic {
            tracing::debug!(cache, version = update.version, "Basic client ignores topology");
            return Ok(false);
        }
        let topology = update.into_topology()?;
        let accepted = self.registry.update(cache, topology);
        if accepted && let Some(topology) = self.registry.get(cache) {
            self.connection_failed
                .retain(|address| topology.contains_server(address));
        }
        Ok(accepted)
    }

    /// Sends `request` to `target`, routed under topology `version`.
    pub async fn send(
        &self,
        target: &Address,
        request: &Request,
        version: u64,
    ) -> Result<Response> {
        let cache = request.cache();
        tracing::debug!(cache, address = %target, version, "Dispatching request");

        let mut pending = self.registry.track_pending(cache, target, version);
        let outcome = tokio::select! {
            biased;
            topology = pending.rescheduled() => {
                tracing::debug!(
                    cache,
                    address = %target,
                    new_version = topology.version(),
                    "Target left the topology, rerouting"
                );
                return Err(RouterError::TopologyStale {
                    address: target.clone(),
                    version,
                });
            }
            outcome = tokio::time::timeout(
                self.request_timeout,
                self.transport.send_request(target, request, self.request_timeout),
            ) => outcome,
        };
        drop(pending);

        let envelope = match outcome {
            Err(_) | Ok(Err(TransportError::Timeout)) => {
                tracing::warn!(cache, address = %target, "Request timed out");
                return Err(RouterError::Timeout {
                    address: target.clone(),
                });
            }
            Ok(Err(TransportError::Unreachable(reason))) => {
                tracing::warn!(cache, address = %target, "Server unreachable: {}", reason);
                self.mark_failed(cache, target);
                return Err(RouterError::Unreachable {
                    address: target.clone(),
                    reason,
                });
            }
            Ok(Ok(envelope)) => envelope,
        };

        self.connection_failed.remove(target);

        if let Some(update) = envelope.topology
            && let Err(e) = self.on_topology_push(cache, update)
        {
            tracing::warn!(cache, "Ignoring malformed piggy-backed topology: {}", e);
        }

        match envelope.body {
            Response::Error { kind, message } => Err(match kind {
                ServerErrorKind::Application => RouterError::Application { message },
                ServerErrorKind::TopologyStale => RouterError::TopologyStale {
                    address: target.clone(),
                    version,
                },
                ServerErrorKind::InvalidIteration => RouterError::InvalidIteration {
                    address: target.clone(),
                    token: message,
                },
            }),
            body => Ok(body),
        }
    }

    fn mark_failed(&self, cache: &str, address: &Address) {
        self.connection_failed.insert(address.clone());

        let Some(topology) = self.registry.get(cache) else {
            return;
        };
        let all_failed = !topology.servers().is_empty()
            && topology
                .servers()
                .iter()
                .all(|server| self.connection_failed.contains(server));
        let is_initial = {
            let mut current = topology.servers().to_vec();
            let mut initial = self.initial_servers.clone();
            current.sort();
            initial.sort();
            current == initial
        };
        if all_failed && !is_initial {
            tracing::warn!(
                cache,
                failed = topology.servers().len(),
                "Every server of the topology failed"
            );
            self.registry.reset(cache);
        }
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Total retries across all operations since start.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}
