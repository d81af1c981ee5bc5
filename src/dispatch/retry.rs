//! Retry Coordinator
//!
//! Bounded retries on top of the dispatcher, expressed as an explicit state machine:
//!
//! ```text
//! INIT -> DISPATCHED -> SUCCESS
//!                    -> RETRY_OWNER     (unreachable / timeout, costs one retry)
//!                    -> RETRY_TOPOLOGY  (stale topology, free)
//!                    -> FAILED
//! ```
//!
//! `RetryState` holds the counting rules and is advanced by `RetryCoordinator::run`, so the
//! budget arithmetic can be tested without any networking.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::dispatcher::OperationDispatcher;
use super::protocol::Response;
use super::types::{FailureKind, Operation};
use crate::error::{Result, RouterError};
use crate::topology::partition::route_key;
use crate::topology::types::Address;

#[derive(Debug, Clone, PartialEq)]
pub enum RetryPhase {
    Init,
    Dispatched { target: Address, version: u64 },
    RetryOwner,
    RetryTopology { stale_version: u64 },
    Success,
    Failed,
}

/// What the driving loop must do after a failed dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    RotateOwner,
    RefreshTopology { after_version: u64 },
    Fail(RouterError),
}

#[derive(Debug, Clone)]
pub struct RetryState {
    operation: String,
    max_retries: u32,
    /// Dispatches charged to the budget, the first one included.
    attempts: u32,
    /// Free re-dispatches after a topology refresh.
    refreshes: u32,
    excluded: HashSet<Address>,
    fallback_used: bool,
    phase: RetryPhase,
}

impl RetryState {
    pub fn new(operation: impl Into<String>, max_retries: u32) -> Self {
        Self {
            operation: operation.into(),
            max_retries,
            attempts: 0,
            refreshes: 0,
            excluded: HashSet::new(),
            fallback_used: false,
            phase: RetryPhase::Init,
        }
    }

    pub fn phase(&self) -> &RetryPhase {
        &self.phase
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes
    }

    pub fn excluded(&self) -> &HashSet<Address> {
        &self.excluded
    }

    /// First owner not yet excluded for this operation.
    pub fn next_owner(&self, owners: &[Address]) -> Option<Address> {
        owners
            .iter()
            .find(|owner| !self.excluded.contains(*owner))
            .cloned()
    }

    /// True the first time the operation falls back to servers it already excluded.
    pub fn take_fallback(&mut self) -> bool {
        !std::mem::replace(&mut self.fallback_used, true)
    }

    /// Records a dispatch. Only re-dispatches after a topology refresh are free.
    pub fn dispatched(&mut self, target: Address, version: u64) {
        if matches!(self.phase, RetryPhase::RetryTopology { .. }) {
            self.refreshes += 1;
        } else {
            self.attempts += 1;
        }
        self.phase = RetryPhase::Dispatched { target, version };
    }

    pub fn succeeded(&mut self) {
        self.phase = RetryPhase::Success;
    }

    pub fn failed(&mut self, error: RouterError) -> RetryDecision {
        let (target, version) = match &self.phase {
            RetryPhase::Dispatched { target, version } => (target.clone(), *version),
            _ => return self.fail(error),
        };

        match FailureKind::classify(&error) {
            FailureKind::Unreachable | FailureKind::Timeout => {
                self.excluded.insert(target);
                if self.attempts > self.max_retries {
                    self.exhausted(error)
                } else {
                    self.phase = RetryPhase::RetryOwner;
                    RetryDecision::RotateOwner
                }
            }
            FailureKind::TopologyStale => {
                self.phase = RetryPhase::RetryTopology {
                    stale_version: version,
                };
                RetryDecision::RefreshTopology {
                    after_version: version,
                }
            }
            FailureKind::ApplicationError => self.fail(error),
        }
    }

    /// No newer topology arrived in time: the next dispatch is charged to the budget.
    pub fn refresh_timed_out(&mut self, error: RouterError) -> RetryDecision {
        if self.attempts > self.max_retries {
            return self.exhausted(error);
        }
        self.phase = RetryPhase::RetryOwner;
        RetryDecision::RotateOwner
    }

    fn exhausted(&mut self, error: RouterError) -> RetryDecision {
        self.fail(RouterError::RetriesExhausted {
            operation: self.operation.clone(),
            attempts: self.attempts,
            last_error: Box::new(error),
        })
    }

    fn fail(&mut self, error: RouterError) -> RetryDecision {
        self.phase = RetryPhase::Failed;
        RetryDecision::Fail(error)
    }
}

pub struct RetryCoordinator {
    dispatcher: Arc<OperationDispatcher>,
    max_retries: u32,
    refresh_timeout: Duration,
}

impl RetryCoordinator {
    pub fn new(
        dispatcher: Arc<OperationDispatcher>,
        max_retries: u32,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            max_retries,
            refresh_timeout,
        }
    }

    pub async fn execute(&self, operation: &Operation) -> Result<Response> {
        self.run(operation).await.1
    }

    /// Drives one operation to completion and returns the final state alongside the result.
    pub async fn run(&self, operation: &Operation) -> (RetryState, Result<Response>) {
        let mut state = RetryState::new(operation.describe(), self.max_retries);

        loop {
            let (target, version) = match self.resolve(operation, &mut state) {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::error!(op = %operation.id, "{}", e);
                    return (state, Err(e));
                }
            };

            state.dispatched(target.clone(), version);
            let request = operation.request(version);

            let error = match self.dispatcher.send(&target, &request, version).await {
                Ok(response) => {
                    state.succeeded();
                    return (state, Ok(response));
                }
                Err(e) => e,
            };

            let decision = match state.failed(error) {
                RetryDecision::RefreshTopology { after_version } => {
                    tracing::debug!(
                        op = %operation.id,
                        address = %target,
                        after_version,
                        "Stale topology, waiting for refresh"
                    );
                    match self
                        .dispatcher
                        .registry()
                        .wait_for_newer(&operation.cache, after_version, self.refresh_timeout)
                        .await
                    {
                        Ok(_) => continue,
                        Err(e) => state.refresh_timed_out(e),
                    }
                }
                decision => decision,
            };

            match decision {
                RetryDecision::RotateOwner => {
                    self.dispatcher.record_retry();
                    tracing::warn!(
                        op = %operation.id,
                        address = %target,
                        attempt = state.attempts(),
                        max_retries = self.max_retries,
                        "Retrying on another server"
                    );
                }
                RetryDecision::Fail(e) => {
                    tracing::error!(op = %operation.id, "{}", e);
                    return (state, Err(e));
                }
                RetryDecision::RefreshTopology { .. } => {}
            }
        }
    }

    /// Picks the next target under one topology snapshot.
    ///
    /// Owners first, then live balancer servers outside the exclusions, then any server at all.
    /// The last step may revisit excluded servers, so only the budget ends an operation that
    /// still has an address to try.
    fn resolve(&self, operation: &Operation, state: &mut RetryState) -> Result<(Address, u64)> {
        let cache = operation.cache.as_str();
        let snapshot = self.dispatcher.registry().get(cache);
        let version = snapshot.as_ref().map_or(0, |t| t.version());

        let mut partition = None;
        if let Some(topology) = snapshot.as_deref().filter(|t| self.dispatcher.routes_by_hash(t))
            && let Some((p, owners)) = route_key(topology, operation.key.as_bytes())
        {
            partition = Some(p);
            let live: Vec<Address> = owners
                .iter()
                .filter(|owner| !self.dispatcher.is_suspected(owner))
                .cloned()
                .collect();
            if let Some(owner) = state.next_owner(&live).or_else(|| state.next_owner(owners)) {
                return Ok((owner, version));
            }
        }

        if let Some(server) = self.dispatcher.next_server(cache, state.excluded()) {
            return Ok((server, version));
        }

        if let Some(server) = self.dispatcher.any_server(cache) {
            if state.take_fallback() {
                tracing::warn!(cache, address = %server, "All servers failed, revisiting them");
            } else {
                tracing::debug!(cache, address = %server, "Revisiting failed server");
            }
            return Ok((server, version));
        }

        Err(RouterError::NoOwnersAvailable { partition })
    }
}
