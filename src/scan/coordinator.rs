//! Scan Coordinator
//!
//! Runs a full iteration of a cache as a loop of planning cycles:
//!
//! ```text
//! PLANNING -> DISPATCHING -> AWAITING_MORE -> PLANNING ... -> DONE
//! ```
//!
//! Each cycle groups the partitions still desired by primary owner, opens one sub-session per
//! group and waits for all of them. Sub-sessions run as their own tasks and push entries into
//! a bounded channel read through `ScanStream`. Partitions a failed sub-session did not confirm
//! stay desired and are planned again, on the fallback server when their owner has failed.

use dashmap::DashSet;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::tracker::SegmentKeyTracker;
use super::types::{ScanEntry, ScanOptions, SubSession, SubSessionOutcome, group_batch_size};
use crate::config::RouterConfig;
use crate::dispatch::dispatcher::OperationDispatcher;
use crate::dispatch::protocol::{Request, Response, ScanBatch};
use crate::error::{Result, RouterError};
use crate::topology::partition::group_partitions_by_owner;
use crate::topology::types::{Address, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Planning,
    Dispatching,
    AwaitingMore,
    Done,
}

/// Shared state of one scan, mutated concurrently by its sub-session tasks.
pub struct ScanSession {
    pub id: Uuid,
    pub cache: String,
    options: ScanOptions,
    batch_size: usize,
    tracker: SegmentKeyTracker,
    failed_servers: DashSet<Address>,
    /// False until a server reports the partition set, when no topology gave it up front.
    universe_known: AtomicBool,
    phase: Mutex<ScanPhase>,
}

impl ScanSession {
    pub fn tracker(&self) -> &SegmentKeyTracker {
        &self.tracker
    }

    pub fn missed_partitions(&self) -> BTreeSet<u32> {
        self.tracker.missed_partitions()
    }

    pub fn failed_servers(&self) -> BTreeSet<Address> {
        self.failed_servers.iter().map(|a| a.key().clone()).collect()
    }

    pub fn phase(&self) -> ScanPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_complete(&self) -> bool {
        self.universe_known.load(Ordering::Acquire) && self.tracker.is_complete()
    }

    fn set_phase(&self, phase: ScanPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
        tracing::trace!(scan = %self.id, ?phase, "Scan phase");
    }

    fn discover(&self, partitions: &BTreeSet<u32>) {
        if !self.universe_known.swap(true, Ordering::AcqRel) {
            self.tracker.desire(partitions);
            tracing::debug!(scan = %self.id, partitions = partitions.len(), "Discovered partition set");
        }
    }
}

pub struct ScanCoordinator {
    dispatcher: Arc<OperationDispatcher>,
    batch_size: usize,
    scan_timeout: Option<Duration>,
}

impl ScanCoordinator {
    pub fn new(dispatcher: Arc<OperationDispatcher>, config: &RouterConfig) -> Self {
        Self {
            dispatcher,
            batch_size: config.scan_batch_size,
            scan_timeout: config.scan_timeout,
        }
    }

    /// Starts iterating a cache. Must be called within a Tokio runtime.
    pub fn scan(&self, cache: &str, options: ScanOptions) -> ScanStream {
        let universe = options.partitions.clone().or_else(|| {
            self.dispatcher
                .routing_topology(cache)
                .map(|topology| topology.all_partitions())
        });
        let batch_size = options.batch_size.unwrap_or(self.batch_size).max(1);

        let session = Arc::new(ScanSession {
            id: Uuid::new_v4(),
            cache: cache.to_string(),
            options,
            batch_size,
            universe_known: AtomicBool::new(universe.is_some()),
            tracker: SegmentKeyTracker::new(universe.unwrap_or_default()),
            failed_servers: DashSet::new(),
            phase: Mutex::new(ScanPhase::Planning),
        });
        tracing::info!(
            scan = %session.id,
            cache,
            partitions = session.missed_partitions().len(),
            batch_size,
            "Starting scan"
        );

        let (tx, rx) = mpsc::channel(batch_size);
        let (cancel, cancel_rx) = watch::channel(false);
        let driver = Arc::new(ScanDriver {
            dispatcher: self.dispatcher.clone(),
            session: session.clone(),
            tx,
            stop: watch::channel(false).0,
            scan_timeout: self.scan_timeout,
        });
        let handle = tokio::spawn(driver.run(cancel_rx));

        ScanStream {
            session,
            rx,
            cancel,
            driver: Some(handle),
        }
    }
}

/// Consumer end of a scan.
///
/// Yields entries until the scan completes (`None`) or aborts (an `Err`, then `None`).
/// Dropping the stream cancels the scan; open server cursors are still released.
pub struct ScanStream {
    session: Arc<ScanSession>,
    rx: mpsc::Receiver<Result<ScanEntry>>,
    cancel: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl ScanStream {
    pub fn session(&self) -> &Arc<ScanSession> {
        &self.session
    }

    pub async fn next(&mut self) -> Option<Result<ScanEntry>> {
        self.rx.recv().await
    }

    /// Stops the scan. Safe to call repeatedly and after completion.
    pub fn cancel(&self) {
        self.cancel.send_if_modified(|cancelled| !std::mem::replace(cancelled, true));
    }

    /// Cancels and waits until every open cursor has been released.
    pub async fn close(mut self) {
        self.cancel();
        if let Some(driver) = self.driver.take()
            && let Err(e) = driver.await
        {
            tracing::error!(scan = %self.session.id, "Scan driver failed: {}", e);
        }
    }

    /// Drains the scan, failing on the first error.
    pub async fn collect(mut self) -> Result<Vec<ScanEntry>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await {
            entries.push(entry?);
        }
        Ok(entries)
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct ScanDriver {
    dispatcher: Arc<OperationDispatcher>,
    session: Arc<ScanSession>,
    tx: mpsc::Sender<Result<ScanEntry>>,
    /// Tells running sub-sessions to wind down.
    stop: watch::Sender<bool>,
    scan_timeout: Option<Duration>,
}

impl ScanDriver {
    async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let session = &self.session;
        match self.drive(&mut cancel).await {
            Ok(()) => {
                session.set_phase(ScanPhase::Done);
                tracing::info!(
                    scan = %session.id,
                    cache = %session.cache,
                    partitions = session.tracker.finished_count(),
                    "Scan complete"
                );
            }
            Err(RouterError::Cancelled) => {
                tracing::debug!(scan = %session.id, "Scan cancelled");
            }
            Err(e) => {
                tracing::error!(scan = %session.id, cache = %session.cache, "Scan failed: {}", e);
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }

    async fn drive(self: &Arc<Self>, cancel: &mut watch::Receiver<bool>) -> Result<()> {
        let session = &self.session;
        let started = Instant::now();
        let mut delay_ms = 150u64;

        loop {
            if session.is_complete() {
                return Ok(());
            }
            if is_cancelled(cancel) || self.tx.is_closed() {
                return Err(RouterError::Cancelled);
            }
            if let Some(limit) = self.scan_timeout
                && started.elapsed() >= limit
            {
                tracing::warn!(scan = %session.id, "Scan deadline exceeded");
                return Err(self.aborted());
            }

            session.set_phase(ScanPhase::Planning);
            let plan = self.plan();
            if plan.is_empty() {
                tracing::warn!(scan = %session.id, cache = %session.cache, "No server to scan from");
                return Err(self.aborted());
            }

            session.set_phase(ScanPhase::Dispatching);
            let finished_before = session.tracker.finished_count();
            let known_before = session.universe_known.load(Ordering::Acquire);
            let mut tasks = JoinSet::new();
            for sub in plan {
                let driver = self.clone();
                tasks.spawn(async move { driver.run_subsession(sub).await });
            }

            session.set_phase(ScanPhase::AwaitingMore);
            let mut fatal = None;
            let mut cancelled = false;
            loop {
                tokio::select! {
                    joined = tasks.join_next() => match joined {
                        None => break,
                        Some(Ok(SubSessionOutcome::Fatal(e))) => {
                            if fatal.is_none() {
                                fatal = Some(e);
                                self.stop.send_replace(true);
                            }
                        }
                        Some(Ok(SubSessionOutcome::Cancelled)) => {
                            cancelled = true;
                            self.stop.send_replace(true);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!(scan = %session.id, "Sub-session task failed: {}", e);
                        }
                    },
                    _ = cancel.changed(), if !cancelled => {
                        cancelled = true;
                        self.stop.send_replace(true);
                    }
                }
            }

            if let Some(e) = fatal {
                return Err(e);
            }
            if cancelled {
                return Err(RouterError::Cancelled);
            }
            if session.is_complete() {
                continue;
            }

            let progressed = session.tracker.finished_count() > finished_before
                || (!known_before && session.universe_known.load(Ordering::Acquire));
            if progressed {
                delay_ms = 150;
                continue;
            }
            if self.all_servers_failed() {
                tracing::warn!(
                    scan = %session.id,
                    failed = session.failed_servers.len(),
                    "Every server failed without progress"
                );
                return Err(self.aborted());
            }

            let jitter = rand::random::<u64>() % 50;
            tracing::debug!(
                scan = %session.id,
                missed = session.tracker.missed_partitions().len(),
                delay_ms,
                "No progress, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms + jitter)) => {}
                _ = cancel.changed() => return Err(RouterError::Cancelled),
            }
            delay_ms = (delay_ms * 2).min(1200);
        }
    }

    /// Groups the residual partitions into sub-sessions.
    ///
    /// Partitions of failed or unknown owners form the fallback group, sent to a server the
    /// balancer picks outside the failed set, or to any server at all once per cycle.
    fn plan(&self) -> Vec<SubSession> {
        let session = &self.session;
        let cache = session.cache.as_str();
        let failed: HashSet<Address> = session.failed_servers().into_iter().collect();
        let discovering = !session.universe_known.load(Ordering::Acquire);

        let mut groups: HashMap<Address, BTreeSet<u32>> = HashMap::new();
        let mut fallback = BTreeSet::new();
        if !discovering {
            let topology = self.dispatcher.routing_topology(cache);
            let residual = session.tracker.missed_partitions();
            for (target, partitions) in group_partitions_by_owner(topology.as_deref(), &residual) {
                match target {
                    Target::Server(owner) if !failed.contains(&owner) => {
                        groups.entry(owner).or_default().extend(partitions)
                    }
                    _ => fallback.extend(partitions),
                }
            }
        }

        if discovering || !fallback.is_empty() {
            let server = self.dispatcher.next_server(cache, &failed).or_else(|| {
                let any = self.dispatcher.any_server(cache);
                if let Some(address) = &any {
                    tracing::warn!(scan = %session.id, %address, "All servers failed, falling back once");
                }
                any
            });
            if let Some(address) = server {
                groups.entry(address).or_default().extend(fallback);
            }
        }

        let per_group = group_batch_size(session.batch_size, groups.len());
        groups
            .into_iter()
            .map(|(address, partitions)| SubSession::new(address, partitions, per_group))
            .collect()
    }

    async fn run_subsession(self: Arc<Self>, mut sub: SubSession) -> SubSessionOutcome {
        let session = &self.session;
        let mut stop = self.stop.subscribe();
        tracing::debug!(
            scan = %session.id,
            address = %sub.address,
            partitions = sub.requested.len(),
            batch_size = sub.batch_size,
            "Opening sub-session"
        );

        let outcome = self.page_through(&mut sub, &mut stop).await;
        if matches!(outcome, SubSessionOutcome::Failed) {
            session.failed_servers.insert(sub.address.clone());
        }
        self.end(&mut sub).await;
        outcome
    }

    async fn page_through(
        &self,
        sub: &mut SubSession,
        stop: &mut watch::Receiver<bool>,
    ) -> SubSessionOutcome {
        let session = &self.session;
        let version = self.dispatcher.registry().version(&session.cache);
        let start = Request::ScanStart {
            cache: session.cache.clone(),
            partitions: sub.requested.clone(),
            batch_size: sub.batch_size,
            filter: session.options.filter.clone(),
            include_metadata: session.options.include_metadata,
        };

        let mut batch = match self.dispatcher.send(&sub.address, &start, version).await {
            Ok(Response::ScanStarted {
                token,
                batch,
                remaining_partitions,
            }) => {
                session.failed_servers.remove(&sub.address);
                sub.token = Some(token);
                if sub.requested.is_empty() {
                    session.discover(&remaining_partitions);
                }
                sub.open = remaining_partitions;
                batch
            }
            Ok(other) => return unexpected("scan start", other),
            Err(e) => return self.classify(sub, e),
        };

        loop {
            if *stop.borrow() {
                return SubSessionOutcome::Cancelled;
            }
            if !self.deliver(sub, &batch, stop).await {
                return SubSessionOutcome::Cancelled;
            }
            if sub.open.is_empty() || batch.is_exhausted() {
                return SubSessionOutcome::Completed;
            }

            let Some(token) = sub.token.clone() else {
                return SubSessionOutcome::Abandoned;
            };
            let next = Request::ScanNext {
                cache: session.cache.clone(),
                token,
            };
            batch = match self.dispatcher.send(&sub.address, &next, version).await {
                Ok(Response::ScanPage { batch }) => batch,
                Ok(other) => return unexpected("scan next", other),
                Err(e) => return self.classify(sub, e),
            };
        }
    }

    /// Emits the new entries of a page, then records its finished partitions.
    /// Returns false once the scan is being torn down.
    async fn deliver(
        &self,
        sub: &mut SubSession,
        batch: &ScanBatch,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        let tracker = &self.session.tracker;
        for entry in &batch.entries {
            if !tracker.track(&entry.key, entry.status, entry.partition) {
                continue;
            }
            let item = ScanEntry {
                key: entry.key.clone(),
                value_json: entry.value_json.clone(),
                partition: entry.partition,
                metadata: entry.metadata.clone(),
            };
            tokio::select! {
                sent = self.tx.send(Ok(item)) => {
                    if sent.is_err() {
                        return false;
                    }
                }
                _ = stop.changed() => return false,
            }
        }

        let finished = tracker.mark_finished(&batch.finished_partitions);
        for partition in &batch.finished_partitions {
            sub.open.remove(partition);
        }
        tracing::trace!(
            scan = %self.session.id,
            address = %sub.address,
            entries = batch.entries.len(),
            ?finished,
            "Scan page"
        );
        true
    }

    fn classify(&self, sub: &mut SubSession, error: RouterError) -> SubSessionOutcome {
        let scan = self.session.id;
        match error {
            RouterError::Unreachable { .. } | RouterError::Timeout { .. } => {
                tracing::warn!(
                    %scan,
                    address = %sub.address,
                    unconfirmed = ?sub.open,
                    "Sub-session failed: {}",
                    error
                );
                SubSessionOutcome::Failed
            }
            RouterError::InvalidIteration { .. } => {
                tracing::warn!(%scan, address = %sub.address, "Server lost the iteration: {}", error);
                sub.token = None;
                SubSessionOutcome::Abandoned
            }
            RouterError::TopologyStale { .. } => {
                tracing::debug!(%scan, address = %sub.address, "Server left the topology mid-scan");
                SubSessionOutcome::Abandoned
            }
            other => SubSessionOutcome::Fatal(other),
        }
    }

    /// Releases the server cursor, at most once per sub-session.
    async fn end(&self, sub: &mut SubSession) {
        let Some(token) = sub.token.take() else {
            return;
        };
        let session = &self.session;
        let request = Request::ScanEnd {
            cache: session.cache.clone(),
            token: token.clone(),
        };
        let version = self.dispatcher.registry().version(&session.cache);
        match self.dispatcher.send(&sub.address, &request, version).await {
            Ok(_) => tracing::debug!(scan = %session.id, address = %sub.address, "Released cursor {}", token),
            Err(e) => tracing::warn!(
                scan = %session.id,
                address = %sub.address,
                "Could not release cursor {}: {}",
                token,
                e
            ),
        }
    }

    fn all_servers_failed(&self) -> bool {
        let servers = self.dispatcher.servers(&self.session.cache);
        !servers.is_empty()
            && servers
                .iter()
                .all(|server| self.session.failed_servers.contains(server))
    }

    fn aborted(&self) -> RouterError {
        RouterError::ScanAborted {
            missed: self.session.tracker.missed_partitions(),
        }
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    cancel.has_changed().unwrap_or(true) || *cancel.borrow()
}

fn unexpected(step: &str, response: Response) -> SubSessionOutcome {
    SubSessionOutcome::Fatal(RouterError::Serialization(format!(
        "unexpected response to {}: {:?}",
        step, response
    )))
}
