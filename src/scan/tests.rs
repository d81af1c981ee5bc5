//! Scan Module Tests
//!
//! ## Test Scopes
//! - **SegmentKeyTracker**: One-way completion and per-partition deduplication.
//! - **ScanCoordinator**: Fan-out, failover to the fallback server, cursor release and
//!   cancellation, driven against the in-memory cluster.
//! - **Randomized**: Completeness and monotonic completion under injected failures and
//!   topology changes, with fixed seeds.

#[cfg(test)]
mod tests {
    use crate::config::RouterConfig;
    use crate::dispatch::dispatcher::OperationDispatcher;
    use crate::dispatch::protocol::EntryStatus;
    use crate::error::RouterError;
    use crate::scan::coordinator::{ScanCoordinator, ScanPhase, ScanStream};
    use crate::scan::tracker::SegmentKeyTracker;
    use crate::scan::types::{ScanEntry, ScanOptions, group_batch_size};
    use crate::test_support::{MockCluster, addr, topology};
    use crate::topology::registry::TopologyRegistry;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::time::Duration;

    fn partitions(ids: &[u32]) -> BTreeSet<u32> {
        ids.iter().copied().collect()
    }

    struct Harness {
        cluster: Arc<MockCluster>,
        registry: Arc<TopologyRegistry>,
        scans: ScanCoordinator,
    }

    fn harness(cluster: MockCluster, config: RouterConfig) -> Harness {
        let cluster = Arc::new(cluster);
        let registry = TopologyRegistry::new();
        let dispatcher = Arc::new(OperationDispatcher::new(
            &config,
            registry.clone(),
            cluster.clone(),
        ));
        Harness {
            cluster,
            registry,
            scans: ScanCoordinator::new(dispatcher, &config),
        }
    }

    fn config(servers: &[&str]) -> RouterConfig {
        RouterConfig::default()
            .with_initial_servers(servers.iter().copied())
            .with_request_timeout(Duration::from_millis(500))
            .with_scan_timeout(Some(Duration::from_secs(20)))
    }

    /// Reads a stream to its end, returning the entries and the terminal error, if any.
    async fn drain(mut stream: ScanStream) -> (Vec<ScanEntry>, Option<RouterError>) {
        let mut entries = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    assert!(stream.next().await.is_none(), "Nothing follows a scan error");
                    return (entries, Some(e));
                }
            }
        }
        (entries, None)
    }

    fn keys(entries: &[ScanEntry]) -> Vec<String> {
        let mut keys: Vec<String> = entries.iter().map(|e| e.key.clone()).collect();
        keys.sort();
        keys
    }

    // ============================================================
    // SEGMENT KEY TRACKER
    // ============================================================

    #[test]
    fn test_tracker_suppresses_replayed_keys() {
        let tracker = SegmentKeyTracker::new(partitions(&[0, 1]));

        assert!(tracker.track("k1", EntryStatus::Present, 0));
        assert!(!tracker.track("k1", EntryStatus::Present, 0));
        // Same key in another partition is tracked independently
        assert!(tracker.track("k1", EntryStatus::Present, 1));
    }

    #[test]
    fn test_tracker_finish_is_one_way() {
        let tracker = SegmentKeyTracker::new(partitions(&[0, 1, 2]));
        tracker.track("k", EntryStatus::Present, 1);

        assert_eq!(tracker.mark_finished(&partitions(&[1])), partitions(&[1]));
        assert_eq!(tracker.mark_finished(&partitions(&[1])), BTreeSet::new());
        assert!(tracker.tracked_partitions().is_empty(), "Seen keys dropped on finish");

        // Rediscovery cannot resurrect a finished partition
        tracker.desire(&partitions(&[0, 1, 2, 3]));
        assert_eq!(tracker.missed_partitions(), partitions(&[0, 2, 3]));
        assert!(!tracker.track("late", EntryStatus::Present, 1));
    }

    #[test]
    fn test_tracker_records_but_hides_removed_entries() {
        let tracker = SegmentKeyTracker::new(partitions(&[0]));

        assert!(!tracker.track("gone", EntryStatus::Removed, 0));
        assert!(!tracker.track("gone", EntryStatus::Present, 0));
        assert!(!tracker.track("other", EntryStatus::Present, 7), "Unrequested partition");
    }

    #[test]
    fn test_group_batch_size_rounds_up() {
        assert_eq!(group_batch_size(100, 3), 34);
        assert_eq!(group_batch_size(10, 4), 3);
        assert_eq!(group_batch_size(2, 5), 1);
        assert_eq!(group_batch_size(7, 0), 7);
    }

    // ============================================================
    // SCAN COORDINATOR
    // ============================================================

    #[tokio::test]
    async fn test_owner_dies_mid_partition_and_fallback_deduplicates() {
        // ARRANGE: p0,p1 on A; p2,p3 on B. B delivers k1,k2 of p2 and dies.
        let cluster = MockCluster::new(4, &["A", "B"]);
        cluster.seed_partition("A", 0, "a0", "0");
        cluster.seed_partition("A", 1, "a1", "1");
        for server in ["A", "B"] {
            for key in ["k1", "k2", "k3"] {
                cluster.seed_partition(server, 2, key, "\"p2\"");
            }
            cluster.seed_partition(server, 3, "k4", "\"p3\"");
        }
        cluster.with_server("B", |s| {
            s.max_batch = Some(2);
            s.die_after_batches = Some(1);
        });
        let h = harness(cluster, config(&["A", "B"]));
        h.registry
            .update("books", topology(1, vec![vec!["A"], vec!["A"], vec!["B"], vec!["B"]]));

        // ACT
        let stream = h.scans.scan("books", ScanOptions::default());
        let session = stream.session().clone();
        let (entries, error) = drain(stream).await;

        // ASSERT
        assert!(error.is_none());
        assert_eq!(keys(&entries), vec!["a0", "a1", "k1", "k2", "k3", "k4"]);
        let p2: Vec<&str> = entries
            .iter()
            .filter(|e| e.partition == 2)
            .map(|e| e.key.as_str())
            .collect();
        assert_eq!(p2.len(), 3);

        let starts = h.cluster.scan_starts();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[2], (addr("A"), partitions(&[2, 3]), 100));
        assert!(starts[..2].contains(&(addr("B"), partitions(&[2, 3]), 50)));
        assert_eq!(session.failed_servers(), [addr("B")].into_iter().collect());
        assert_eq!(session.phase(), ScanPhase::Done);
        assert!(session.missed_partitions().is_empty());
        // Every cursor got one end request, the dead server's included
        assert_eq!(h.cluster.scan_end_count(), 3);
    }

    #[tokio::test]
    async fn test_batch_size_is_divided_across_groups() {
        let cluster = MockCluster::new(4, &["A", "B", "C", "D"]);
        let h = harness(cluster, config(&["A"]).with_scan_batch_size(10));
        h.registry.update(
            "books",
            topology(1, vec![vec!["A"], vec!["B"], vec!["C"], vec!["D"]]),
        );

        let (entries, error) = drain(h.scans.scan("books", ScanOptions::default())).await;

        assert!(error.is_none());
        assert!(entries.is_empty());
        let starts = h.cluster.scan_starts();
        assert_eq!(starts.len(), 4);
        assert!(starts.iter().all(|(_, parts, batch)| parts.len() == 1 && *batch == 3));
    }

    #[tokio::test]
    async fn test_subset_filter_and_metadata_reach_the_server() {
        let cluster = MockCluster::new(3, &["A"]);
        for p in 0..3 {
            cluster.seed_partition("A", p, &format!("user:{}", p), "{}");
            cluster.seed_partition("A", p, &format!("order:{}", p), "{}");
        }
        let h = harness(cluster, config(&["A"]));
        h.registry
            .update("books", topology(1, vec![vec!["A"], vec!["A"], vec!["A"]]));

        let options = ScanOptions::default()
            .with_partitions([0, 2])
            .with_filter("user:")
            .with_metadata();
        let entries = h.scans.scan("books", options).collect().await.unwrap();

        assert_eq!(keys(&entries), vec!["user:0", "user:2"]);
        assert!(entries.iter().all(|e| e.metadata.is_some()));
        assert_eq!(h.cluster.scan_starts()[0].1, partitions(&[0, 2]));
    }

    #[tokio::test]
    async fn test_without_topology_server_reports_partitions() {
        // ARRANGE: no topology pushed yet
        let cluster = MockCluster::new(4, &["A"]);
        for i in 0..12 {
            cluster.seed(&["A"], &format!("key-{}", i), "1");
        }
        let h = harness(cluster, config(&["A"]).with_scan_batch_size(5));

        // ACT
        let stream = h.scans.scan("books", ScanOptions::default());
        let session = stream.session().clone();
        let entries = stream.collect().await.unwrap();

        // ASSERT
        assert_eq!(entries.len(), 12);
        assert_eq!(h.cluster.scan_starts()[0].1, BTreeSet::new());
        assert_eq!(session.tracker().finished_partitions(), partitions(&[0, 1, 2, 3]));
    }

    #[tokio::test]
    async fn test_removed_entries_are_not_emitted() {
        let cluster = MockCluster::new(1, &["A"]);
        cluster.seed_partition("A", 0, "live", "1");
        cluster.seed_partition("A", 0, "deleted", "2");
        cluster.with_server("A", |s| {
            s.removed.insert("deleted".to_string());
        });
        let h = harness(cluster, config(&["A"]));
        h.registry.update("books", topology(1, vec![vec!["A"]]));

        let entries = h.scans.scan("books", ScanOptions::default()).collect().await.unwrap();

        assert_eq!(keys(&entries), vec!["live"]);
    }

    #[tokio::test]
    async fn test_lost_iteration_is_restarted_without_end() {
        // ARRANGE: the server forgets the cursor on the first page request
        let cluster = MockCluster::new(1, &["A"]);
        for key in ["x", "y", "z"] {
            cluster.seed_partition("A", 0, key, "1");
        }
        cluster.with_server("A", |s| {
            s.max_batch = Some(1);
            s.forget_iterations = true;
        });
        let h = harness(cluster, config(&["A"]));
        h.registry.update("books", topology(1, vec![vec!["A"]]));

        // ACT
        let entries = h.scans.scan("books", ScanOptions::default()).collect().await.unwrap();

        // ASSERT: "x" is replayed by the second cursor but emitted once
        assert_eq!(keys(&entries), vec!["x", "y", "z"]);
        assert_eq!(h.cluster.scan_starts().len(), 2);
        assert_eq!(h.cluster.scan_end_count(), 1);
        assert_eq!(h.cluster.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_open_cursor_once() {
        let cluster = MockCluster::new(1, &["A"]);
        for i in 0..20 {
            cluster.seed_partition("A", 0, &format!("k{:02}", i), "1");
        }
        cluster.with_server("A", |s| s.max_batch = Some(1));
        let h = harness(cluster, config(&["A"]));
        h.registry.update("books", topology(1, vec![vec!["A"]]));

        let mut stream = h
            .scans
            .scan("books", ScanOptions::default().with_batch_size(1));
        assert!(stream.next().await.unwrap().is_ok());

        stream.cancel();
        stream.cancel();
        stream.close().await;

        assert_eq!(h.cluster.scan_end_count(), 1);
        assert_eq!(h.cluster.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_sends_nothing() {
        let cluster = MockCluster::new(2, &["A"]);
        cluster.seed_partition("A", 1, "k", "1");
        let h = harness(cluster, config(&["A"]));
        h.registry.update("books", topology(1, vec![vec!["A"], vec!["A"]]));

        let mut stream = h.scans.scan("books", ScanOptions::default());
        while let Some(item) = stream.next().await {
            item.unwrap();
        }
        assert_eq!(h.cluster.scan_end_count(), 1);

        stream.cancel();
        stream.cancel();
        stream.close().await;

        assert_eq!(h.cluster.scan_end_count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_cursor() {
        let cluster = MockCluster::new(1, &["A"]);
        for i in 0..20 {
            cluster.seed_partition("A", 0, &format!("k{:02}", i), "1");
        }
        cluster.with_server("A", |s| s.max_batch = Some(1));
        let h = harness(cluster, config(&["A"]));
        h.registry.update("books", topology(1, vec![vec!["A"]]));

        let mut stream = h
            .scans
            .scan("books", ScanOptions::default().with_batch_size(1));
        stream.next().await.unwrap().unwrap();
        drop(stream);

        for _ in 0..50 {
            if h.cluster.scan_end_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.cluster.scan_end_count(), 1);
    }

    #[tokio::test]
    async fn test_scan_aborts_when_every_server_is_down() {
        let cluster = MockCluster::new(2, &["A", "B"]);
        cluster.set_down("A", true);
        cluster.set_down("B", true);
        let h = harness(cluster, config(&["A", "B"]));
        h.registry.update("books", topology(1, vec![vec!["A"], vec!["B"]]));

        let (entries, error) = drain(h.scans.scan("books", ScanOptions::default())).await;

        assert!(entries.is_empty());
        assert_eq!(
            error,
            Some(RouterError::ScanAborted {
                missed: partitions(&[0, 1])
            })
        );
    }

    #[tokio::test]
    async fn test_scan_deadline_stops_a_stuck_scan() {
        // ARRANGE: the owner answers but never serves the partition
        let cluster = MockCluster::new(1, &["A"]);
        cluster.with_server("A", |s| s.owned = Some(BTreeSet::new()));
        let h = harness(
            cluster,
            config(&["A"]).with_scan_timeout(Some(Duration::from_millis(400))),
        );
        h.registry.update("books", topology(1, vec![vec!["A"]]));

        // ACT
        let (_, error) = drain(h.scans.scan("books", ScanOptions::default())).await;

        // ASSERT
        assert_eq!(
            error,
            Some(RouterError::ScanAborted {
                missed: partitions(&[0])
            })
        );
        assert!(h.cluster.scan_starts().len() >= 2);
    }

    #[tokio::test]
    async fn test_application_error_terminates_scan() {
        let cluster = MockCluster::new(1, &["A"]);
        cluster.with_server("A", |s| s.app_error = Some("filter rejected".to_string()));
        let h = harness(cluster, config(&["A"]));
        h.registry.update("books", topology(1, vec![vec!["A"]]));

        let result = h.scans.scan("books", ScanOptions::default()).collect().await;

        assert_eq!(
            result,
            Err(RouterError::Application {
                message: "filter rejected".to_string()
            })
        );
    }

    // ============================================================
    // RANDOMIZED FAILURE INJECTION
    // ============================================================

    #[tokio::test]
    async fn test_randomized_failures_emit_every_key_once() {
        let servers = ["S0", "S1", "S2", "S3"];
        let partition_count = 8u32;

        for seed in 0..6u64 {
            let mut rng = StdRng::seed_from_u64(seed);

            // ARRANGE: full replication; S0 never fails, the others may die mid-scan
            let cluster = MockCluster::new(partition_count, &servers);
            let mut expected = BTreeSet::new();
            for i in 0..60 {
                let key = format!("key-{}", i);
                cluster.seed(&servers, &key, &i.to_string());
                expected.insert(key);
            }
            for server in &servers {
                let max_batch = rng.gen_range(1..6);
                let dies = (*server != "S0" && rng.gen_bool(0.6)).then(|| rng.gen_range(1..5));
                cluster.with_server(server, |s| {
                    s.max_batch = Some(max_batch);
                    s.die_after_batches = dies;
                });
            }

            let random_topology = |version: u64, rng: &mut StdRng| {
                let owners: Vec<Vec<&str>> = (0..partition_count)
                    .map(|_| {
                        let primary = *servers.choose(&mut *rng).unwrap_or(&"S0");
                        if primary == "S0" {
                            vec!["S0", servers[rng.gen_range(1..servers.len())]]
                        } else {
                            vec![primary, "S0"]
                        }
                    })
                    .collect();
                topology(version, owners)
            };

            let h = harness(cluster, config(&servers).with_scan_batch_size(12));
            h.registry.update("books", random_topology(1, &mut rng));

            let pushes: Vec<_> = (2..5u64)
                .map(|version| (rng.gen_range(0..40u64), random_topology(version, &mut rng)))
                .collect();
            let pusher = h.registry.clone();
            tokio::spawn(async move {
                for (delay_ms, topology) in pushes {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    pusher.update("books", topology);
                }
            });

            // ACT
            let mut stream = h.scans.scan("books", ScanOptions::default());
            let session = stream.session().clone();
            let mut emitted = BTreeMap::new();
            let mut finished_seen = BTreeSet::new();
            while let Some(item) = stream.next().await {
                let entry = item.unwrap_or_else(|e| panic!("seed {}: {}", seed, e));
                let previous = emitted.insert(entry.key.clone(), entry.partition);
                assert!(previous.is_none(), "seed {}: {} emitted twice", seed, entry.key);

                let finished = session.tracker().finished_partitions();
                assert!(finished.is_superset(&finished_seen), "seed {}: partition unfinished", seed);
                finished_seen = finished;
            }

            // ASSERT
            let emitted_keys: BTreeSet<String> = emitted.into_keys().collect();
            assert_eq!(emitted_keys, expected, "seed {}", seed);
            assert_eq!(
                session.tracker().finished_partitions(),
                (0..partition_count).collect::<BTreeSet<u32>>()
            );
        }
    }

    #[tokio::test]
    async fn test_concurrent_scans_are_independent() {
        let cluster = MockCluster::new(2, &["A"]);
        for i in 0..10 {
            cluster.seed(&["A"], &format!("k{}", i), "1");
        }
        let h = harness(cluster, config(&["A"]).with_scan_batch_size(3));
        h.registry.update("books", topology(1, vec![vec!["A"], vec!["A"]]));

        let first = h.scans.scan("books", ScanOptions::default());
        let second = h.scans.scan("books", ScanOptions::default());
        let (a, b) = tokio::join!(first.collect(), second.collect());

        assert_eq!(a.unwrap().len(), 10);
        assert_eq!(b.unwrap().len(), 10);
    }
}
