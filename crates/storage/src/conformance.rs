//! Conformance test suite for [`VisitStore`] implementations.
//!
//! Every backend runs the same set of async checks so the engine can treat
//! them interchangeably. Each function takes a fresh, empty store and
//! panics on a contract violation.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call each conformance function with
//! a fresh store instance:
//!
//! ```no_run
//! use visitstat_storage::{MemoryVisitStore, conformance};
//!
//! #[tokio::test]
//! async fn missing_partition_reads_empty() {
//!     conformance::missing_partition_reads_empty(&MemoryVisitStore::new()).await;
//! }
//! ```
//!
//! # Test Categories
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | Partitions | Implicit creation, sorted listing, empty reads |
//! | Counting | PV, distinct-client UV, page vs site scope |
//! | Grouping | `(path, client)` groups, time windows, daily buckets |
//! | Cleanup | Threshold semantics, atomic re-check, isolation |
//! | Indexes | Idempotent creation, counts unchanged after indexing |
//! | Concurrency | Parallel inserts are all persisted |

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use crate::{
    backend::VisitStore,
    health::HealthProbe,
    testutil::{insert_spread, visit_at},
    types::{Partition, VisitCount},
};

fn base_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).single().expect("valid timestamp")
}

// ============================================================================
// Partitions
// ============================================================================

/// Reading a partition that was never written yields zeros and empty rows.
pub async fn missing_partition_reads_empty<S: VisitStore>(store: &S) {
    let ghost = Partition::from("never-written.example");
    assert_eq!(store.count(&ghost, None).await.expect("count"), VisitCount::default());
    assert_eq!(store.count(&ghost, Some("/")).await.expect("count page"), VisitCount::default());
    assert!(store.group_by_path_client(&ghost, None).await.expect("group").is_empty());
    assert!(store.daily_counts(&ghost, None).await.expect("daily").is_empty());
    assert_eq!(store.delete_group_below(&ghost, "/", 10).await.expect("delete"), 0);
}

/// The first insert creates the partition; listing is sorted and deduplicated.
pub async fn insert_creates_partitions_listed_in_order<S: VisitStore>(store: &S) {
    assert!(store.list_partitions().await.expect("list").is_empty());

    for partition in ["b.example", "a.example", "b.example", "c.example:8080"] {
        store.insert(&visit_at(partition, "/", "10.0.0.1", base_time())).await.expect("insert");
    }

    let partitions = store.list_partitions().await.expect("list");
    assert_eq!(
        partitions,
        vec![Partition::from("a.example"), Partition::from("b.example"), Partition::from("c.example:8080")]
    );
}

// ============================================================================
// Counting
// ============================================================================

/// `pv` counts visits, `uv` counts distinct client addresses.
pub async fn count_distinguishes_pv_and_uv<S: VisitStore>(store: &S) {
    for client in ["1.1.1.1", "1.1.1.1", "1.1.1.1", "2.2.2.2"] {
        store.insert(&visit_at("site", "/post", client, base_time())).await.expect("insert");
    }
    store.insert(&visit_at("site", "/about", "3.3.3.3", base_time())).await.expect("insert");

    let partition = Partition::from("site");
    let page = store.count(&partition, Some("/post")).await.expect("count page");
    assert_eq!(page, VisitCount { pv: 4, uv: 2 });

    let site = store.count(&partition, None).await.expect("count site");
    assert_eq!(site, VisitCount { pv: 5, uv: 3 });
}

/// Page counts match the path exactly; other partitions never leak in.
pub async fn count_is_scoped_to_partition_and_path<S: VisitStore>(store: &S) {
    store.insert(&visit_at("one", "/a", "1", base_time())).await.expect("insert");
    store.insert(&visit_at("one", "/a/b", "1", base_time())).await.expect("insert");
    store.insert(&visit_at("two", "/a", "1", base_time())).await.expect("insert");

    let one = Partition::from("one");
    assert_eq!(store.count(&one, Some("/a")).await.expect("count"), VisitCount { pv: 1, uv: 1 });
    assert_eq!(store.count(&one, Some("/missing")).await.expect("count"), VisitCount::default());
    assert_eq!(store.count(&Partition::from("two"), None).await.expect("count").pv, 1);
}

// ============================================================================
// Grouping
// ============================================================================

/// Groups are keyed by `(path, client)` and ordered by that key.
pub async fn group_by_path_client_groups_and_orders<S: VisitStore>(store: &S) {
    for (path, client) in [("/b", "2"), ("/a", "1"), ("/b", "1"), ("/a", "1")] {
        store.insert(&visit_at("site", path, client, base_time())).await.expect("insert");
    }

    let groups = store.group_by_path_client(&Partition::from("site"), None).await.expect("group");
    let flat: Vec<_> = groups.iter().map(|g| (g.path.as_str(), g.client_address.as_str(), g.visits)).collect();
    assert_eq!(flat, vec![("/a", "1", 2), ("/b", "1", 1), ("/b", "2", 1)]);
}

/// `since` keeps visits at or after the bound and drops earlier ones.
pub async fn group_by_path_client_respects_since<S: VisitStore>(store: &S) {
    let t = base_time();
    store.insert(&visit_at("site", "/old", "1", t - ChronoDuration::days(31))).await.expect("insert");
    store.insert(&visit_at("site", "/edge", "1", t - ChronoDuration::days(30))).await.expect("insert");
    store.insert(&visit_at("site", "/new", "1", t)).await.expect("insert");

    let partition = Partition::from("site");
    let windowed = store
        .group_by_path_client(&partition, Some(t - ChronoDuration::days(30)))
        .await
        .expect("group windowed");
    let paths: Vec<_> = windowed.iter().map(|g| g.path.as_str()).collect();
    assert_eq!(paths, vec!["/edge", "/new"]);

    let all = store.group_by_path_client(&partition, None).await.expect("group all");
    assert_eq!(all.len(), 3);
}

/// Daily counts bucket by UTC day in ascending order.
pub async fn daily_counts_bucket_by_day<S: VisitStore>(store: &S) {
    let t = base_time();
    let yesterday = t - ChronoDuration::days(1);
    for (client, at) in [("1", yesterday), ("2", yesterday), ("2", yesterday), ("1", t)] {
        store.insert(&visit_at("site", "/", client, at)).await.expect("insert");
    }

    let days = store.daily_counts(&Partition::from("site"), None).await.expect("daily");
    assert_eq!(days.len(), 2);
    assert_eq!((days[0].date, days[0].pv, days[0].uv), (yesterday.date_naive(), 3, 2));
    assert_eq!((days[1].date, days[1].pv, days[1].uv), (t.date_naive(), 1, 1));

    let recent = store.daily_counts(&Partition::from("site"), Some(t)).await.expect("daily windowed");
    assert_eq!(recent.len(), 1);
}

/// `path_totals` reports every `(partition, path)` group.
pub async fn path_totals_cover_every_group<S: VisitStore>(store: &S) {
    insert_spread(store, "a.example", "/x", 3).await;
    insert_spread(store, "a.example", "/y", 1).await;
    insert_spread(store, "b.example", "/x", 2).await;

    let mut totals: Vec<_> = store
        .path_totals()
        .await
        .expect("totals")
        .into_iter()
        .map(|t| (t.partition.into_inner(), t.path, t.visits))
        .collect();
    totals.sort();
    assert_eq!(
        totals,
        vec![
            ("a.example".to_owned(), "/x".to_owned(), 3),
            ("a.example".to_owned(), "/y".to_owned(), 1),
            ("b.example".to_owned(), "/x".to_owned(), 2),
        ]
    );
}

// ============================================================================
// Cleanup
// ============================================================================

/// Groups below the threshold are deleted entirely; groups at it are kept.
pub async fn delete_group_below_threshold_semantics<S: VisitStore>(store: &S) {
    insert_spread(store, "site", "/small", 9).await;
    insert_spread(store, "site", "/exact", 10).await;

    let partition = Partition::from("site");
    assert_eq!(store.delete_group_below(&partition, "/exact", 10).await.expect("delete"), 0);
    assert_eq!(store.delete_group_below(&partition, "/small", 10).await.expect("delete"), 9);
    assert_eq!(store.count(&partition, Some("/small")).await.expect("count").pv, 0);
    assert_eq!(store.count(&partition, Some("/exact")).await.expect("count").pv, 10);

    // Deleting again is a no-op.
    assert_eq!(store.delete_group_below(&partition, "/small", 10).await.expect("delete"), 0);
}

/// Deleting a group leaves the same path in other partitions alone.
pub async fn delete_group_below_is_partition_scoped<S: VisitStore>(store: &S) {
    insert_spread(store, "a.example", "/", 2).await;
    insert_spread(store, "b.example", "/", 2).await;

    assert_eq!(store.delete_group_below(&Partition::from("a.example"), "/", 10).await.expect("delete"), 2);
    assert_eq!(store.count(&Partition::from("b.example"), Some("/")).await.expect("count").pv, 2);
}

/// The threshold is re-checked at delete time against current data.
pub async fn delete_group_below_rechecks_current_count<S: VisitStore>(store: &S) {
    insert_spread(store, "site", "/grow", 3).await;
    let snapshot = store.path_totals().await.expect("totals");
    assert_eq!(snapshot[0].visits, 3);

    // The group grows past the threshold after the scan.
    insert_spread(store, "site", "/grow", 7).await;

    assert_eq!(store.delete_group_below(&Partition::from("site"), "/grow", 10).await.expect("delete"), 0);
    assert_eq!(store.count(&Partition::from("site"), Some("/grow")).await.expect("count").pv, 10);
}

// ============================================================================
// Indexes
// ============================================================================

/// `ensure_indexes` is idempotent and does not change query results.
pub async fn ensure_indexes_is_idempotent<S: VisitStore>(store: &S) {
    for (path, client) in [("/a", "1"), ("/a", "2"), ("/b", "1")] {
        store.insert(&visit_at("site", path, client, base_time())).await.expect("insert");
    }
    let partition = Partition::from("site");
    let before = store.group_by_path_client(&partition, None).await.expect("group");

    store.ensure_indexes(&partition).await.expect("first ensure");
    store.ensure_indexes(&partition).await.expect("second ensure");

    assert_eq!(store.group_by_path_client(&partition, None).await.expect("group"), before);
    assert_eq!(store.count(&partition, Some("/a")).await.expect("count"), VisitCount { pv: 2, uv: 2 });

    store.insert(&visit_at("site", "/a", "3", base_time())).await.expect("insert after index");
    assert_eq!(store.count(&partition, None).await.expect("count"), VisitCount { pv: 4, uv: 3 });
}

/// `ensure_indexes` on a partition without visits succeeds.
pub async fn ensure_indexes_on_empty_partition<S: VisitStore>(store: &S) {
    let partition = Partition::from("fresh.example");
    store.ensure_indexes(&partition).await.expect("ensure");
    assert_eq!(store.count(&partition, None).await.expect("count"), VisitCount::default());
}

// ============================================================================
// Health and concurrency
// ============================================================================

/// A reachable store reports itself available on every probe.
pub async fn health_check_is_available<S: VisitStore>(store: &S) {
    for probe in [HealthProbe::Liveness, HealthProbe::Readiness, HealthProbe::Startup] {
        let status = store.health_check(probe).await.expect("health");
        assert!(status.is_available(), "{probe} probe reported {status}");
    }
}

/// Concurrent inserts from many tasks are all persisted.
pub async fn concurrent_inserts_are_all_persisted<S: VisitStore + 'static>(store: Arc<S>) {
    let mut tasks = tokio::task::JoinSet::new();
    for task in 0..8 {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            for i in 0..25 {
                let visit = visit_at("site", &format!("/p{}", i % 5), &format!("t{task}"), base_time());
                store.insert(&visit).await.expect("insert");
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task panicked");
    }

    let site = store.count(&Partition::from("site"), None).await.expect("count");
    assert_eq!(site, VisitCount { pv: 200, uv: 8 });
}
