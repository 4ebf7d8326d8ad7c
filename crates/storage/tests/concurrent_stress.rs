//! Concurrent access stress tests for `MemoryVisitStore`.
//!
//! These tests exercise the store under multi-threaded ingestion while
//! cleanup and index creation run alongside, to detect lost inserts and
//! inconsistent indexes. The heavier ones are ignored by default:
//!
//! ```bash
//! cargo test -p visitstat-storage --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use chrono::Utc;
use tokio::task::JoinSet;
use visitstat_storage::{MemoryVisitStore, Partition, VisitCount, VisitStore, testutil::visit_at};

/// Number of concurrent writer tasks.
const CONCURRENCY: usize = 16;

/// Number of inserts each writer performs.
const OPS_PER_TASK: usize = 100;

// ---------------------------------------------------------------------------
// Test: index creation racing with writers
// ---------------------------------------------------------------------------

/// Writers keep inserting while `ensure_indexes` runs; indexed counts must
/// equal a full scan afterwards.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ensure_indexes_during_ingestion_keeps_counts_exact() {
    let store = MemoryVisitStore::new();
    let partition = Partition::from("busy.example");
    let mut tasks = JoinSet::new();

    for task in 0..CONCURRENCY {
        let store = store.clone();
        tasks.spawn(async move {
            for i in 0..OPS_PER_TASK {
                let visit = visit_at("busy.example", &format!("/p{}", i % 4), &format!("c{task}"), Utc::now());
                store.insert(&visit).await.expect("insert");
            }
        });
    }
    {
        let store = store.clone();
        let partition = partition.clone();
        tasks.spawn(async move {
            store.ensure_indexes(&partition).await.expect("ensure");
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task panicked");
    }

    let total = (CONCURRENCY * OPS_PER_TASK) as u64;
    assert_eq!(store.count(&partition, None).await.expect("count"), VisitCount { pv: total, uv: CONCURRENCY as u64 });
    for p in 0..4 {
        let page = store.count(&partition, Some(&format!("/p{p}"))).await.expect("count page");
        assert_eq!(page, VisitCount { pv: total / 4, uv: CONCURRENCY as u64 });
    }
}

// ---------------------------------------------------------------------------
// Test: cleanup racing with ingestion
// ---------------------------------------------------------------------------

/// A hot path keeps receiving visits while cleanup repeatedly targets it.
/// Every delete either removes a group that was below the threshold at the
/// time, or nothing. Visits are never half-deleted.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Run with --ignored
async fn cleanup_racing_with_ingestion_never_splits_a_group() {
    let store = MemoryVisitStore::new();
    let partition = Partition::from("race.example");
    let mut writers = JoinSet::new();

    for task in 0..CONCURRENCY {
        let store = store.clone();
        writers.spawn(async move {
            for _ in 0..OPS_PER_TASK {
                let visit = visit_at("race.example", "/hot", &format!("c{task}"), Utc::now());
                store.insert(&visit).await.expect("insert");
                tokio::task::yield_now().await;
            }
        });
    }

    let mut deleted = 0;
    for _ in 0..200 {
        deleted += store.delete_group_below(&partition, "/hot", 10).await.expect("delete");
        tokio::task::yield_now().await;
    }
    while let Some(joined) = writers.join_next().await {
        joined.expect("task panicked");
    }

    let remaining = store.count(&partition, Some("/hot")).await.expect("count").pv;
    assert_eq!(remaining + deleted, (CONCURRENCY * OPS_PER_TASK) as u64);
}
