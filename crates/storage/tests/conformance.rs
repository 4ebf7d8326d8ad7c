//! Conformance test suite for `MemoryVisitStore`.
//!
//! Each test function corresponds to a single conformance check, providing
//! fine-grained failure reporting.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use visitstat_storage::{MemoryVisitStore, conformance};

// ============================================================================
// Partitions
// ============================================================================

#[tokio::test]
async fn missing_partition_reads_empty() {
    conformance::missing_partition_reads_empty(&MemoryVisitStore::new()).await;
}

#[tokio::test]
async fn insert_creates_partitions_listed_in_order() {
    conformance::insert_creates_partitions_listed_in_order(&MemoryVisitStore::new()).await;
}

// ============================================================================
// Counting
// ============================================================================

#[tokio::test]
async fn count_distinguishes_pv_and_uv() {
    conformance::count_distinguishes_pv_and_uv(&MemoryVisitStore::new()).await;
}

#[tokio::test]
async fn count_is_scoped_to_partition_and_path() {
    conformance::count_is_scoped_to_partition_and_path(&MemoryVisitStore::new()).await;
}

// ============================================================================
// Grouping
// ============================================================================

#[tokio::test]
async fn group_by_path_client_groups_and_orders() {
    conformance::group_by_path_client_groups_and_orders(&MemoryVisitStore::new()).await;
}

#[tokio::test]
async fn group_by_path_client_respects_since() {
    conformance::group_by_path_client_respects_since(&MemoryVisitStore::new()).await;
}

#[tokio::test]
async fn daily_counts_bucket_by_day() {
    conformance::daily_counts_bucket_by_day(&MemoryVisitStore::new()).await;
}

#[tokio::test]
async fn path_totals_cover_every_group() {
    conformance::path_totals_cover_every_group(&MemoryVisitStore::new()).await;
}

// ============================================================================
// Cleanup
// ============================================================================

#[tokio::test]
async fn delete_group_below_threshold_semantics() {
    conformance::delete_group_below_threshold_semantics(&MemoryVisitStore::new()).await;
}

#[tokio::test]
async fn delete_group_below_is_partition_scoped() {
    conformance::delete_group_below_is_partition_scoped(&MemoryVisitStore::new()).await;
}

#[tokio::test]
async fn delete_group_below_rechecks_current_count() {
    conformance::delete_group_below_rechecks_current_count(&MemoryVisitStore::new()).await;
}

// ============================================================================
// Indexes
// ============================================================================

#[tokio::test]
async fn ensure_indexes_is_idempotent() {
    conformance::ensure_indexes_is_idempotent(&MemoryVisitStore::new()).await;
}

#[tokio::test]
async fn ensure_indexes_on_empty_partition() {
    conformance::ensure_indexes_on_empty_partition(&MemoryVisitStore::new()).await;
}

// ============================================================================
// Health and concurrency
// ============================================================================

#[tokio::test]
async fn health_check_is_available() {
    conformance::health_check_is_available(&MemoryVisitStore::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_are_all_persisted() {
    conformance::concurrent_inserts_are_all_persisted(Arc::new(MemoryVisitStore::new())).await;
}
