//! End-to-end behavior of the assembled engine over the in-memory store.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use proptest::prelude::*;
use visitstat_engine::{
    AllowList, EngineConfig, Partition, ReadinessConfig, ReadinessState, Scope, StatRow, VisitRequest, VisitStats,
    Window,
};
use visitstat_storage::{
    MemoryVisitStore, VisitStore,
    testutil::{FlakyStore, visit_days_ago},
};

fn stats<S: VisitStore + 'static>(store: S) -> VisitStats<S> {
    VisitStats::new(
        Arc::new(store),
        Arc::new(AllowList::new(true, ["https://site1", "https://site2"])),
        EngineConfig::default(),
    )
    .expect("valid config")
}

fn request(url: &str, client: &str) -> VisitRequest {
    VisitRequest::builder().declared_url(url).client_address(client).build()
}

async fn record_n<S: VisitStore + 'static>(stats: &VisitStats<S>, url: &str, client: &str, n: usize) {
    for _ in 0..n {
        stats.record(&request(url, client)).await.expect("record");
    }
}

fn row(path: &str, pv: u64, uv: u64) -> StatRow {
    StatRow { path: path.to_owned(), pv, uv }
}

#[tokio::test]
async fn counting_and_cleanup_scenario() {
    let stats = stats(MemoryVisitStore::new());
    let site1 = Partition::from("site1");

    // 12 visits of /x from 10 clients, 3 visits of /y from one client.
    for i in 0..10 {
        stats.record(&request("https://site1/x", &format!("10.0.0.{i}"))).await.unwrap();
    }
    record_n(&stats, "https://site1/x", "10.0.0.0", 2).await;
    record_n(&stats, "https://site1/y", "10.0.1.1", 3).await;

    let x = stats.count(&site1, &Scope::page("/x")).await.unwrap();
    let y = stats.count(&site1, &Scope::page("/y")).await.unwrap();
    assert_eq!((x.pv, x.uv), (12, 10));
    assert_eq!((y.pv, y.uv), (3, 1));

    assert_eq!(stats.cleanup().await.unwrap(), 3);
    assert_eq!(stats.count(&site1, &Scope::page("/y")).await.unwrap().pv, 0);
    assert_eq!(stats.count(&site1, &Scope::page("/x")).await.unwrap().pv, 12);

    assert_eq!(stats.cleanup().await.unwrap(), 0, "a second pass deletes nothing");
    stats.shutdown().await;
}

#[tokio::test]
async fn ranking_orders_by_pv_then_uv() {
    let stats = stats(MemoryVisitStore::new());

    // A: pv 5, uv 3.
    record_n(&stats, "https://site1/A", "a1", 3).await;
    record_n(&stats, "https://site1/A", "a2", 1).await;
    record_n(&stats, "https://site1/A", "a3", 1).await;
    // B: pv 5, uv 4.
    record_n(&stats, "https://site1/B", "b1", 2).await;
    for client in ["b2", "b3", "b4"] {
        record_n(&stats, "https://site1/B", client, 1).await;
    }
    // C: pv 9, uv 1.
    record_n(&stats, "https://site1/C", "c1", 9).await;

    let dashboard = stats.summarize(Window::unbounded()).await.unwrap();
    assert_eq!(
        dashboard.partitions[&Partition::from("site1")],
        [row("/C", 9, 1), row("/B", 5, 4), row("/A", 5, 3)]
    );
    stats.shutdown().await;
}

#[tokio::test]
async fn window_boundary() {
    let store = MemoryVisitStore::new();
    store.insert(&visit_days_ago("site1", "/old", "1", 31)).await.unwrap();
    store.insert(&visit_days_ago("site1", "/recent", "1", 0)).await.unwrap();
    let stats = stats(store);

    let all = stats.summarize(Window::days(0)).await.unwrap();
    assert_eq!(all.partitions[&Partition::from("site1")].len(), 2);

    let month = stats.summarize(Window::days(30)).await.unwrap();
    assert_eq!(month.partitions[&Partition::from("site1")], [row("/recent", 1, 1)]);
    stats.shutdown().await;
}

#[tokio::test]
async fn identity_tokens() {
    let stats = stats(MemoryVisitStore::new());

    let first = stats.record(&request("https://site1/", "1")).await.unwrap();
    let second = stats.record(&request("https://site1/", "1")).await.unwrap();
    assert!(first.is_new && second.is_new);
    assert_ne!(first.visitor_id, second.visitor_id);

    let mut returning = request("https://site1/", "1");
    returning.visitor_token = Some(first.visitor_id.as_str().to_owned());
    let third = stats.record(&returning).await.unwrap();
    assert!(!third.is_new);
    assert_eq!(third.visitor_id, first.visitor_id);
    stats.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_visits_runs_one_ensure_procedure() {
    let store = FlakyStore::new(MemoryVisitStore::new());
    store.delay_ensure(Duration::from_millis(100));
    let stats = stats(store.clone());
    let site1 = Partition::from("site1");
    let mut events = stats.subscribe_readiness();

    stats.record(&request("https://site1/a", "1")).await.unwrap();
    stats.record(&request("https://site1/b", "2")).await.unwrap();
    assert_eq!(stats.readiness_state(&site1), ReadinessState::Ensuring);

    loop {
        let event = events.recv().await.unwrap();
        if event.state == ReadinessState::Ready {
            break;
        }
    }
    assert_eq!(stats.readiness().ensure_runs(), 1);
    assert_eq!(store.ensure_calls(), 1);
    assert!(store.inner().is_indexed(&site1));
    stats.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_readiness_is_retried_by_later_traffic() {
    let store = FlakyStore::new(MemoryVisitStore::new());
    store.fail_ensure_always();
    let config = EngineConfig::builder()
        .readiness(ReadinessConfig::builder().max_attempts(2).base_delay(Duration::from_millis(10)).build().unwrap())
        .build()
        .unwrap();
    let stats = VisitStats::new(Arc::new(store.clone()), Arc::new(AllowList::new(true, ["https://site1"])), config)
        .unwrap();
    let site1 = Partition::from("site1");
    let mut events = stats.subscribe_readiness();

    stats.record(&request("https://site1/", "1")).await.expect("ingestion is unaffected by readiness");
    let mut seen = Vec::new();
    while seen.last() != Some(&ReadinessState::Unknown) {
        seen.push(events.recv().await.unwrap().state);
    }
    assert_eq!(seen, [ReadinessState::Ensuring, ReadinessState::Failed, ReadinessState::Unknown]);

    store.heal();
    stats.record(&request("https://site1/", "2")).await.unwrap();
    while events.recv().await.unwrap().state != ReadinessState::Ready {}

    assert_eq!(stats.readiness_state(&site1), ReadinessState::Ready);
    assert_eq!(stats.readiness().ensure_runs(), 2);
    assert_eq!(stats.metrics().readiness_failures, 1);
    stats.shutdown().await;
}

#[tokio::test]
async fn concurrent_ingestion_is_fully_counted() {
    let stats = Arc::new(stats(MemoryVisitStore::new()));
    let mut tasks = tokio::task::JoinSet::new();
    for worker in 0..8 {
        let stats = Arc::clone(&stats);
        tasks.spawn(async move {
            for _ in 0..25 {
                stats.record(&request("https://site2/hot", &format!("w{worker}"))).await.unwrap();
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    let count = stats.count(&Partition::from("site2"), &Scope::page("/hot")).await.unwrap();
    assert_eq!((count.pv, count.uv), (200, 8));
    stats.shutdown().await;
}

proptest! {
    /// Page uv never exceeds page pv, and site pv is the sum of page pv.
    #[test]
    fn page_counts_add_up_to_site_count(visits in prop::collection::vec((0u8..4, 0u8..6), 0..40)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime");

        rt.block_on(async {
            let stats = stats(MemoryVisitStore::new());
            let site1 = Partition::from("site1");
            for (path, client) in &visits {
                stats.record(&request(&format!("https://site1/p{path}"), &client.to_string())).await.unwrap();
            }

            let mut page_sum = 0;
            for path in 0u8..4 {
                let page = stats.count(&site1, &Scope::page(format!("/p{path}"))).await.unwrap();
                prop_assert!(page.uv <= page.pv);
                page_sum += page.pv;
            }
            let site = stats.count(&site1, &Scope::Site).await.unwrap();
            prop_assert_eq!(site.pv, page_sum);
            prop_assert!(site.uv <= site.pv);
            stats.shutdown().await;
            Ok(())
        })?;
    }
}
