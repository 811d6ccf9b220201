//! Feed → producer → bus → worker pool → stats store, with an in-process bus.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{data_line, MemoryBus};
use futures::stream;
use stats_service::services::{
    run_worker_pool, stream_changes, BatcherConfig, ProducerSettings, RecordSource, WorkerSettings,
};
use stats_service::{PipelineMetrics, StatsStore};
use tokio::sync::watch;

const TOPIC: &str = "wikipedia.changes";
const DOMAINS: [&str; 3] = ["en.wikipedia.org", "de.wikipedia.org", "commons.wikimedia.org"];
const USERS: [&str; 4] = ["alice", "bob", "carol", "dave"];

fn feed(events: usize) -> Vec<String> {
    let mut lines = vec![":ok".to_string(), String::new()];
    for i in 0..events {
        lines.push("event: message".to_string());
        lines.push(format!("id: [{{\"partition\":0,\"offset\":{}}}]", i));
        lines.push(data_line(DOMAINS[i % DOMAINS.len()], &format!("Page {}", i), USERS[i % USERS.len()]));
        lines.push(String::new());
    }
    lines
}

fn expected_counts(events: usize) -> (HashMap<String, u64>, HashMap<String, u64>) {
    let mut by_domain = HashMap::new();
    let mut by_user = HashMap::new();
    for i in 0..events {
        *by_domain.entry(DOMAINS[i % DOMAINS.len()].to_string()).or_insert(0) += 1;
        *by_user.entry(USERS[i % USERS.len()].to_string()).or_insert(0) += 1;
    }
    (by_domain, by_user)
}

async fn produce(bus: &Arc<MemoryBus>, lines: Vec<String>) -> u64 {
    let (_tx, rx) = watch::channel(false);
    let settings = ProducerSettings {
        topic: TOPIC.to_string(),
        flush_timeout: Duration::from_secs(1),
    };
    let summary = stream_changes(
        stream::iter(lines),
        bus.as_ref(),
        &settings,
        &PipelineMetrics::unregistered(),
        rx,
    )
    .await
    .unwrap();
    summary.published
}

fn worker_settings(batch_size: usize) -> WorkerSettings {
    WorkerSettings {
        max_poll_records: 7,
        batcher: BatcherConfig {
            batch_size,
            flush_interval: Duration::from_secs(3600),
        },
    }
}

/// Runs the pool until it has had time to catch up, then shuts it down.
async fn consume(
    sources: Vec<Arc<dyn RecordSource>>,
    store: StatsStore,
    batch_size: usize,
) -> Vec<stats_service::services::WorkerReport> {
    let (tx, rx) = watch::channel(false);
    let pool = tokio::spawn(run_worker_pool(
        sources,
        store,
        worker_settings(batch_size),
        PipelineMetrics::unregistered(),
        rx,
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), pool)
        .await
        .expect("worker pool did not drain in time")
        .unwrap()
}

#[tokio::test]
async fn test_end_to_end_counts_and_commits() {
    let bus = MemoryBus::new(TOPIC, 4);
    let published = produce(&bus, feed(50)).await;
    assert_eq!(published, 50);
    assert_eq!(bus.total_records(), 50);

    let store = StatsStore::in_memory();
    let sources: Vec<Arc<dyn RecordSource>> = vec![
        Arc::new(bus.reader(vec![0, 1])),
        Arc::new(bus.reader(vec![2, 3])),
    ];
    let reports = consume(sources, store.clone(), 4).await;

    let (by_domain, by_user) = expected_counts(50);
    let snapshot = store.snapshot().await;
    assert_eq!(snapshot.by_domain, by_domain);
    assert_eq!(snapshot.by_user, by_user);

    assert_eq!(reports.len(), 2);
    assert_eq!(reports.iter().map(|r| r.records).sum::<u64>(), 50);
    for partition in 0..4 {
        assert_eq!(bus.committed(partition), bus.partition_len(partition));
    }
    assert!(reports.iter().all(|r| r.uncommitted == 0));
}

#[tokio::test]
async fn test_invalid_feed_events_never_reach_the_store() {
    let bus = MemoryBus::new(TOPIC, 2);
    let mut lines = feed(6);
    lines.push(r#"data: {"meta":{"domain":"en.wikipedia.org"},"title":"No user"}"#.to_string());
    lines.push(r#"data: {"title":"No meta","user":"eve"}"#.to_string());
    lines.push("data: not json at all".to_string());
    lines.push(r#"{"meta":{"domain":"x"},"title":"No marker","user":"mallory"}"#.to_string());

    assert_eq!(produce(&bus, lines).await, 6);

    let store = StatsStore::in_memory();
    let sources: Vec<Arc<dyn RecordSource>> = vec![Arc::new(bus.reader(vec![0, 1]))];
    consume(sources, store.clone(), 100).await;

    let snapshot = store.snapshot().await;
    assert_eq!(snapshot.total_by_user(), 6);
    assert!(!snapshot.by_user.contains_key("eve"));
    assert!(!snapshot.by_user.contains_key("mallory"));
}

#[tokio::test]
async fn test_uncommitted_records_are_redelivered_after_restart() {
    let bus = MemoryBus::new(TOPIC, 2);
    produce(&bus, feed(10)).await;
    let store = StatsStore::in_memory();

    // First run aggregates everything but every commit is rejected
    let mut reader = bus.reader(vec![0, 1]);
    reader.reject_commits = true;
    let reports = consume(vec![Arc::new(reader)], store.clone(), 3).await;
    assert_eq!(reports[0].commits, 0);
    assert_eq!(reports[0].uncommitted, 10);
    assert_eq!(bus.committed(0) + bus.committed(1), 0);
    assert_eq!(store.snapshot().await.total_by_domain(), 10);

    // A restarted worker resumes from the committed offsets and counts again
    let reports = consume(vec![Arc::new(bus.reader(vec![0, 1]))], store.clone(), 3).await;
    assert_eq!(reports[0].records, 10);
    assert_eq!(store.snapshot().await.total_by_domain(), 20);
    assert_eq!(bus.committed(0), bus.partition_len(0));
    assert_eq!(bus.committed(1), bus.partition_len(1));
}
