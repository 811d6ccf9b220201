//! Aggregate change counters.
//!
//! Two interchangeable backends sit behind [`StatsStore`]: a lock-guarded
//! in-process map and a PostgreSQL counter table. Both count every event once
//! per domain and once per user; neither deduplicates redelivered events.

mod memory;
mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use event_schema::ChangeEvent;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, StatsError};
use crate::metrics::PipelineMetrics;

pub use memory::InMemoryStats;
pub use postgres::{CounterSession, PartialScan, PersistentStats, PgCounterSession};

/// Point-in-time copy of the counters. Owned by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub by_domain: HashMap<String, u64>,
    pub by_user: HashMap<String, u64>,
}

impl StatsSnapshot {
    pub fn total_by_domain(&self) -> u64 {
        self.by_domain.values().sum()
    }

    pub fn total_by_user(&self) -> u64 {
        self.by_user.values().sum()
    }
}

/// Which counter family an increment or scan targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Domain,
    User,
}

impl CounterKind {
    pub const ALL: [CounterKind; 2] = [CounterKind::Domain, CounterKind::User];

    /// The event field this counter family is keyed by.
    pub fn key<'a>(&self, event: &'a ChangeEvent) -> &'a str {
        match self {
            CounterKind::Domain => event.domain(),
            CounterKind::User => event.user(),
        }
    }
}

#[derive(Clone)]
pub enum StatsStore {
    InMemory(InMemoryStats),
    Persistent(PersistentStats),
}

impl StatsStore {
    pub fn in_memory() -> Self {
        StatsStore::InMemory(InMemoryStats::new())
    }

    /// Builds the backend selected by `config`, connecting and migrating
    /// the database for the persistent one.
    pub async fn from_config(config: &StorageConfig, metrics: &PipelineMetrics) -> Result<Self> {
        let store = match config.backend {
            StorageBackend::InMemory => Self::in_memory(),
            StorageBackend::Persistent => {
                let url = config.database_url.as_deref().ok_or_else(|| {
                    StatsError::Config("DATABASE_URL must be set for persistent storage".into())
                })?;
                let session = PgCounterSession::connect(url, config.max_connections).await?;
                StatsStore::Persistent(PersistentStats::new(Arc::new(session), metrics.clone()))
            }
        };

        info!(backend = store.backend_name(), "Stats store ready");
        Ok(store)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            StatsStore::InMemory(_) => "in-memory",
            StatsStore::Persistent(_) => "persistent",
        }
    }

    pub async fn record(&self, event: &ChangeEvent) {
        match self {
            StatsStore::InMemory(store) => store.record(event),
            StatsStore::Persistent(store) => store.record(event).await,
        }
    }

    pub async fn record_many(&self, events: &[ChangeEvent]) {
        match self {
            StatsStore::InMemory(store) => store.record_many(events),
            StatsStore::Persistent(store) => store.record_many(events).await,
        }
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        match self {
            StatsStore::InMemory(store) => store.snapshot(),
            StatsStore::Persistent(store) => store.snapshot().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(domain: &str, user: &str) -> ChangeEvent {
        ChangeEvent::new(domain, "Page", user).unwrap()
    }

    #[tokio::test]
    async fn test_record_many_example() {
        let store = StatsStore::in_memory();
        store
            .record_many(&[event("A", "u1"), event("A", "u2"), event("B", "u1")])
            .await;

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.by_domain.get("A"), Some(&2));
        assert_eq!(snapshot.by_domain.get("B"), Some(&1));
        assert_eq!(snapshot.by_user.get("u1"), Some(&2));
        assert_eq!(snapshot.by_user.get("u2"), Some(&1));
    }

    #[tokio::test]
    async fn test_concurrent_writers_sum_to_total() {
        let store = StatsStore::in_memory();
        let mut tasks = Vec::new();

        for worker in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let e = event(&format!("d{}", i % 3), &format!("u{}", worker));
                    if i % 2 == 0 {
                        store.record(&e).await;
                    } else {
                        store.record_many(&[e.clone(), e]).await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // 25 single records + 25 pairs per worker
        let expected = 8 * (25 + 50);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.total_by_domain(), expected);
        assert_eq!(snapshot.total_by_user(), expected);
    }

    #[tokio::test]
    async fn test_snapshot_is_independent_copy() {
        let store = StatsStore::in_memory();
        store.record(&event("A", "u1")).await;

        let mut first = store.snapshot().await;
        first.by_domain.insert("A".to_string(), 100);
        first.by_user.clear();

        let second = store.snapshot().await;
        assert_eq!(second.by_domain.get("A"), Some(&1));
        assert_eq!(second.by_user.get("u1"), Some(&1));
    }

    #[tokio::test]
    async fn test_from_config_in_memory() {
        let config = StorageConfig {
            backend: StorageBackend::InMemory,
            database_url: None,
            max_connections: 1,
        };
        let store = StatsStore::from_config(&config, &PipelineMetrics::unregistered())
            .await
            .unwrap();
        assert_eq!(store.backend_name(), "in-memory");
    }

    #[tokio::test]
    async fn test_from_config_persistent_without_url() {
        let config = StorageConfig {
            backend: StorageBackend::Persistent,
            database_url: None,
            max_connections: 1,
        };
        let result = StatsStore::from_config(&config, &PipelineMetrics::unregistered()).await;
        assert!(matches!(result, Err(StatsError::Config(_))));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let mut snapshot = StatsSnapshot::default();
        snapshot.by_domain.insert("en.wikipedia.org".to_string(), 2);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["by_domain"]["en.wikipedia.org"], 2);
        assert!(json["by_user"].as_object().unwrap().is_empty());
    }
}
