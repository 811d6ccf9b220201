use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use event_schema::ChangeEvent;
use futures::TryStreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use super::{CounterKind, StatsSnapshot};
use crate::error::{Result, StatsError};
use crate::metrics::PipelineMetrics;

/// Rows read before a scan failed, plus the failure.
#[derive(Debug)]
pub struct PartialScan {
    pub rows: Vec<(String, u64)>,
    pub error: StatsError,
}

/// Storage operations the persistent store needs from its backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterSession: Send + Sync {
    /// Adds one to the counter `key` of family `kind`, creating it if absent.
    async fn increment(&self, kind: CounterKind, key: &str) -> Result<()>;

    /// Reads every counter of family `kind`.
    async fn scan(&self, kind: CounterKind) -> std::result::Result<Vec<(String, u64)>, PartialScan>;
}

/// PostgreSQL counter tables `stats_by_domain` and `stats_by_user`.
#[derive(Clone)]
pub struct PgCounterSession {
    pool: PgPool,
}

impl PgCounterSession {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects, then applies the embedded counter-table migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Running stats store migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Stats store migrations completed");

        Ok(Self::new(pool))
    }

    fn increment_sql(kind: CounterKind) -> &'static str {
        match kind {
            CounterKind::Domain => {
                "INSERT INTO stats_by_domain (domain, count) VALUES ($1, 1) \
                 ON CONFLICT (domain) DO UPDATE SET count = stats_by_domain.count + 1"
            }
            CounterKind::User => {
                "INSERT INTO stats_by_user (username, count) VALUES ($1, 1) \
                 ON CONFLICT (username) DO UPDATE SET count = stats_by_user.count + 1"
            }
        }
    }

    fn scan_sql(kind: CounterKind) -> &'static str {
        match kind {
            CounterKind::Domain => "SELECT domain, count FROM stats_by_domain",
            CounterKind::User => "SELECT username, count FROM stats_by_user",
        }
    }
}

#[async_trait]
impl CounterSession for PgCounterSession {
    async fn increment(&self, kind: CounterKind, key: &str) -> Result<()> {
        sqlx::query(Self::increment_sql(kind))
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan(&self, kind: CounterKind) -> std::result::Result<Vec<(String, u64)>, PartialScan> {
        let mut rows = Vec::new();
        let mut stream = sqlx::query_as::<_, (String, i64)>(Self::scan_sql(kind)).fetch(&self.pool);

        loop {
            match stream.try_next().await {
                Ok(Some((key, count))) => rows.push((key, u64::try_from(count).unwrap_or(0))),
                Ok(None) => return Ok(rows),
                Err(e) => {
                    return Err(PartialScan {
                        rows,
                        error: e.into(),
                    })
                }
            }
        }
    }
}

/// Best-effort counters kept in an external store.
///
/// Every increment is an independent update. A failed update is logged and
/// skipped, so the counters undercount while the backend is degraded.
#[derive(Clone)]
pub struct PersistentStats {
    session: Arc<dyn CounterSession>,
    metrics: PipelineMetrics,
}

impl PersistentStats {
    pub fn new(session: Arc<dyn CounterSession>, metrics: PipelineMetrics) -> Self {
        Self { session, metrics }
    }

    pub async fn record(&self, event: &ChangeEvent) {
        for kind in CounterKind::ALL {
            self.increment(kind, kind.key(event)).await;
        }
    }

    pub async fn record_many(&self, events: &[ChangeEvent]) {
        for event in events {
            self.record(event).await;
        }
        debug!(events = events.len(), "Recorded batch in persistent stats");
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::default();
        for kind in CounterKind::ALL {
            let rows = match self.session.scan(kind).await {
                Ok(rows) => rows,
                Err(partial) => {
                    warn!(
                        kind = ?kind,
                        rows_read = partial.rows.len(),
                        error = %partial.error,
                        "Stats scan failed, returning partial counters"
                    );
                    self.metrics.stats_store_errors.inc();
                    partial.rows
                }
            };

            let target = match kind {
                CounterKind::Domain => &mut snapshot.by_domain,
                CounterKind::User => &mut snapshot.by_user,
            };
            target.extend(rows);
        }
        snapshot
    }

    async fn increment(&self, kind: CounterKind, key: &str) {
        if let Err(e) = self.session.increment(kind, key).await {
            warn!(kind = ?kind, key = %key, error = %e, "Failed to increment stats counter");
            self.metrics.stats_store_errors.inc();
        }
    }
}
