//! Change-topic consumer workers.
//!
//! Each worker owns one [`RecordSource`] and one [`Batcher`]. Offsets are
//! committed only for records whose events a completed flush has already
//! written to the stats store, so a crash can cause redelivery but never loss.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use event_schema::ChangeEvent;
use futures::FutureExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::ClientConfig;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::Result;
use crate::metrics::PipelineMetrics;
use crate::services::batcher::{Batcher, BatcherConfig};
use crate::shutdown;
use crate::stats::StatsStore;

const INITIAL_POLL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct PolledRecord {
    pub position: RecordPosition,
    pub payload: Option<Vec<u8>>,
}

/// Next offset to consume, per topic partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitCursor {
    next: BTreeMap<(String, i32), i64>,
}

impl CommitCursor {
    pub fn from_positions<'a, I>(positions: I) -> Self
    where
        I: IntoIterator<Item = &'a RecordPosition>,
    {
        let mut next = BTreeMap::new();
        for position in positions {
            let entry = next
                .entry((position.topic.clone(), position.partition))
                .or_insert(position.offset + 1);
            *entry = (*entry).max(position.offset + 1);
        }
        Self { next }
    }

    pub fn next_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.next.get(&(topic.to_string(), partition)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32, i64)> + '_ {
        self.next
            .iter()
            .map(|((topic, partition), offset)| (topic.as_str(), *partition, *offset))
    }

    pub fn to_topic_partition_list(&self) -> Result<TopicPartitionList> {
        let mut tpl = TopicPartitionList::with_capacity(self.next.len());
        for (topic, partition, offset) in self.iter() {
            tpl.add_partition_offset(topic, partition, Offset::Offset(offset))?;
        }
        Ok(tpl)
    }
}

/// Partitioned record stream with explicit offset commits.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Waits for at least one record, returning at most `max_records`.
    async fn poll(&self, max_records: usize) -> Result<Vec<PolledRecord>>;

    async fn commit(&self, cursor: &CommitCursor) -> Result<()>;
}

/// One consumer-group member subscribed to the change topic.
pub struct KafkaRecordSource {
    consumer: StreamConsumer,
}

impl KafkaRecordSource {
    pub fn new(config: &KafkaConfig, worker_id: usize) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("client.id", format!("stats-worker-{}", worker_id))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "45000")
            .set("enable.partition.eof", "false")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;
        info!(
            worker_id,
            topic = %config.topic,
            group_id = %config.group_id,
            "Kafka consumer subscribed"
        );

        Ok(Self { consumer })
    }
}

fn polled_record<M: Message>(message: &M) -> PolledRecord {
    PolledRecord {
        position: RecordPosition {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        },
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn poll(&self, max_records: usize) -> Result<Vec<PolledRecord>> {
        let first = polled_record(&self.consumer.recv().await?);
        let mut records = vec![first];

        // Drain what is already buffered locally without waiting again
        while records.len() < max_records {
            match self.consumer.recv().now_or_never() {
                Some(Ok(message)) => records.push(polled_record(&message)),
                Some(Err(e)) => {
                    warn!(error = %e, "Kafka error while draining poll batch");
                    break;
                }
                None => break,
            }
        }

        Ok(records)
    }

    async fn commit(&self, cursor: &CommitCursor) -> Result<()> {
        let tpl = cursor.to_topic_partition_list()?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub max_poll_records: usize,
    pub batcher: BatcherConfig,
}

/// What a worker did before it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub records: u64,
    pub decode_failures: u64,
    pub commits: u64,
    /// Positions whose commit never succeeded; these will be redelivered.
    pub uncommitted: usize,
}

/// Consumes from `source` until shutdown, then drains the batcher and makes
/// one last commit attempt.
pub async fn run_worker(
    worker_id: usize,
    source: Arc<dyn RecordSource>,
    store: StatsStore,
    settings: WorkerSettings,
    metrics: PipelineMetrics,
    mut shutdown_rx: watch::Receiver<bool>,
) -> WorkerReport {
    info!(worker_id, "Consumer worker started");

    let batcher = Batcher::start(store, settings.batcher, metrics.clone(), shutdown_rx.clone());
    let mut report = WorkerReport {
        worker_id,
        ..Default::default()
    };
    let mut uncommitted: Vec<RecordPosition> = Vec::new();
    let mut backoff = INITIAL_POLL_BACKOFF;

    loop {
        let polled = tokio::select! {
            biased;
            _ = shutdown::cancelled(&mut shutdown_rx) => break,
            polled = source.poll(settings.max_poll_records) => polled,
        };

        let records = match polled {
            Ok(records) => {
                backoff = INITIAL_POLL_BACKOFF;
                records
            }
            Err(e) => {
                error!(worker_id, error = %e, backoff_ms = backoff.as_millis() as u64, "Poll failed");
                metrics.consumer_poll_errors.inc();
                tokio::select! {
                    biased;
                    _ = shutdown::cancelled(&mut shutdown_rx) => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_POLL_BACKOFF);
                continue;
            }
        };

        for record in records {
            report.records += 1;
            metrics.events_consumed_from_bus.inc();

            match record.payload.as_deref().map(ChangeEvent::decode) {
                Some(Ok(event)) => {
                    batcher.add(event);
                    metrics.events_processed_successfully.inc();
                }
                Some(Err(e)) => {
                    warn!(
                        worker_id,
                        partition = record.position.partition,
                        offset = record.position.offset,
                        error = %e,
                        "Skipping undecodable record"
                    );
                    report.decode_failures += 1;
                    metrics.events_failed_to_process.inc();
                }
                None => {
                    warn!(
                        worker_id,
                        partition = record.position.partition,
                        offset = record.position.offset,
                        "Skipping record without payload"
                    );
                    report.decode_failures += 1;
                    metrics.events_failed_to_process.inc();
                }
            }

            // Undecodable records count as consumed and are committed with the rest
            uncommitted.push(record.position);
        }

        let flushed = batcher.flush_if_threshold_met().await;
        if uncommitted.is_empty() {
            continue;
        }
        // A timer or size-signal flush may already have written everything
        if !flushed.is_empty() || batcher.is_drained().await {
            if commit_positions(worker_id, source.as_ref(), &uncommitted, &metrics).await {
                report.commits += 1;
                uncommitted.clear();
            }
        }
    }

    let drained = batcher.stop().await;

    if !drained {
        warn!(
            worker_id,
            positions = uncommitted.len(),
            "Batcher not drained, leaving offsets uncommitted"
        );
    } else if !uncommitted.is_empty()
        && commit_positions(worker_id, source.as_ref(), &uncommitted, &metrics).await
    {
        report.commits += 1;
        uncommitted.clear();
    }
    report.uncommitted = uncommitted.len();

    info!(
        worker_id,
        records = report.records,
        decode_failures = report.decode_failures,
        commits = report.commits,
        uncommitted = report.uncommitted,
        "Consumer worker exited"
    );
    report
}

async fn commit_positions(
    worker_id: usize,
    source: &dyn RecordSource,
    positions: &[RecordPosition],
    metrics: &PipelineMetrics,
) -> bool {
    let cursor = CommitCursor::from_positions(positions);
    match source.commit(&cursor).await {
        Ok(()) => {
            metrics.offset_commits.inc();
            debug!(
                worker_id,
                records = positions.len(),
                partitions = cursor.len(),
                "Committed offsets"
            );
            true
        }
        Err(e) => {
            warn!(worker_id, error = %e, "Offset commit failed, will retry after next flush");
            false
        }
    }
}

/// Runs one worker per source and waits for all of them to exit.
pub async fn run_worker_pool(
    sources: Vec<Arc<dyn RecordSource>>,
    store: StatsStore,
    settings: WorkerSettings,
    metrics: PipelineMetrics,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<WorkerReport> {
    let handles: Vec<_> = sources
        .into_iter()
        .enumerate()
        .map(|(index, source)| {
            tokio::spawn(run_worker(
                index + 1,
                source,
                store.clone(),
                settings,
                metrics.clone(),
                shutdown_rx.clone(),
            ))
        })
        .collect();

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(e) => error!("Consumer worker task failed: {}", e),
        }
    }

    info!(workers = reports.len(), "All consumer workers shut down");
    reports
}
