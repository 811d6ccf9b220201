//! Feed relay: turns raw feed lines into change records on the bus.

use std::time::Duration;

use async_trait::async_trait;
use event_schema::{ChangeEvent, FEED_DATA_MARKER};
use futures::{Stream, StreamExt};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, StatsError};
use crate::metrics::PipelineMetrics;
use crate::shutdown;

/// Destination for encoded change records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Publishes one record and waits for the broker's acknowledgement.
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()>;

    /// Waits for queued records to be delivered, up to `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<()>;
}

/// `RecordSink` over an rdkafka `FutureProducer`.
#[derive(Clone)]
pub struct KafkaRecordSink {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaRecordSink {
    pub fn new(brokers: &str, send_timeout: Duration) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("linger.ms", "100")
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .create()?;

        Ok(Self {
            producer,
            send_timeout,
        })
    }
}

#[async_trait]
impl RecordSink for KafkaRecordSink {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);

        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(err, _)| StatsError::Kafka(err))?;

        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| StatsError::Internal(format!("producer flush task failed: {}", e)))??;
        Ok(())
    }
}

/// Counts from one relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    /// Every line read from the feed, data or not.
    pub lines_read: u64,
    pub published: u64,
    /// Data lines dropped as malformed or incomplete.
    pub rejected: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub topic: String,
    pub flush_timeout: Duration,
}

/// Extracts a change event from a feed data payload.
///
/// The domain lives under `meta`; `title` and `user` are top-level. All three
/// must be non-empty strings.
pub fn parse_change(payload: &str) -> Result<ChangeEvent> {
    let raw: Value = serde_json::from_str(payload)
        .map_err(|e| StatsError::Validation(format!("malformed JSON: {}", e)))?;

    let meta = raw
        .get("meta")
        .filter(|m| m.is_object())
        .ok_or_else(|| StatsError::Validation("missing 'meta' object".to_string()))?;

    let domain = meta.get("domain").and_then(Value::as_str).unwrap_or_default();
    let title = raw.get("title").and_then(Value::as_str).unwrap_or_default();
    let user = raw.get("user").and_then(Value::as_str).unwrap_or_default();

    Ok(ChangeEvent::new(domain, title, user)?)
}

/// Relays feed lines to `sink` until the feed ends or shutdown is requested.
///
/// Bad payloads and failed sends are logged and counted, never fatal. In
/// both exit paths the sink is flushed before returning.
pub async fn stream_changes<S>(
    mut lines: S,
    sink: &dyn RecordSink,
    settings: &ProducerSettings,
    metrics: &PipelineMetrics,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<ProducerSummary>
where
    S: Stream<Item = String> + Unpin,
{
    let mut summary = ProducerSummary::default();

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown::cancelled(&mut shutdown_rx) => {
                info!("Shutdown requested, flushing pending records");
                break;
            }
            next = lines.next() => match next {
                Some(line) => line,
                None => {
                    info!("Change feed ended");
                    break;
                }
            },
        };
        summary.lines_read += 1;

        let Some(payload) = line.strip_prefix(FEED_DATA_MARKER) else {
            continue;
        };
        metrics.events_consumed_from_stream.inc();

        let event = match parse_change(payload) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Skipping feed event");
                summary.rejected += 1;
                metrics.events_rejected.inc();
                continue;
            }
        };

        match sink
            .send(&settings.topic, event.domain(), event.encode_to_vec())
            .await
        {
            Ok(()) => {
                summary.published += 1;
                metrics.events_produced_to_bus.inc();
            }
            Err(e) => {
                warn!(
                    topic = %settings.topic,
                    domain = %event.domain(),
                    error = %e,
                    "Failed to publish change event"
                );
                summary.publish_failures += 1;
                metrics.events_publish_failed.inc();
            }
        }
    }

    if let Err(e) = sink.flush(settings.flush_timeout).await {
        warn!(error = %e, "Producer flush did not complete");
    }

    info!(
        lines_read = summary.lines_read,
        published = summary.published,
        rejected = summary.rejected,
        publish_failures = summary.publish_failures,
        "Change relay stopped"
    );
    Ok(summary)
}
