use actix_web::HttpResponse;
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use tracing::warn;

/// Pipeline counters, registered on a caller-provided registry.
///
/// Clones share the underlying counters, so one instance can be handed to
/// every worker and batcher.
#[derive(Clone)]
pub struct PipelineMetrics {
    // Producer
    pub events_consumed_from_stream: IntCounter,
    pub events_produced_to_bus: IntCounter,
    pub events_rejected: IntCounter,
    pub events_publish_failed: IntCounter,

    // Consumer
    pub events_consumed_from_bus: IntCounter,
    pub events_processed_successfully: IntCounter,
    pub events_failed_to_process: IntCounter,
    pub offset_commits: IntCounter,
    pub consumer_poll_errors: IntCounter,

    // Batcher / store
    pub batches_flushed: IntCounter,
    pub events_flushed: IntCounter,
    pub stats_store_errors: IntCounter,
}

impl PipelineMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            events_consumed_from_stream: counter(
                registry,
                "events_consumed_from_stream_total",
                "Total number of data lines read from the change feed",
            ),
            events_produced_to_bus: counter(
                registry,
                "events_produced_to_bus_total",
                "Total number of change events acknowledged by the message bus",
            ),
            events_rejected: counter(
                registry,
                "events_rejected_total",
                "Total number of feed payloads dropped as malformed or incomplete",
            ),
            events_publish_failed: counter(
                registry,
                "events_publish_failed_total",
                "Total number of change events the message bus did not acknowledge",
            ),
            events_consumed_from_bus: counter(
                registry,
                "events_consumed_from_bus_total",
                "Total number of records polled from the message bus",
            ),
            events_processed_successfully: counter(
                registry,
                "events_processed_successfully_total",
                "Total number of records decoded and handed to a batcher",
            ),
            events_failed_to_process: counter(
                registry,
                "events_failed_to_process_total",
                "Total number of records that could not be decoded",
            ),
            offset_commits: counter(
                registry,
                "offset_commits_total",
                "Total number of successful offset commits",
            ),
            consumer_poll_errors: counter(
                registry,
                "consumer_poll_errors_total",
                "Total number of failed polls against the message bus",
            ),
            batches_flushed: counter(
                registry,
                "batches_flushed_total",
                "Total number of non-empty batches flushed into the stats store",
            ),
            events_flushed: counter(
                registry,
                "events_flushed_total",
                "Total number of events flushed into the stats store",
            ),
            stats_store_errors: counter(
                registry,
                "stats_store_errors_total",
                "Total number of failed stats store updates and scans",
            ),
        }
    }

    /// Metrics on a private registry, for tests and tools that never expose them.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new())
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter =
        IntCounter::with_opts(Opts::new(name, help)).expect("valid metric opts for counter");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!("Failed to register metric {}: {}", name, e);
    }
    counter
}

/// Prometheus text exposition of `registry`.
pub fn render(registry: &Registry) -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
