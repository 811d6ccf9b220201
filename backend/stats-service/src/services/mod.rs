pub mod batcher;
pub mod consumer;
pub mod feed;
pub mod producer;

pub use batcher::{Batcher, BatcherConfig};
pub use consumer::{
    run_worker, run_worker_pool, CommitCursor, KafkaRecordSource, PolledRecord, RecordPosition,
    RecordSource, WorkerReport, WorkerSettings,
};
pub use producer::{
    parse_change, stream_changes, KafkaRecordSink, ProducerSettings, ProducerSummary, RecordSink,
};
