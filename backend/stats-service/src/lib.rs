//! Wikipedia change statistics.
//!
//! `change-producer` relays the public recent-change feed onto a Kafka topic;
//! `stats-service` consumes that topic with a pool of workers, aggregates
//! per-domain and per-user counts, and serves them over HTTP.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod services;
pub mod shutdown;
pub mod stats;
pub mod telemetry;

pub use config::Config;
pub use error::{Result, StatsError};
pub use metrics::PipelineMetrics;
pub use stats::{StatsSnapshot, StatsStore};
