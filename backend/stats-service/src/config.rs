use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StatsError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub feed: FeedConfig,
    pub storage: StorageConfig,
    pub consumer: ConsumerConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub send_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    InMemory,
    Persistent,
}

impl FromStr for StorageBackend {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in-memory" | "memory" => Ok(StorageBackend::InMemory),
            "persistent" | "postgres" => Ok(StorageBackend::Persistent),
            other => Err(StatsError::Config(format!(
                "STATS_STORAGE must be 'in-memory' or 'persistent', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_poll_records: usize,
}

impl ConsumerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub port: u16,
    pub metrics_port: u16,
}

impl KafkaConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// Only `KAFKA_BROKERS` is mandatory, plus `DATABASE_URL` when the
    /// persistent store is selected.
    pub fn from_env() -> Result<Self> {
        let brokers = std::env::var("KAFKA_BROKERS")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| StatsError::Config("KAFKA_BROKERS must be set".to_string()))?;

        let backend: StorageBackend = std::env::var("STATS_STORAGE")
            .unwrap_or_else(|_| "in-memory".to_string())
            .parse()?;

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        if backend == StorageBackend::Persistent && database_url.is_none() {
            return Err(StatsError::Config(
                "DATABASE_URL must be set when STATS_STORAGE=persistent".to_string(),
            ));
        }

        Ok(Config {
            kafka: KafkaConfig {
                brokers,
                topic: std::env::var("CHANGE_EVENTS_TOPIC")
                    .unwrap_or_else(|_| event_schema::DEFAULT_TOPIC.to_string()),
                group_id: std::env::var("KAFKA_GROUP_ID")
                    .unwrap_or_else(|_| default_group_id()),
                send_timeout_ms: parse_env("PRODUCER_SEND_TIMEOUT_MS", 5000)?,
            },
            feed: FeedConfig {
                url: std::env::var("CHANGE_FEED_URL")
                    .unwrap_or_else(|_| event_schema::DEFAULT_FEED_URL.to_string()),
            },
            storage: StorageConfig {
                backend,
                database_url,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
            },
            consumer: ConsumerConfig {
                workers: positive("CONSUMER_WORKERS", parse_env("CONSUMER_WORKERS", 3)?)?,
                batch_size: positive("BATCH_SIZE", parse_env("BATCH_SIZE", 20)?)?,
                flush_interval_ms: positive(
                    "BATCH_FLUSH_INTERVAL_MS",
                    parse_env("BATCH_FLUSH_INTERVAL_MS", 5000)?,
                )?,
                max_poll_records: positive(
                    "MAX_POLL_RECORDS",
                    parse_env("MAX_POLL_RECORDS", 500)?,
                )?,
            },
            http: HttpConfig {
                port: parse_env("HTTP_PORT", 8080)?,
                metrics_port: parse_env("METRICS_PORT", 2112)?,
            },
        })
    }
}

fn default_group_id() -> String {
    "wikipedia-consumer-group".to_string()
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| StatsError::Config(format!("{} is invalid ('{}'): {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}

fn positive<T>(key: &str, value: T) -> Result<T>
where
    T: PartialOrd + Default,
{
    if value <= T::default() {
        return Err(StatsError::Config(format!("{} must be at least 1", key)));
    }
    Ok(value)
}
