//! In-process message bus standing in for Kafka in pipeline tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stats_service::services::{CommitCursor, PolledRecord, RecordPosition, RecordSink, RecordSource};
use stats_service::{Result, StatsError};

pub struct MemoryBus {
    topic: String,
    partitions: Mutex<Vec<Vec<Vec<u8>>>>,
    committed: Mutex<HashMap<i32, i64>>,
}

impl MemoryBus {
    pub fn new(topic: &str, partitions: usize) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.to_string(),
            partitions: Mutex::new(vec![Vec::new(); partitions]),
            committed: Mutex::new(HashMap::new()),
        })
    }

    fn partition_for(&self, key: &str) -> usize {
        let count = self.partitions.lock().len();
        key.bytes().map(usize::from).sum::<usize>() % count
    }

    pub fn partition_len(&self, partition: i32) -> i64 {
        self.partitions.lock()[partition as usize].len() as i64
    }

    pub fn total_records(&self) -> usize {
        self.partitions.lock().iter().map(Vec::len).sum()
    }

    pub fn committed(&self, partition: i32) -> i64 {
        self.committed.lock().get(&partition).copied().unwrap_or(0)
    }

    /// A consumer-group member owning `partitions`, resuming from the
    /// committed offsets.
    pub fn reader(self: &Arc<Self>, partitions: Vec<i32>) -> PartitionReader {
        let next = partitions.iter().map(|p| (*p, self.committed(*p))).collect();
        PartitionReader {
            bus: Arc::clone(self),
            partitions,
            next: Mutex::new(next),
            reject_commits: false,
        }
    }
}

#[async_trait]
impl RecordSink for MemoryBus {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<()> {
        if topic != self.topic {
            return Err(StatsError::Internal(format!("unknown topic {}", topic)));
        }
        let partition = self.partition_for(key);
        self.partitions.lock()[partition].push(payload);
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

pub struct PartitionReader {
    bus: Arc<MemoryBus>,
    partitions: Vec<i32>,
    next: Mutex<HashMap<i32, i64>>,
    pub reject_commits: bool,
}

#[async_trait]
impl RecordSource for PartitionReader {
    async fn poll(&self, max_records: usize) -> Result<Vec<PolledRecord>> {
        let batch = {
            let data = self.bus.partitions.lock();
            let mut next = self.next.lock();
            let mut batch = Vec::new();

            for partition in &self.partitions {
                let offset = next.entry(*partition).or_insert(0);
                let records = &data[*partition as usize];
                while (*offset as usize) < records.len() && batch.len() < max_records {
                    batch.push(PolledRecord {
                        position: RecordPosition {
                            topic: self.bus.topic.clone(),
                            partition: *partition,
                            offset: *offset,
                        },
                        payload: Some(records[*offset as usize].clone()),
                    });
                    *offset += 1;
                }
            }
            batch
        };

        if batch.is_empty() {
            // Caught up: block like an idle broker until the worker is cancelled
            futures::future::pending::<()>().await;
        }
        Ok(batch)
    }

    async fn commit(&self, cursor: &CommitCursor) -> Result<()> {
        if self.reject_commits {
            return Err(StatsError::Internal("commit rejected".into()));
        }
        let mut committed = self.bus.committed.lock();
        for (_topic, partition, offset) in cursor.iter() {
            let entry = committed.entry(partition).or_insert(0);
            *entry = (*entry).max(offset);
        }
        Ok(())
    }
}

pub fn data_line(domain: &str, title: &str, user: &str) -> String {
    format!(
        r#"data: {{"$schema":"/mediawiki/recentchange/1.0.0","meta":{{"domain":"{}","stream":"mediawiki.recentchange"}},"type":"edit","title":"{}","user":"{}","bot":false}}"#,
        domain, title, user
    )
}
