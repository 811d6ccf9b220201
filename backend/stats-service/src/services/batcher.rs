//! Size- and time-bounded buffering in front of the stats store.
//!
//! Events accumulate in an in-memory batch that is flushed into the
//! [`StatsStore`] when it reaches `batch_size`, on every `flush_interval`
//! tick, and once more when the batcher is stopped. All flushes go through one async lock,
//! so when a flush call returns every event added before it is in the store.

use std::sync::Arc;
use std::time::Duration;

use event_schema::ChangeEvent;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::PipelineMetrics;
use crate::shutdown;
use crate::stats::StatsStore;

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            flush_interval: Duration::from_secs(5),
        }
    }
}

struct Shared {
    store: StatsStore,
    metrics: PipelineMetrics,
    batch_size: usize,
    buffer: Mutex<Vec<ChangeEvent>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn flush(&self) -> Vec<ChangeEvent> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked().await
    }

    /// Caller must hold `flush_lock`.
    async fn flush_locked(&self) -> Vec<ChangeEvent> {
        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Vec::new();
            }
            std::mem::replace(&mut *buffer, Vec::with_capacity(self.batch_size))
        };

        self.store.record_many(&batch).await;

        self.metrics.batches_flushed.inc();
        self.metrics.events_flushed.inc_by(batch.len() as u64);
        debug!(events = batch.len(), "Flushed batch into stats store");
        batch
    }
}

/// Per-worker event buffer with a background flush task.
///
/// Owned by exactly one consumer worker. Call [`Batcher::stop`] to run the
/// final flush and join the background task.
pub struct Batcher {
    shared: Arc<Shared>,
    flush_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl Batcher {
    /// Spawns the background flush task on the current tokio runtime.
    pub fn start(
        store: StatsStore,
        config: BatcherConfig,
        metrics: PipelineMetrics,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            metrics,
            batch_size: config.batch_size.max(1),
            buffer: Mutex::new(Vec::with_capacity(config.batch_size)),
            flush_lock: tokio::sync::Mutex::new(()),
        });

        // A single slot: crossings that happen while a signal is pending
        // collapse into that one flush.
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_flush_loop(
            Arc::clone(&shared),
            flush_rx,
            config.flush_interval,
            shutdown_rx,
        ));

        Self {
            shared,
            flush_tx,
            task,
        }
    }

    pub fn add(&self, event: ChangeEvent) {
        let len = {
            let mut buffer = self.shared.buffer.lock();
            buffer.push(event);
            buffer.len()
        };

        if len >= self.shared.batch_size {
            // Full means a flush is already pending; closed means we are stopping.
            let _ = self.flush_tx.try_send(());
        }
    }

    /// Flushes now if the buffer holds at least `batch_size` events.
    ///
    /// Returns the flushed events, or an empty vec when below the threshold.
    /// Waits for any flush already in progress first.
    pub async fn flush_if_threshold_met(&self) -> Vec<ChangeEvent> {
        let _guard = self.shared.flush_lock.lock().await;
        if self.shared.buffer.lock().len() < self.shared.batch_size {
            return Vec::new();
        }
        self.shared.flush_locked().await
    }

    /// True when every event added so far has been written to the store.
    ///
    /// Waits for an in-progress flush to finish before answering.
    pub async fn is_drained(&self) -> bool {
        let _guard = self.shared.flush_lock.lock().await;
        self.shared.buffer.lock().is_empty()
    }

    /// Number of buffered, not yet flushed events.
    pub fn pending(&self) -> usize {
        self.shared.buffer.lock().len()
    }

    /// Closes the size signal, joins the background task and flushes whatever
    /// is still buffered.
    ///
    /// The background task may already have exited on shutdown while events
    /// kept arriving, so the final flush happens here, after the join.
    /// Returns true when nothing is left unwritten.
    pub async fn stop(self) -> bool {
        let Batcher {
            shared,
            flush_tx,
            task,
        } = self;
        drop(flush_tx);

        if let Err(e) = task.await {
            warn!("Batcher flush task ended abnormally: {}", e);
        }

        let flushed = shared.flush().await;
        if !flushed.is_empty() {
            info!(events = flushed.len(), "Flushed events added after shutdown");
        }
        let drained = shared.buffer.lock().is_empty();
        drained
    }
}

async fn run_flush_loop(
    shared: Arc<Shared>,
    mut flush_rx: mpsc::Receiver<()>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown::cancelled(&mut shutdown_rx) => {
                let flushed = shared.flush().await;
                info!(events = flushed.len(), "Batcher drained on shutdown");
                break;
            }
            _ = ticker.tick() => {
                shared.flush().await;
            }
            signal = flush_rx.recv() => match signal {
                Some(()) => {
                    shared.flush().await;
                }
                None => {
                    let flushed = shared.flush().await;
                    debug!(events = flushed.len(), "Batcher stopped");
                    break;
                }
            },
        }
    }
}
