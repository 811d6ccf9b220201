use std::collections::HashMap;
use std::sync::Arc;

use event_schema::ChangeEvent;
use parking_lot::RwLock;

use super::StatsSnapshot;

#[derive(Default)]
struct Counters {
    by_domain: HashMap<String, u64>,
    by_user: HashMap<String, u64>,
}

impl Counters {
    fn bump(&mut self, event: &ChangeEvent) {
        *self.by_domain.entry(event.domain().to_string()).or_insert(0) += 1;
        *self.by_user.entry(event.user().to_string()).or_insert(0) += 1;
    }
}

/// Process-local counters behind a single read/write lock.
#[derive(Clone, Default)]
pub struct InMemoryStats {
    inner: Arc<RwLock<Counters>>,
}

impl InMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &ChangeEvent) {
        self.inner.write().bump(event);
    }

    /// All events land under one lock acquisition.
    pub fn record_many(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let mut counters = self.inner.write();
        for event in events {
            counters.bump(event);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.inner.read();
        StatsSnapshot {
            by_domain: counters.by_domain.clone(),
            by_user: counters.by_user.clone(),
        }
    }
}
