use std::collections::HashMap;
use std::sync::Arc;

use super::StreamCounters;

/// Point-in-time view of one stream's counters, used for status reports
/// and the end-of-session diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub stream_id: String,
    pub published: u64,
    pub flushed: u64,
    pub dropped: u64,
    pub transient_errors: u64,
    pub gaps: u64,
}

impl CountersSnapshot {
    pub fn unflushed(&self) -> u64 {
        self.published.saturating_sub(self.flushed)
    }
}

/// Registry of per-stream counters for one host.
#[derive(Default, Clone)]
pub struct MetricsCollector {
    counters: HashMap<String, Arc<StreamCounters>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stream_id: impl Into<String>) -> Arc<StreamCounters> {
        let stream_id = stream_id.into();
        let counters = Arc::new(StreamCounters::new(stream_id.clone()));
        self.counters.insert(stream_id, Arc::clone(&counters));
        counters
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<StreamCounters>> {
        self.counters.get(stream_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<CountersSnapshot> {
        let mut rows: Vec<CountersSnapshot> = self
            .counters
            .values()
            .map(|c| CountersSnapshot {
                stream_id: c.stream_id().to_string(),
                published: c.published(),
                flushed: c.flushed(),
                dropped: c.dropped(),
                transient_errors: c.transient_errors(),
                gaps: c.gaps(),
            })
            .collect();
        rows.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        rows
    }
}
