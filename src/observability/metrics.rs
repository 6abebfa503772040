use std::sync::atomic::{AtomicU64, Ordering};

/// Per-stream counters on the hot path. Atomics only, shared between the
/// publishing worker, the storage flusher, and the broker's status
/// reporting.
pub struct StreamCounters {
    stream_id: String,
    published: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
    transient_errors: AtomicU64,
    gaps: AtomicU64,
}

impl StreamCounters {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            published: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flushed(&self, count: u64) {
        self.flushed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_error(&self) {
        self.transient_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self, missing: u64) {
        self.gaps.fetch_add(missing, Ordering::Relaxed);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn transient_errors(&self) -> u64 {
        self.transient_errors.load(Ordering::Relaxed)
    }

    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }
}
