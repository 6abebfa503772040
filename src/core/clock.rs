use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Session-wide reference clock.
///
/// `reference_time_ns() = monotonic_ns() + offset_ns`. The offset is zero
/// until the SYNC phase completes: the reference broker anchors its offset
/// to the UNIX epoch, every other broker adopts the offset computed from a
/// single symmetric round-trip exchange. Finer alignment is the PTP
/// grandmaster's job underneath this layer.
#[derive(Debug)]
pub struct ReferenceClock {
    origin: Instant,
    offset_ns: AtomicI64,
}

impl ReferenceClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            offset_ns: AtomicI64::new(0),
        })
    }

    /// Nanoseconds since the process-local monotonic origin.
    pub fn monotonic_ns(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    pub fn reference_time_ns(&self) -> i64 {
        self.monotonic_ns() + self.offset_ns.load(Ordering::Acquire)
    }

    pub fn offset_ns(&self) -> i64 {
        self.offset_ns.load(Ordering::Acquire)
    }

    pub fn set_offset_ns(&self, offset_ns: i64) {
        self.offset_ns.store(offset_ns, Ordering::Release);
    }

    /// Anchor the reference timeline to the UNIX epoch. Called by the
    /// elected reference broker so that reference timestamps are
    /// wall-clock interpretable in the persisted metadata.
    pub fn anchor_to_epoch(&self) {
        let now_unix_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        self.set_offset_ns(now_unix_ns - self.monotonic_ns());
    }

    /// Offset such that our `reference_time_ns` agrees with the reference
    /// broker, assuming symmetric network delay on the probe round-trip.
    ///
    /// `t0`: our monotonic time when the probe left.
    /// `t1`: our monotonic time when the reply arrived.
    /// `remote_reference_ns`: the reference broker's reference time when
    /// it produced the reply.
    pub fn offset_from_exchange(t0: i64, t1: i64, remote_reference_ns: i64) -> i64 {
        let half_rtt = (t1 - t0) / 2;
        remote_reference_ns + half_rtt - t1
    }
}
