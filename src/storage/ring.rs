use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::Sample;

/// Fixed-capacity single-producer/single-consumer ring of committed
/// samples.
///
/// `head` and `tail` are free-running u64 counters: occupancy is
/// `head - tail` and the slot index is `counter % capacity`, so the full
/// ring holds exactly `capacity` samples. Only the owning node writes
/// `head`; only the storage flusher advances `tail`. No locks anywhere on
/// this path.
pub struct SampleRing {
    slots: Box<[UnsafeCell<MaybeUninit<Sample>>]>,
    capacity: usize,
    high_water: usize,
    head: AtomicU64,
    tail: AtomicU64,
}

// Slots are only touched by the single writer (indices >= tail committed
// by head) and the single reader (indices < head claimed by tail); the
// split handles below enforce that single-ness at the type level.
unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    /// Creates the ring and splits it into its writer and reader halves.
    pub fn with_capacity(capacity: usize, high_water_fraction: f64) -> (RingWriter, RingReader) {
        assert!(capacity > 0, "ring capacity must be positive");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let high_water = ((capacity as f64) * high_water_fraction).ceil() as usize;
        let ring = Arc::new(Self {
            slots,
            capacity,
            high_water: high_water.clamp(1, capacity),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        });
        (
            RingWriter {
                ring: Arc::clone(&ring),
            },
            RingReader { ring },
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupancy(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head - tail) as usize
    }

    pub fn is_above_high_water(&self) -> bool {
        self.occupancy() >= self.high_water
    }
}

impl Drop for SampleRing {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        for i in tail..head {
            let slot = self.slots[(i % self.capacity as u64) as usize].get();
            // Committed but never claimed; drop in place.
            unsafe { (*slot).assume_init_drop() };
        }
    }
}

/// Writer half, held by the node that owns the stream.
pub struct RingWriter {
    ring: Arc<SampleRing>,
}

impl RingWriter {
    /// Commits one sample. A ring exactly at capacity refuses the next
    /// write: the sample comes back so the caller can surface the
    /// overflow instead of silently losing data.
    pub fn push(&self, sample: Sample) -> Result<(), Sample> {
        let head = self.ring.head.load(Ordering::Relaxed);
        let tail = self.ring.tail.load(Ordering::Acquire);
        if (head - tail) as usize == self.ring.capacity {
            return Err(sample);
        }
        let slot = self.ring.slots[(head % self.ring.capacity as u64) as usize].get();
        unsafe { (*slot).write(sample) };
        self.ring.head.store(head + 1, Ordering::Release);
        Ok(())
    }

    pub fn occupancy(&self) -> usize {
        self.ring.occupancy()
    }
}

/// Occupancy-only view of a ring, safe to hold anywhere. Cannot touch
/// the slots.
#[derive(Clone)]
pub struct RingProbe {
    ring: Arc<SampleRing>,
}

impl RingProbe {
    pub fn occupancy(&self) -> usize {
        self.ring.occupancy()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Reader half, held by the storage flusher of the stream.
pub struct RingReader {
    ring: Arc<SampleRing>,
}

impl RingReader {
    pub fn probe(&self) -> RingProbe {
        RingProbe {
            ring: Arc::clone(&self.ring),
        }
    }

    /// Claims up to `max` samples from the tail as one contiguous range
    /// and advances the checkpoint past them. The compare-and-set guards
    /// against a duplicated claim if a flusher is ever respawned mid
    /// range.
    pub fn claim(&self, max: usize) -> Vec<Sample> {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        let available = (head - tail) as usize;
        let count = available.min(max);
        if count == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(count);
        for i in tail..tail + count as u64 {
            let slot = self.ring.slots[(i % self.ring.capacity as u64) as usize].get();
            out.push(unsafe { (*slot).assume_init_read() });
        }
        match self.ring.tail.compare_exchange(
            tail,
            tail + count as u64,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => out,
            // Single-reader contract violated; samples were already moved
            // out, so losing the race would double-read. Surface loudly.
            Err(actual) => panic!(
                "concurrent tail advance detected: expected {}, found {}",
                tail, actual
            ),
        }
    }

    pub fn occupancy(&self) -> usize {
        self.ring.occupancy()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn is_above_high_water(&self) -> bool {
        self.ring.is_above_high_water()
    }
}
