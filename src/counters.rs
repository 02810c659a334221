use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Count and byte total for one primitive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpTotals {
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug)]
pub(crate) struct OpCounter {
    count: AtomicU64,
    bytes: AtomicU64,
}

impl OpCounter {
    const fn new() -> Self {
        OpCounter {
            count: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record(&self, bytes: usize) {
        // Relaxed: the counters carry no ordering for other memory.
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn totals(&self) -> OpTotals {
        OpTotals {
            count: self.count.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}

/// Process-wide totals, updated from every primitive call.
#[derive(Debug)]
pub(crate) struct Counters {
    pub malloc: OpCounter,
    pub calloc: OpCounter,
    pub realloc: OpCounter,
    /// Only releases that matched a live record; untracked blocks have no
    /// known size.
    pub free: OpCounter,
    tracked_bytes: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    pub const fn new() -> Self {
        Counters {
            malloc: OpCounter::new(),
            calloc: OpCounter::new(),
            realloc: OpCounter::new(),
            free: OpCounter::new(),
            tracked_bytes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn record_tracked(&self, bytes: usize) {
        self.tracked_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> GlobalCounters {
        GlobalCounters {
            malloc: self.malloc.totals(),
            calloc: self.calloc.totals(),
            realloc: self.realloc.totals(),
            free: self.free.totals(),
            tracked_bytes: self.tracked_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.malloc.reset();
        self.calloc.reset();
        self.realloc.reset();
        self.free.reset();
        self.tracked_bytes.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

/// A point-in-time copy of the process-wide counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlobalCounters {
    pub malloc: OpTotals,
    pub calloc: OpTotals,
    pub realloc: OpTotals,
    pub free: OpTotals,
    /// Bytes of every record inserted into the store.
    pub tracked_bytes: u64,
    /// Allocations that passed the size filter but found the store full.
    pub dropped: u64,
}

impl GlobalCounters {
    /// Allocating operations minus matched releases.
    pub fn outstanding_ops(&self) -> u64 {
        (self.malloc.count + self.calloc.count + self.realloc.count)
            .saturating_sub(self.free.count)
    }

    /// Bytes still held by live records.
    pub fn outstanding_bytes(&self) -> u64 {
        self.tracked_bytes.saturating_sub(self.free.bytes)
    }
}
