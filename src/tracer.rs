use std::{
    cell::Cell,
    ffi::c_void,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::{
    bootstrap::{BootstrapArena, BootstrapUsage},
    counters::{Counters, GlobalCounters},
    lock::ReentrantLock,
    resolve::{Primitive, RealPrimitives, Resolver, as_calloc, as_free, as_malloc, as_realloc},
    stack::CallStack,
    store::{AllocationRecord, DEFAULT_CAPACITY, Entry, TraceStore},
    thread::ThreadIdentity,
};

/// Default lower bound of the tracked size range, in bytes.
pub const DEFAULT_SIZE_MIN: usize = 16 * 1024;
/// Default upper bound of the tracked size range, in bytes.
pub const DEFAULT_SIZE_MAX: usize = 4 * 1024 * 1024;

/// Inclusive range of request sizes that get a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizeFilter {
    pub min: usize,
    pub max: usize,
}

impl SizeFilter {
    pub const fn new(min: usize, max: usize) -> Self {
        SizeFilter { min, max }
    }

    pub fn contains(&self, size: usize) -> bool {
        self.min <= size && size <= self.max
    }
}

impl Default for SizeFilter {
    fn default() -> Self {
        SizeFilter::new(DEFAULT_SIZE_MIN, DEFAULT_SIZE_MAX)
    }
}

/// Where the controller currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Phase {
    Created = 0,
    WaitingToStart = 1,
    Tracing = 2,
    Dumping = 3,
    Stopped = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            1 => Phase::WaitingToStart,
            2 => Phase::Tracing,
            3 => Phase::Dumping,
            4 => Phase::Stopped,
            _ => Phase::Created,
        }
    }
}

/// Everything the reporter needs, copied out under the lock.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub records: Vec<AllocationRecord>,
    pub counters: GlobalCounters,
    pub bootstrap: BootstrapUsage,
    /// One past the highest slot in use when the snapshot was taken.
    pub high_water: usize,
    /// Nanoseconds since the Unix epoch at which tracing started, 0 if it
    /// never did.
    pub epoch_ns: u64,
    pub taken_at_ns: u64,
}

impl Snapshot {
    /// Milliseconds between the start of tracing and `timestamp_ns`.
    pub fn offset_ms(&self, timestamp_ns: u64) -> u64 {
        timestamp_ns.saturating_sub(self.epoch_ns) / 1_000_000
    }
}

/// State only touched while holding the tracer lock.
struct LockedState<const CAPACITY: usize> {
    /// Bookkeeping suppression depth, raised around stack capture and
    /// snapshots since both allocate.
    suppressed: Cell<u32>,
    /// A primitive is being resolved by the lock owner.
    resolving: Cell<bool>,
    store: TraceStore<CAPACITY>,
}

impl<const CAPACITY: usize> LockedState<CAPACITY> {
    fn suppressed<T>(&self, f: impl FnOnce() -> T) -> T {
        self.suppressed.set(self.suppressed.get() + 1);
        let result = f();
        self.suppressed.set(self.suppressed.get() - 1);
        result
    }

    fn is_suppressed(&self) -> bool {
        self.suppressed.get() > 0
    }
}

/// The process-wide tracing context: interposed primitives, trace store,
/// counters and the switches the controller flips.
///
/// Every field starts out zeroed, so a `static` tracer costs no file size
/// even with a large store. A tracer is meant to live in a `static`:
///
/// ```rust
/// use memcheck::{Libc, Tracer};
///
/// static TRACER: Tracer<Libc, 1024> = Tracer::new(Libc);
///
/// TRACER.configure(memcheck::SizeFilter::new(1024, 8192), false);
/// TRACER.start();
/// let block = unsafe { TRACER.malloc(2048) };
/// assert_eq!(TRACER.snapshot().records.len(), 1);
/// unsafe { TRACER.free(block) };
/// assert!(TRACER.snapshot().records.is_empty());
/// ```
pub struct Tracer<R, const CAPACITY: usize = DEFAULT_CAPACITY> {
    resolver: R,
    real: RealPrimitives,
    first_use_done: AtomicBool,
    abstained: AtomicBool,
    /// 1 + index into `Primitive::ALL` of the first primitive that failed to
    /// resolve, 0 if none did.
    unresolved: AtomicU8,
    enabled: AtomicBool,
    free_tracking: AtomicBool,
    callstacks: AtomicBool,
    /// Until `configure` is called the default filter applies.
    configured: AtomicBool,
    size_min: AtomicUsize,
    size_max: AtomicUsize,
    phase: AtomicU8,
    epoch_ns: AtomicU64,
    counters: Counters,
    arena: BootstrapArena,
    state: ReentrantLock<LockedState<CAPACITY>>,
}

impl<R: Resolver, const CAPACITY: usize> Tracer<R, CAPACITY> {
    pub const fn new(resolver: R) -> Self {
        Tracer {
            resolver,
            real: RealPrimitives::new(),
            first_use_done: AtomicBool::new(false),
            abstained: AtomicBool::new(false),
            unresolved: AtomicU8::new(0),
            enabled: AtomicBool::new(false),
            free_tracking: AtomicBool::new(false),
            callstacks: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            size_min: AtomicUsize::new(0),
            size_max: AtomicUsize::new(0),
            phase: AtomicU8::new(Phase::Created as u8),
            epoch_ns: AtomicU64::new(0),
            counters: Counters::new(),
            arena: BootstrapArena::new(),
            state: ReentrantLock::new(LockedState {
                suppressed: Cell::new(0),
                resolving: Cell::new(false),
                store: TraceStore::new(),
            }),
        }
    }

    /// Set the size filter and call-stack switch. The controller calls this
    /// once, before tracing starts.
    pub fn configure(&self, filter: SizeFilter, callstacks: bool) {
        let _guard = self.state.lock();
        self.size_min.store(filter.min, Ordering::Relaxed);
        self.size_max.store(filter.max, Ordering::Relaxed);
        self.callstacks.store(callstacks, Ordering::Relaxed);
        self.configured.store(true, Ordering::Release);
    }

    pub fn filter(&self) -> SizeFilter {
        if !self.configured.load(Ordering::Acquire) {
            return SizeFilter::default();
        }
        SizeFilter::new(
            self.size_min.load(Ordering::Relaxed),
            self.size_max.load(Ordering::Relaxed),
        )
    }

    /// Open a fresh tracking window: counters are reset and records left
    /// over from an earlier window are forgotten. Returns false when the
    /// tracer abstained because a real primitive could not be resolved.
    pub fn start(&self) -> bool {
        if self.is_abstained() {
            return false;
        }
        let state = self.state.lock();
        state.store.clear();
        self.counters.reset();
        self.epoch_ns.store(now_ns(), Ordering::Relaxed);
        self.free_tracking.store(true, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
        self.set_phase(Phase::Tracing);
        true
    }

    /// Stop recording new allocations. Releases still retire records.
    pub fn stop(&self) {
        let _guard = self.state.lock();
        self.enabled.store(false, Ordering::Release);
        self.free_tracking.store(true, Ordering::Release);
    }

    /// Turn all bookkeeping off, returning the primitives to the lock-free
    /// path.
    pub fn finish(&self) {
        let _guard = self.state.lock();
        self.enabled.store(false, Ordering::Release);
        self.free_tracking.store(false, Ordering::Release);
        self.set_phase(Phase::Stopped);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_abstained(&self) -> bool {
        self.abstained.load(Ordering::Acquire)
    }

    /// The first primitive whose real implementation could not be found.
    pub fn unresolved(&self) -> Option<Primitive> {
        match self.unresolved.load(Ordering::Acquire) {
            0 => None,
            n => Primitive::ALL.get(usize::from(n) - 1).copied(),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Move from `Created` to `WaitingToStart`. Only the first caller
    /// succeeds, which keeps a tracer to a single controller.
    pub fn claim_controller(&self) -> bool {
        self.phase
            .compare_exchange(
                Phase::Created as u8,
                Phase::WaitingToStart as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn counters(&self) -> GlobalCounters {
        self.counters.totals()
    }

    pub fn bootstrap_usage(&self) -> BootstrapUsage {
        self.arena.usage()
    }

    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Copy the live records and counters, leaving both in place.
    pub fn snapshot(&self) -> Snapshot {
        self.take_snapshot(false)
    }

    /// Copy the live records and counters, then clear the store and reset
    /// the counters.
    pub fn drain(&self) -> Snapshot {
        self.take_snapshot(true)
    }

    /// Forget every live record.
    pub fn clear(&self) {
        let state = self.state.lock();
        state.store.clear();
    }

    fn take_snapshot(&self, reset: bool) -> Snapshot {
        let state = self.state.lock();
        // Building the record vector calls malloc on this thread.
        state.suppressed(|| {
            let snapshot = Snapshot {
                records: state.store.snapshot(),
                counters: self.counters.totals(),
                bootstrap: self.arena.usage(),
                high_water: state.store.high_water(),
                epoch_ns: self.epoch_ns.load(Ordering::Relaxed),
                taken_at_ns: now_ns(),
            };
            if reset {
                state.store.clear();
                self.counters.reset();
            }
            snapshot
        })
    }

    /// `malloc` with bookkeeping.
    ///
    /// # Safety
    ///
    /// Same contract as C `malloc`.
    pub unsafe fn malloc(&self, size: usize) -> *mut c_void {
        if let Some(real) = self.real.malloc()
            && !self.is_active()
        {
            let result = unsafe { real(size) };
            self.counters.malloc.record(size);
            return result;
        }

        let state = self.state.lock();
        if state.resolving.get() {
            return self.arena.grant(1, size);
        }
        let real = self.resolved(&state, Primitive::Malloc, as_malloc);
        self.run_first_use_hook();

        let result = unsafe { real(size) };
        self.counters.malloc.record(size);
        self.track(&state, result, size);
        result
    }

    /// `calloc` with bookkeeping. Calls made while a primitive is being
    /// resolved are served from the bootstrap arena.
    ///
    /// # Safety
    ///
    /// Same contract as C `calloc`.
    pub unsafe fn calloc(&self, count: usize, size: usize) -> *mut c_void {
        let bytes = count.saturating_mul(size);
        if let Some(real) = self.real.calloc()
            && !self.is_active()
        {
            let result = unsafe { real(count, size) };
            self.counters.calloc.record(bytes);
            return result;
        }

        let state = self.state.lock();
        if state.resolving.get() {
            return self.arena.grant(count, size);
        }
        let real = self.resolved(&state, Primitive::Calloc, as_calloc);

        let result = unsafe { real(count, size) };
        self.counters.calloc.record(bytes);
        self.track(&state, result, bytes);
        result
    }

    /// `realloc` with bookkeeping. Blocks from the bootstrap arena are moved
    /// into real memory instead of being handed to the real `realloc`.
    ///
    /// # Safety
    ///
    /// Same contract as C `realloc`.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        if self.arena.contains(ptr) {
            return unsafe { self.move_out_of_arena(ptr, size) };
        }
        if let Some(real) = self.real.realloc()
            && !self.is_active()
        {
            let result = unsafe { real(ptr, size) };
            self.counters.realloc.record(size);
            return result;
        }

        let state = self.state.lock();
        let real = self.resolved(&state, Primitive::Realloc, as_realloc);

        // The lock stays held across the real call so no other thread can
        // be handed `ptr` and record it before the old record is retired.
        self.retire(&state, ptr);
        let result = unsafe { real(ptr, size) };
        self.counters.realloc.record(size);
        self.track(&state, result, size);
        result
    }

    unsafe fn move_out_of_arena(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        let result = unsafe { self.malloc(size) };
        if !result.is_null() {
            let len = self.arena.block_size(ptr).min(size);
            // SAFETY: both blocks hold at least `len` bytes and never overlap.
            unsafe { ptr::copy_nonoverlapping(ptr.cast::<u8>(), result.cast::<u8>(), len) };
        }
        result
    }

    /// `free` with bookkeeping. Bootstrap arena blocks are never released.
    ///
    /// # Safety
    ///
    /// Same contract as C `free`.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        if self.arena.contains(ptr) {
            return;
        }
        if let Some(real) = self.real.free()
            && !self.free_tracking.load(Ordering::Acquire)
        {
            return unsafe { real(ptr) };
        }

        let state = self.state.lock();
        let real = self.resolved(&state, Primitive::Free, as_free);
        self.retire(&state, ptr);
        unsafe { real(ptr) };
    }

    fn is_active(&self) -> bool {
        self.enabled.load(Ordering::Acquire) || self.free_tracking.load(Ordering::Acquire)
    }

    /// Fetch a real primitive, resolving it on first use. Must be called with
    /// the lock held.
    ///
    /// A call that arrives while another primitive is being resolved on this
    /// thread goes to the resolver's fallback without publishing anything, so
    /// resolution never recurses into itself.
    fn resolved<F>(
        &self,
        state: &LockedState<CAPACITY>,
        primitive: Primitive,
        typed: unsafe fn(NonNull<c_void>) -> F,
    ) -> F {
        if let Some(address) = self.real.get(primitive) {
            // SAFETY: `address` was published for this primitive.
            return unsafe { typed(address) };
        }
        if state.resolving.get() {
            // SAFETY: `Resolver` contract.
            return unsafe { typed(self.resolver.fallback(primitive)) };
        }

        state.resolving.set(true);
        let found = self.resolver.resolve(primitive);
        state.resolving.set(false);

        let address = found.unwrap_or_else(|| {
            self.abstain(primitive);
            self.resolver.fallback(primitive)
        });
        self.real.set(primitive, address);
        let published = self.real.get(primitive).unwrap_or(address);
        // SAFETY: `Resolver` contract.
        unsafe { typed(published) }
    }

    fn abstain(&self, primitive: Primitive) {
        let index = Primitive::ALL
            .iter()
            .position(|&p| p == primitive)
            .unwrap_or_default();
        let _ = self.unresolved.compare_exchange(
            0,
            index as u8 + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.abstained.store(true, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
        self.free_tracking.store(false, Ordering::Release);
    }

    /// Runs even when the tracer abstained, so the hook can report why.
    fn run_first_use_hook(&self) {
        if self.first_use_done.load(Ordering::Acquire)
            || self.first_use_done.swap(true, Ordering::AcqRel)
        {
            return;
        }
        self.resolver.on_first_use();
    }

    /// Insert a record for a fresh block if tracing is on and it passes the
    /// size filter.
    fn track(&self, state: &LockedState<CAPACITY>, address: *mut c_void, size: usize) {
        if address.is_null()
            || state.is_suppressed()
            || !self.enabled.load(Ordering::Acquire)
            || !self.filter().contains(size)
        {
            return;
        }

        let stack = if self.callstacks.load(Ordering::Relaxed) {
            state.suppressed(CallStack::capture)
        } else {
            CallStack::EMPTY
        };
        let entry = Entry {
            size,
            thread: ThreadIdentity::current(),
            timestamp_ns: now_ns(),
            stack,
        };

        // Any record still held for this address is stale: its block was
        // released while releases went untracked.
        state.store.invalidate(address as usize);
        match state.store.insert(address as usize, entry) {
            Ok(_) => self.counters.record_tracked(size),
            Err(_) => self.counters.record_dropped(),
        }
    }

    /// Retire the record for a block about to be released or resized.
    fn retire(&self, state: &LockedState<CAPACITY>, address: *mut c_void) {
        if address.is_null()
            || state.is_suppressed()
            || !self.free_tracking.load(Ordering::Acquire)
        {
            return;
        }
        if let Some(entry) = state.store.invalidate(address as usize) {
            self.counters.free.record(entry.size);
        }
    }
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resolve::Libc;

    fn tracer() -> Box<Tracer<Libc, 16>> {
        let tracer = Box::new(Tracer::new(Libc));
        tracer.configure(SizeFilter::new(1024, 8192), false);
        tracer
    }

    #[test]
    fn idle_tracer_only_counts() {
        let tracer = tracer();
        unsafe {
            let block = tracer.malloc(2048);
            assert!(!block.is_null());
            tracer.free(block);
        }
        let snapshot = tracer.snapshot();
        assert!(snapshot.records.is_empty());
        assert_eq!(snapshot.counters.malloc.count, 1);
        assert_eq!(snapshot.counters.free.count, 0);
        assert_eq!(tracer.phase(), Phase::Created);
    }

    #[test]
    fn filter_bounds_are_inclusive() {
        let tracer = tracer();
        assert!(tracer.start());
        let sizes = [1023, 1024, 8192, 8193];
        let blocks: Vec<_> = sizes
            .iter()
            .map(|&size| unsafe { tracer.malloc(size) })
            .collect();

        let snapshot = tracer.snapshot();
        let tracked: Vec<_> = snapshot.records.iter().map(|r| r.size).collect();
        assert_eq!(tracked, vec![1024, 8192]);
        assert_eq!(snapshot.counters.malloc.count, 4);
        assert_eq!(snapshot.counters.malloc.bytes, 1023 + 1024 + 8192 + 8193);
        assert_eq!(snapshot.counters.tracked_bytes, 1024 + 8192);

        for block in blocks {
            unsafe { tracer.free(block) };
        }
        assert_eq!(tracer.counters().free.count, 2);
    }

    #[test]
    fn calloc_is_filtered_on_total_size() {
        let tracer = tracer();
        tracer.start();
        let block = unsafe { tracer.calloc(4, 512) };
        let bytes = unsafe { std::slice::from_raw_parts(block.cast::<u8>(), 2048) };
        assert!(bytes.iter().all(|&b| b == 0));

        let snapshot = tracer.snapshot();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].size, 2048);
        assert_eq!(snapshot.counters.calloc.bytes, 2048);
        unsafe { tracer.free(block) };
    }

    #[test]
    fn realloc_moves_the_record() {
        let tracer = tracer();
        tracer.start();
        unsafe {
            let block = tracer.malloc(2048);
            block.cast::<u8>().write(0xAB);
            let grown = tracer.realloc(block, 4096);
            assert_eq!(grown.cast::<u8>().read(), 0xAB);

            let snapshot = tracer.snapshot();
            assert_eq!(snapshot.records.len(), 1);
            assert_eq!(snapshot.records[0].address, grown as usize);
            assert_eq!(snapshot.records[0].size, 4096);
            assert_eq!(snapshot.counters.free.count, 1);
            assert_eq!(snapshot.counters.realloc.count, 1);
            assert_eq!(snapshot.counters.outstanding_bytes(), 4096);

            tracer.free(grown);
        }
        assert!(tracer.snapshot().records.is_empty());
    }

    #[test]
    fn stop_keeps_records_and_still_retires_them() {
        let tracer = tracer();
        tracer.start();
        let kept = unsafe { tracer.malloc(2048) };
        let released = unsafe { tracer.malloc(4096) };
        tracer.stop();

        let late = unsafe { tracer.malloc(2048) };
        unsafe { tracer.free(released) };

        let addresses: Vec<_> = tracer.snapshot().records.iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![kept as usize]);
        unsafe {
            tracer.free(kept);
            tracer.free(late);
        }
    }

    #[test]
    fn restarting_forgets_records_released_while_finished() {
        let tracer = tracer();
        tracer.start();
        let first = unsafe { tracer.malloc(4000) };
        tracer.finish();
        unsafe { tracer.free(first) };
        assert_eq!(tracer.snapshot().records.len(), 1);

        assert!(tracer.start());
        let snapshot = tracer.snapshot();
        assert!(snapshot.records.is_empty());
        assert_eq!(snapshot.counters.outstanding_bytes(), 0);

        let second = unsafe { tracer.malloc(4000) };
        let snapshot = tracer.snapshot();
        let addresses: Vec<_> = snapshot.records.iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![second as usize]);
        assert_eq!(snapshot.counters.outstanding_bytes(), 4000);
        unsafe { tracer.free(second) };
        assert!(tracer.snapshot().records.is_empty());
    }

    #[test]
    fn reused_address_keeps_a_single_record() {
        let tracer = tracer();
        tracer.start();
        let block = unsafe { tracer.malloc(2048) };
        {
            let state = tracer.state.lock();
            tracer.track(&state, block, 4096);
        }

        let snapshot = tracer.snapshot();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].address, block as usize);
        assert_eq!(snapshot.records[0].size, 4096);
        unsafe { tracer.free(block) };
        assert!(tracer.snapshot().records.is_empty());
    }

    #[test]
    fn drain_clears_records_and_counters() {
        let tracer = tracer();
        tracer.start();
        let block = unsafe { tracer.malloc(2048) };
        let drained = tracer.drain();
        assert_eq!(drained.records.len(), 1);
        assert_eq!(drained.counters.malloc.count, 1);

        let after = tracer.snapshot();
        assert!(after.records.is_empty());
        assert_eq!(after.counters, GlobalCounters::default());
        unsafe { tracer.free(block) };
        assert_eq!(tracer.counters().free.count, 0);
    }

    #[test]
    fn callstacks_are_captured_when_enabled() {
        let tracer = tracer();
        tracer.configure(SizeFilter::new(1024, 8192), true);
        tracer.start();
        let block = unsafe { tracer.malloc(2048) };
        let snapshot = tracer.snapshot();
        assert!(!snapshot.records[0].stack.is_empty());
        assert_eq!(snapshot.records.len(), 1);
        unsafe { tracer.free(block) };
    }

    #[test]
    fn arena_blocks_are_moved_on_realloc_and_never_freed() {
        let tracer = tracer();
        let block = tracer.arena.grant(1, 24);
        unsafe { std::ptr::copy_nonoverlapping(b"bootstrap".as_ptr(), block.cast(), 9) };

        let moved = unsafe { tracer.realloc(block, 64) };
        assert!(!tracer.arena.contains(moved));
        let bytes = unsafe { std::slice::from_raw_parts(moved.cast::<u8>(), 9) };
        assert_eq!(bytes, b"bootstrap");

        unsafe {
            tracer.free(block);
            tracer.free(moved);
        }
        assert_eq!(tracer.bootstrap_usage().grants, 1);
    }

    #[derive(Default)]
    struct CountingFirstUse(AtomicUsize);

    unsafe impl Resolver for CountingFirstUse {
        fn resolve(&self, primitive: Primitive) -> Option<NonNull<c_void>> {
            Libc.resolve(primitive)
        }

        fn fallback(&self, primitive: Primitive) -> NonNull<c_void> {
            Libc.fallback(primitive)
        }

        fn on_first_use(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn first_use_hook_runs_once() {
        let tracer: Box<Tracer<CountingFirstUse, 4>> =
            Box::new(Tracer::new(CountingFirstUse::default()));
        unsafe {
            let a = tracer.malloc(8);
            let b = tracer.malloc(8);
            tracer.free(a);
            tracer.free(b);
        }
        assert_eq!(tracer.resolver.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn only_one_controller_can_claim_a_tracer() {
        let tracer = tracer();
        assert!(tracer.claim_controller());
        assert_eq!(tracer.phase(), Phase::WaitingToStart);
        assert!(!tracer.claim_controller());
    }

    #[test]
    fn unconfigured_tracer_uses_the_default_filter() {
        let tracer: Box<Tracer<Libc, 4>> = Box::new(Tracer::new(Libc));
        assert_eq!(tracer.filter(), SizeFilter::default());
    }

    struct Unresolvable;

    unsafe impl Resolver for Unresolvable {
        fn resolve(&self, _: Primitive) -> Option<NonNull<c_void>> {
            None
        }

        fn fallback(&self, primitive: Primitive) -> NonNull<c_void> {
            Libc.fallback(primitive)
        }
    }

    #[test]
    fn unresolvable_primitive_makes_the_tracer_abstain() {
        let tracer: Box<Tracer<Unresolvable, 4>> = Box::new(Tracer::new(Unresolvable));
        assert_eq!(tracer.unresolved(), None);
        let block = unsafe { tracer.malloc(32) };
        assert!(!block.is_null());
        assert!(tracer.is_abstained());
        assert_eq!(tracer.unresolved(), Some(Primitive::Malloc));
        assert!(!tracer.start());
        assert!(!tracer.is_enabled());
        unsafe { tracer.free(block) };
    }

    /// Resolves everything except `calloc`, and counts first-use calls.
    #[derive(Default)]
    struct NoCalloc(AtomicUsize);

    unsafe impl Resolver for NoCalloc {
        fn resolve(&self, primitive: Primitive) -> Option<NonNull<c_void>> {
            match primitive {
                Primitive::Calloc => None,
                _ => Libc.resolve(primitive),
            }
        }

        fn fallback(&self, primitive: Primitive) -> NonNull<c_void> {
            Libc.fallback(primitive)
        }

        fn on_first_use(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn late_resolution_failure_stops_tracing_and_names_the_primitive() {
        let tracer: Box<Tracer<NoCalloc, 4>> = Box::new(Tracer::new(NoCalloc::default()));
        tracer.configure(SizeFilter::new(1024, 8192), false);
        assert!(tracer.start());
        let block = unsafe { tracer.malloc(2048) };
        assert_eq!(tracer.unresolved(), None);

        let zeroed = unsafe { tracer.calloc(2, 1024) };
        assert!(!zeroed.is_null());
        assert!(tracer.is_abstained());
        assert!(!tracer.is_enabled());
        assert_eq!(tracer.unresolved(), Some(Primitive::Calloc));
        assert_eq!(tracer.resolver.0.load(Ordering::SeqCst), 1);
        unsafe {
            tracer.free(zeroed);
            tracer.free(block);
        }
    }
}
