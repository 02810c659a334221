use std::{
    cell::UnsafeCell,
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::Serialize;

/// Size of the arena that serves allocations made while the real
/// primitives are still being resolved.
pub const BOOTSTRAP_ARENA_BYTES: usize = 32 * 1024;

/// Every grant starts on this boundary, which matches what `malloc`
/// promises on 64-bit glibc.
const GRANT_ALIGN: usize = 16;
/// Room in front of each grant for its requested size.
const HEADER: usize = GRANT_ALIGN;

#[repr(C, align(16))]
struct Bytes<const N: usize>([u8; N]);

/// Fixed bump arena for the bootstrap hazard: `dlsym` may ask for
/// (zeroed) memory while we are resolving the very functions that would
/// provide it.
///
/// Grants are never freed; once the arena is exhausted further grants
/// return null.
pub struct BootstrapArena<const N: usize = BOOTSTRAP_ARENA_BYTES> {
    bytes: UnsafeCell<Bytes<N>>,
    offset: AtomicUsize,
    grants: AtomicUsize,
}

// Grants never overlap: each caller reserves its range with a CAS on
// `offset` before touching the bytes.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

/// How much of the arena has been handed out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootstrapUsage {
    pub bytes: usize,
    pub grants: usize,
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        BootstrapArena {
            bytes: UnsafeCell::new(Bytes([0; N])),
            offset: AtomicUsize::new(0),
            grants: AtomicUsize::new(0),
        }
    }

    /// Hand out `count * size` zeroed bytes, or null when the request
    /// overflows or does not fit.
    pub fn grant(&self, count: usize, size: usize) -> *mut c_void {
        let Some(requested) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        let Some(footprint) = requested
            .checked_add(GRANT_ALIGN - 1)
            .map(|s| (s & !(GRANT_ALIGN - 1)) + HEADER)
        else {
            return ptr::null_mut();
        };

        let mut start = self.offset.load(Ordering::Relaxed);
        loop {
            let end = match start.checked_add(footprint) {
                Some(end) if end <= N => end,
                _ => return ptr::null_mut(),
            };
            match self.offset.compare_exchange_weak(
                start,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => start = current,
            }
        }
        self.grants.fetch_add(1, Ordering::Relaxed);

        let base = self.base();
        // SAFETY: [start, start + footprint) lies inside the arena and was
        // reserved for us alone by the CAS.
        unsafe {
            let header = base.add(start);
            header.cast::<usize>().write(requested);
            let block = header.add(HEADER);
            block.write_bytes(0, footprint - HEADER);
            block.cast()
        }
    }

    /// Pure range check.
    pub fn contains(&self, ptr: *const c_void) -> bool {
        let base = self.base() as usize;
        let address = ptr as usize;
        address >= base && address < base + N
    }

    /// Requested size of a block handed out by [`grant`](Self::grant), or
    /// 0 for pointers outside the arena.
    pub fn block_size(&self, ptr: *const c_void) -> usize {
        if !self.contains(ptr) || (ptr as usize) < self.base() as usize + HEADER {
            return 0;
        }
        // SAFETY: every grant is preceded by its header inside the arena.
        unsafe { ptr.cast::<u8>().sub(HEADER).cast::<usize>().read() }
    }

    pub fn usage(&self) -> BootstrapUsage {
        BootstrapUsage {
            bytes: self.offset.load(Ordering::Relaxed),
            grants: self.grants.load(Ordering::Relaxed),
        }
    }

    fn base(&self) -> *mut u8 {
        self.bytes.get().cast()
    }
}
