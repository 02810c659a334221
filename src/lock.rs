use std::{
    cell::UnsafeCell,
    hint,
    ops::Deref,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

const SPINS_BEFORE_YIELD: u32 = 64;

/// A reentrant lock that never allocates.
///
/// The interposed primitives take this lock on their slow path, and work
/// done while holding it (stack capture, symbol resolution) can call back
/// into the same primitives on the same thread. The owner re-enters by
/// bumping a depth counter; other threads spin and then yield.
///
/// The guard only hands out shared references, so the protected data uses
/// `Cell`s for mutation.
pub(crate) struct ReentrantLock<T> {
    owner: AtomicUsize,
    depth: UnsafeCell<usize>,
    data: T,
}

// Only the owning thread touches `depth` and the data behind the guard.
unsafe impl<T: Send> Send for ReentrantLock<T> {}
unsafe impl<T: Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    pub const fn new(data: T) -> Self {
        ReentrantLock {
            owner: AtomicUsize::new(0),
            depth: UnsafeCell::new(0),
            data,
        }
    }

    pub fn lock(&self) -> ReentrantLockGuard<'_, T> {
        let me = current_thread();
        if self.owner.load(Ordering::Relaxed) == me {
            // SAFETY: we own the lock, nobody else reads or writes `depth`.
            unsafe { *self.depth.get() += 1 };
            return ReentrantLockGuard { lock: self };
        }

        let mut spins = 0;
        while self
            .owner
            .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                hint::spin_loop();
            } else {
                // sched_yield, no allocation involved
                thread::yield_now();
            }
        }

        // SAFETY: the CAS above made us the owner.
        unsafe { *self.depth.get() = 1 };
        ReentrantLockGuard { lock: self }
    }

    /// Whether the calling thread currently holds the lock.
    #[cfg(test)]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread()
    }
}

pub(crate) struct ReentrantLockGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
}

impl<T> Deref for ReentrantLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for ReentrantLockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: a guard only exists on the owning thread.
        let depth = unsafe { &mut *self.lock.depth.get() };
        *depth -= 1;
        if *depth == 0 {
            self.lock.owner.store(0, Ordering::Release);
        }
    }
}

/// `pthread_self` is non-zero on every live thread and needs no TLS setup,
/// unlike `std::thread::current`.
fn current_thread() -> usize {
    unsafe { libc::pthread_self() as usize }
}
