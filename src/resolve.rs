//! Finding the real allocation primitives behind the interposed ones.

use std::{
    ffi::{CStr, c_void},
    fmt, mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

pub(crate) type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub(crate) type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub(crate) type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub(crate) type FreeFn = unsafe extern "C" fn(*mut c_void);

/// The four intercepted primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Malloc,
    Calloc,
    Realloc,
    Free,
}

impl Primitive {
    pub const ALL: [Primitive; 4] = [
        Primitive::Malloc,
        Primitive::Calloc,
        Primitive::Realloc,
        Primitive::Free,
    ];

    pub fn symbol(self) -> &'static CStr {
        match self {
            Primitive::Malloc => c"malloc",
            Primitive::Calloc => c"calloc",
            Primitive::Realloc => c"realloc",
            Primitive::Free => c"free",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol().to_str().unwrap_or("?"))
    }
}

/// Locates the implementation a primitive forwards to.
///
/// # Safety
///
/// Both methods must return the address of a function with the C
/// signature of the named primitive. `resolve` may itself call the
/// interposed primitives (the tracer serves those calls from its bootstrap
/// arena); `fallback` must not.
pub unsafe trait Resolver: Sync {
    fn resolve(&self, primitive: Primitive) -> Option<NonNull<c_void>>;

    /// Used when [`resolve`](Self::resolve) comes back empty.
    fn fallback(&self, primitive: Primitive) -> NonNull<c_void>;

    /// Called once, right after `malloc` is first resolved, with the tracer
    /// lock held. May allocate.
    fn on_first_use(&self) {}
}

/// Calls libc's primitives directly, for processes where the tracer is
/// embedded rather than interposed.
#[derive(Debug, Default, Clone, Copy)]
pub struct Libc;

unsafe impl Resolver for Libc {
    fn resolve(&self, primitive: Primitive) -> Option<NonNull<c_void>> {
        Some(self.fallback(primitive))
    }

    fn fallback(&self, primitive: Primitive) -> NonNull<c_void> {
        let address = match primitive {
            Primitive::Malloc => libc::malloc as MallocFn as usize,
            Primitive::Calloc => libc::calloc as CallocFn as usize,
            Primitive::Realloc => libc::realloc as ReallocFn as usize,
            Primitive::Free => libc::free as FreeFn as usize,
        };
        // SAFETY: function addresses are never null.
        unsafe { NonNull::new_unchecked(address as *mut c_void) }
    }
}

/// The next definition in the dynamic linker's search order, i.e. the one
/// an `LD_PRELOAD`ed library shadows.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct NextInChain;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
unsafe extern "C" {
    fn __libc_malloc(size: usize) -> *mut c_void;
    fn __libc_calloc(count: usize, size: usize) -> *mut c_void;
    fn __libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
    fn __libc_free(ptr: *mut c_void);
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
unsafe impl Resolver for NextInChain {
    fn resolve(&self, primitive: Primitive) -> Option<NonNull<c_void>> {
        // dlsym may call calloc for its error state; the tracer catches that.
        let address = unsafe { libc::dlsym(libc::RTLD_NEXT, primitive.symbol().as_ptr()) };
        NonNull::new(address)
    }

    fn fallback(&self, primitive: Primitive) -> NonNull<c_void> {
        let address = match primitive {
            Primitive::Malloc => __libc_malloc as MallocFn as usize,
            Primitive::Calloc => __libc_calloc as CallocFn as usize,
            Primitive::Realloc => __libc_realloc as ReallocFn as usize,
            Primitive::Free => __libc_free as FreeFn as usize,
        };
        // SAFETY: function addresses are never null.
        unsafe { NonNull::new_unchecked(address as *mut c_void) }
    }
}

/// One-time cells for the resolved primitives.
///
/// A plain atomic instead of `OnceLock`: resolution re-enters the
/// primitives on the resolving thread, and `OnceLock` would block on its
/// own in-progress initialization. Writers hold the tracer lock, readers
/// only need the atomic load.
pub(crate) struct RealPrimitives {
    malloc: AtomicPtr<c_void>,
    calloc: AtomicPtr<c_void>,
    realloc: AtomicPtr<c_void>,
    free: AtomicPtr<c_void>,
}

impl RealPrimitives {
    pub const fn new() -> Self {
        RealPrimitives {
            malloc: AtomicPtr::new(ptr::null_mut()),
            calloc: AtomicPtr::new(ptr::null_mut()),
            realloc: AtomicPtr::new(ptr::null_mut()),
            free: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn cell(&self, primitive: Primitive) -> &AtomicPtr<c_void> {
        match primitive {
            Primitive::Malloc => &self.malloc,
            Primitive::Calloc => &self.calloc,
            Primitive::Realloc => &self.realloc,
            Primitive::Free => &self.free,
        }
    }

    #[cfg(test)]
    pub fn is_resolved(&self, primitive: Primitive) -> bool {
        self.get(primitive).is_some()
    }

    /// Publish the address for `primitive`. Later calls keep the first
    /// value.
    pub fn set(&self, primitive: Primitive, address: NonNull<c_void>) {
        let _ = self.cell(primitive).compare_exchange(
            ptr::null_mut(),
            address.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn get(&self, primitive: Primitive) -> Option<NonNull<c_void>> {
        NonNull::new(self.cell(primitive).load(Ordering::Acquire))
    }

    pub fn malloc(&self) -> Option<MallocFn> {
        // SAFETY: only `Resolver` output for the matching primitive is stored.
        self.get(Primitive::Malloc).map(|a| unsafe { as_malloc(a) })
    }

    pub fn calloc(&self) -> Option<CallocFn> {
        self.get(Primitive::Calloc).map(|a| unsafe { as_calloc(a) })
    }

    pub fn realloc(&self) -> Option<ReallocFn> {
        self.get(Primitive::Realloc).map(|a| unsafe { as_realloc(a) })
    }

    pub fn free(&self) -> Option<FreeFn> {
        self.get(Primitive::Free).map(|a| unsafe { as_free(a) })
    }
}

/// # Safety
///
/// `address` must come from a [`Resolver`] for [`Primitive::Malloc`].
pub(crate) unsafe fn as_malloc(address: NonNull<c_void>) -> MallocFn {
    unsafe { mem::transmute::<*mut c_void, MallocFn>(address.as_ptr()) }
}

/// # Safety
///
/// `address` must come from a [`Resolver`] for [`Primitive::Calloc`].
pub(crate) unsafe fn as_calloc(address: NonNull<c_void>) -> CallocFn {
    unsafe { mem::transmute::<*mut c_void, CallocFn>(address.as_ptr()) }
}

/// # Safety
///
/// `address` must come from a [`Resolver`] for [`Primitive::Realloc`].
pub(crate) unsafe fn as_realloc(address: NonNull<c_void>) -> ReallocFn {
    unsafe { mem::transmute::<*mut c_void, ReallocFn>(address.as_ptr()) }
}

/// # Safety
///
/// `address` must come from a [`Resolver`] for [`Primitive::Free`].
pub(crate) unsafe fn as_free(address: NonNull<c_void>) -> FreeFn {
    unsafe { mem::transmute::<*mut c_void, FreeFn>(address.as_ptr()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libc_resolver_round_trips_through_the_cells() {
        let real = RealPrimitives::new();
        for primitive in Primitive::ALL {
            assert!(!real.is_resolved(primitive));
            real.set(primitive, Libc.resolve(primitive).unwrap());
            assert!(real.is_resolved(primitive));
        }

        let malloc = real.malloc().unwrap();
        let free = real.free().unwrap();
        unsafe {
            let block = malloc(64);
            assert!(!block.is_null());
            free(block);
        }
    }

    #[test]
    fn first_value_wins() {
        let real = RealPrimitives::new();
        let first = Libc.fallback(Primitive::Malloc);
        let second = Libc.fallback(Primitive::Calloc);
        real.set(Primitive::Malloc, first);
        real.set(Primitive::Malloc, second);
        assert_eq!(
            real.malloc().map(|f| f as usize),
            Some(first.as_ptr() as usize)
        );
    }

    #[test]
    fn symbols_match_c_names() {
        assert_eq!(Primitive::Calloc.symbol(), c"calloc");
        assert_eq!(Primitive::Free.to_string(), "free");
    }
}
