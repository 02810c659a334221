use std::{
    ffi::c_void,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use memcheck::{Libc, Primitive, Resolver, SizeFilter, Tracer};

/// Behaves like `dlsym`: asks for zeroed scratch memory while resolving,
/// and releases a real block while resolving `free`.
struct ReentrantResolver;

static NESTED_GRANT: AtomicUsize = AtomicUsize::new(0);

unsafe impl Resolver for ReentrantResolver {
    fn resolve(&self, primitive: Primitive) -> Option<NonNull<c_void>> {
        match primitive {
            Primitive::Calloc => {
                let scratch = unsafe { TRACER.calloc(1, 64) };
                NESTED_GRANT.store(scratch as usize, Ordering::SeqCst);
                unsafe { TRACER.free(scratch) };
            }
            Primitive::Free => {
                let real = unsafe { libc::malloc(32) };
                unsafe { TRACER.free(real) };
            }
            Primitive::Malloc | Primitive::Realloc => {}
        }
        Libc.resolve(primitive)
    }

    fn fallback(&self, primitive: Primitive) -> NonNull<c_void> {
        Libc.fallback(primitive)
    }
}

static TRACER: Tracer<ReentrantResolver, 64> = Tracer::new(ReentrantResolver);

#[test]
fn nested_calls_during_resolution_are_contained() {
    TRACER.configure(SizeFilter::new(1, 1 << 20), false);

    let block = unsafe { TRACER.calloc(4, 16) };
    assert!(!block.is_null());
    let bytes = unsafe { std::slice::from_raw_parts(block.cast::<u8>(), 64) };
    assert!(bytes.iter().all(|&b| b == 0));

    let scratch = NESTED_GRANT.load(Ordering::SeqCst);
    assert_ne!(scratch, 0);
    assert_ne!(scratch, block as usize);
    assert_eq!(scratch % 16, 0);
    let usage = TRACER.bootstrap_usage();
    assert_eq!(usage.grants, 1);
    assert_eq!(usage.bytes, 64 + 16);

    // The arena block is moved into real memory, never handed to realloc.
    let moved = unsafe { TRACER.realloc(scratch as *mut c_void, 256) };
    assert!(!moved.is_null());
    assert_ne!(moved as usize, scratch);
    let moved_bytes = unsafe { std::slice::from_raw_parts(moved.cast::<u8>(), 64) };
    assert!(moved_bytes.iter().all(|&b| b == 0));

    assert!(TRACER.start());
    unsafe {
        TRACER.free(moved);
        TRACER.free(block);
    }
    assert!(!TRACER.is_abstained());
    assert_eq!(TRACER.bootstrap_usage().grants, 1);
}
