//! The C ABI exported when the library is injected with `LD_PRELOAD`.

use std::{
    ffi::{c_int, c_void},
    ptr::NonNull,
    sync::Mutex,
};

use tracing::{error, warn};

use crate::{
    config::Config,
    controller::Controller,
    logging,
    report::Reporter,
    resolve::{NextInChain, Primitive, Resolver},
    tracer::Tracer,
};

/// `NextInChain` plus the controller launch on first use.
struct Interposed;

unsafe impl Resolver for Interposed {
    fn resolve(&self, primitive: Primitive) -> Option<NonNull<c_void>> {
        NextInChain.resolve(primitive)
    }

    fn fallback(&self, primitive: Primitive) -> NonNull<c_void> {
        NextInChain.fallback(primitive)
    }

    fn on_first_use(&self) {
        let config = Config::from_env();
        logging::init(config.log_level);
        let Some(controller) = Controller::new(&TRACER, config) else {
            return;
        };
        if let Err(error) = controller.spawn() {
            error!(%error, "cannot spawn memcheck controller thread");
        }
    }
}

static TRACER: Tracer<Interposed> = Tracer::new(Interposed);

/// Reporter for `memcheck_control_show`, created on first use.
static SHOW: Mutex<Option<Reporter>> = Mutex::new(None);

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    unsafe { TRACER.malloc(size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    unsafe { TRACER.calloc(count, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { TRACER.realloc(ptr, size) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    unsafe { TRACER.free(ptr) }
}

/// Open the tracking window now. Returns 0, or -1 if the tracer abstained.
#[unsafe(no_mangle)]
pub extern "C" fn memcheck_control_start() -> c_int {
    if TRACER.start() { 0 } else { -1 }
}

/// Stop recording new allocations; live records stay.
#[unsafe(no_mangle)]
pub extern "C" fn memcheck_control_stop() {
    TRACER.stop();
}

/// Write a report using the environment's configuration. Returns the
/// number of live records reported, or -1 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn memcheck_control_show() -> c_int {
    let Ok(mut slot) = SHOW.lock() else {
        return -1;
    };
    let reporter = slot.get_or_insert_with(|| Reporter::from_config(&Config::from_env()));
    match reporter.report(&TRACER) {
        Ok(records) => c_int::try_from(records).unwrap_or(c_int::MAX),
        Err(error) => {
            warn!(%error, "memcheck report failed");
            -1
        }
    }
}
