#![doc = include_str!("../README.md")]

mod bootstrap;
mod config;
mod controller;
mod counters;
mod error;
mod lock;
pub mod logging;
#[cfg(all(feature = "preload", target_os = "linux", target_env = "gnu"))]
mod preload;
mod profile;
mod report;
mod resolve;
mod stack;
mod store;
mod symbols;
mod thread;
mod tracer;

pub use bootstrap::{BOOTSTRAP_ARENA_BYTES, BootstrapArena, BootstrapUsage};
pub use config::{Config, ReportFormat, ReportMode};
pub use controller::Controller;
pub use counters::{GlobalCounters, OpTotals};
pub use error::{ConfigError, ReportError};
pub use profile::AllocationProfile;
pub use report::Reporter;
#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub use resolve::NextInChain;
pub use resolve::{Libc, Primitive, Resolver};
pub use stack::{CallStack, MAX_CALLSTACK};
pub use store::{AllocationRecord, DEFAULT_CAPACITY, Entry, StoreFull, TraceStore};
pub use symbols::{ResolvedFrame, Symbolizer};
pub use thread::ThreadIdentity;
pub use tracer::{DEFAULT_SIZE_MAX, DEFAULT_SIZE_MIN, Phase, SizeFilter, Snapshot, Tracer};

/// Names of the `WPE_MEMCHECK_*` environment variables.
pub mod env {
    pub use crate::config::{
        CALLSTACK_VAR, DUMPS_VAR, DURATION_VAR, END_DELAY_VAR, FORMAT_VAR, LOG_VAR, MAX_SIZE_VAR,
        MIN_SIZE_VAR, MODE_VAR, OUTPUT_DIR_VAR, STARTUP_DELAY_VAR,
    };
}
