//! Turning captured return addresses into names for reports.

use std::{collections::HashMap, ffi::c_void, path::PathBuf};

use rustc_demangle::try_demangle;

/// What the debug info says about one return address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub address: usize,
    /// Demangled name, or the address in hex when nothing is known.
    pub name: String,
    pub filename: Option<PathBuf>,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
}

/// Caches resolutions for the lifetime of one report; a report usually
/// repeats the same handful of call sites many times.
#[derive(Debug, Default)]
pub struct Symbolizer {
    cache: HashMap<usize, ResolvedFrame>,
}

impl Symbolizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&mut self, address: usize) -> &ResolvedFrame {
        self.cache
            .entry(address)
            .or_insert_with(|| resolve_uncached(address))
    }

    pub fn name(&mut self, address: usize) -> &str {
        &self.resolve(address).name
    }
}

fn resolve_uncached(address: usize) -> ResolvedFrame {
    let mut frame = ResolvedFrame {
        address,
        name: String::new(),
        filename: None,
        lineno: None,
        colno: None,
    };

    // Inlined frames report several symbols for one address; the first one
    // is the innermost, which is what the caller actually executed.
    backtrace::resolve(address as *mut c_void, |symbol| {
        if !frame.name.is_empty() {
            return;
        }
        if let Some(name) = symbol.name().and_then(|name| name.as_str()) {
            frame.name = demangle_name(name);
        }
        frame.filename = symbol.filename().map(|f| f.to_owned());
        frame.lineno = symbol.lineno();
        frame.colno = symbol.colno();
    });

    if frame.name.is_empty() {
        frame.name = format!("{address:#x}");
    }
    frame
}

/// Demangle a Rust symbol, dropping the `::h<hash>` suffix. Anything else
/// is returned untouched.
fn demangle_name(name: &str) -> String {
    match try_demangle(name) {
        Ok(demangled) => format!("{demangled:#}"),
        Err(_) => name.to_string(),
    }
}
