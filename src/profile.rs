use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use fxprof_processed_profile::{
    CategoryColor, CategoryHandle, CategoryPairHandle, Frame as FxFrame,
    FrameFlags as FxFrameFlags, FrameInfo as FxFrameInfo, LibraryHandle, LibraryInfo,
    ProcessHandle, Profile, ReferenceTimestamp, SamplingInterval, StackHandle, Symbol,
    SymbolTable, ThreadHandle, Timestamp, debugid::DebugId,
};

use crate::{
    error::ReportError,
    store::AllocationRecord,
    symbols::{ResolvedFrame, Symbolizer},
    tracer::Snapshot,
};

/// Surviving allocations as a Firefox Profiler profile: one thread per
/// allocating thread, one allocation sample per live record.
#[derive(Debug)]
pub struct AllocationProfile {
    inner: Profile,
}

impl AllocationProfile {
    pub fn from_snapshot(
        snapshot: &Snapshot,
        pid: u32,
        symbolizer: &mut Symbolizer,
    ) -> Result<Self, ReportError> {
        let mut builder = ProfileBuilder::new(snapshot, pid)?;
        for record in &snapshot.records {
            builder.add_record(record, symbolizer);
        }
        Ok(Self {
            inner: builder.finish(),
        })
    }

    pub fn write_json<W: Write>(&self, writer: W) -> Result<(), ReportError> {
        serde_json::to_writer(writer, &self.inner)?;
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string(&self.inner)?)
    }

    pub fn as_profile(&self) -> &Profile {
        &self.inner
    }
}

struct ProfileBuilder {
    profile: Profile,
    process: ProcessHandle,
    pid: u32,
    epoch_ns: u64,
    threads: HashMap<u32, ThreadHandle>,
    categories: CategoryHandles,
    cwd: PathBuf,
    symbol_registry: SymbolRegistry,
    /// Nanoseconds since the epoch of the latest sample or the snapshot,
    /// whichever is later.
    end_ns: u64,
}

impl ProfileBuilder {
    fn new(snapshot: &Snapshot, pid: u32) -> Result<Self, ReportError> {
        let reference = UNIX_EPOCH + Duration::from_nanos(snapshot.epoch_ns);
        let mut profile = Profile::new(
            "memcheck live allocations",
            ReferenceTimestamp::from(reference),
            SamplingInterval::from_millis(1),
        );
        profile.set_symbolicated(true);

        let start = Timestamp::from_nanos_since_reference(0);
        let process = profile.add_process("memcheck", pid, start);
        let categories = CategoryHandles::new(&mut profile);
        let cwd = std::env::current_dir().map_err(|e| {
            ReportError::Profile(format!("failed to get current directory: {e}").into())
        })?;

        Ok(Self {
            profile,
            process,
            pid,
            epoch_ns: snapshot.epoch_ns,
            threads: HashMap::new(),
            categories,
            cwd,
            symbol_registry: SymbolRegistry::new(),
            end_ns: snapshot.taken_at_ns.saturating_sub(snapshot.epoch_ns),
        })
    }

    fn add_record(&mut self, record: &AllocationRecord, symbolizer: &mut Symbolizer) {
        let offset_ns = record.timestamp_ns.saturating_sub(self.epoch_ns);
        self.end_ns = self.end_ns.max(offset_ns);
        let timestamp = Timestamp::from_nanos_since_reference(offset_ns);
        let thread = self.thread(record);
        let stack = self.build_stack(thread, &record.stack, symbolizer);

        self.profile.add_allocation_sample(
            thread,
            timestamp,
            stack,
            record.address as u64,
            i64::try_from(record.size).unwrap_or(i64::MAX),
        );
    }

    fn thread(&mut self, record: &AllocationRecord) -> ThreadHandle {
        *self.threads.entry(record.thread_id).or_insert_with(|| {
            let start = Timestamp::from_nanos_since_reference(0);
            let is_main = record.thread_id == self.pid;
            let handle = self
                .profile
                .add_thread(self.process, record.thread_id, start, is_main);
            let name = if record.thread_name.is_empty() {
                format!("thread {}", record.thread_id)
            } else {
                record.thread_name.clone()
            };
            self.profile.set_thread_name(handle, &name);
            self.profile.add_initial_visible_thread(handle);
            if is_main {
                self.profile.add_initial_selected_thread(handle);
            }
            handle
        })
    }

    /// Intern `frames` (innermost first) as a root-first stack.
    fn build_stack(
        &mut self,
        thread: ThreadHandle,
        frames: &[usize],
        symbolizer: &mut Symbolizer,
    ) -> Option<StackHandle> {
        if frames.is_empty() {
            return None;
        }
        let frames: Vec<FxFrameInfo> = frames
            .iter()
            .rev()
            .map(|&ip| {
                let resolved = symbolizer.resolve(ip);
                let category = determine_category(&self.cwd, resolved);
                FxFrameInfo {
                    frame: self.symbol_registry.resolve_frame(&mut self.profile, resolved),
                    category_pair: self.categories.get(category),
                    flags: FxFrameFlags::empty(),
                }
            })
            .collect();
        self.profile.intern_stack_frames(thread, frames.into_iter())
    }

    fn finish(mut self) -> Profile {
        let last = Timestamp::from_nanos_since_reference(self.end_ns);
        for &thread in self.threads.values() {
            self.profile.set_thread_end_time(thread, last);
        }
        self.profile.set_process_end_time(self.process, last);
        self.symbol_registry.finalize(&mut self.profile);
        self.profile
    }
}

/// Source files stand in for libraries so the profiler can show file and
/// line information; each distinct (name, line, column) gets a synthetic
/// address in its file's symbol table.
struct SymbolRegistry {
    libraries: HashMap<PathBuf, LibraryEntry>,
}

impl SymbolRegistry {
    fn new() -> Self {
        Self {
            libraries: HashMap::new(),
        }
    }

    fn resolve_frame(&mut self, profile: &mut Profile, frame: &ResolvedFrame) -> FxFrame {
        let Some(path) = frame.filename.as_deref() else {
            return FxFrame::Label(profile.intern_string(&frame.name));
        };

        let entry = self.ensure_library(profile, path);
        let key = SymbolKey {
            name: frame.name.clone(),
            lineno: frame.lineno,
            colno: frame.colno,
        };
        let address = match entry.symbol_map.get(&key) {
            Some(address) => *address,
            None => {
                let address =
                    next_symbol_address(&mut entry.next_address, frame.lineno, frame.colno);
                entry.symbol_map.insert(key, address);
                entry.symbols.push(Symbol {
                    address,
                    size: None,
                    name: frame.name.clone(),
                });
                entry.dirty = true;
                address
            }
        };

        FxFrame::RelativeAddressFromInstructionPointer(entry.handle, address)
    }

    fn ensure_library(&mut self, profile: &mut Profile, path: &Path) -> &mut LibraryEntry {
        self.libraries.entry(path.to_path_buf()).or_insert_with(|| {
            let display_path = path.to_string_lossy().to_string();
            let handle = profile.add_lib(LibraryInfo {
                name: display_path.clone(),
                debug_name: display_path.clone(),
                path: display_path.clone(),
                debug_path: display_path,
                debug_id: DebugId::nil(),
                code_id: None,
                arch: None,
                symbol_table: None,
            });
            LibraryEntry {
                handle,
                symbols: Vec::new(),
                symbol_map: HashMap::new(),
                next_address: 1,
                dirty: false,
            }
        })
    }

    fn finalize(&mut self, profile: &mut Profile) {
        for entry in self.libraries.values_mut().filter(|entry| entry.dirty) {
            let table = Arc::new(SymbolTable::new(entry.symbols.clone()));
            profile.set_lib_symbol_table(entry.handle, table);
            entry.dirty = false;
        }
    }
}

struct LibraryEntry {
    handle: LibraryHandle,
    symbols: Vec<Symbol>,
    symbol_map: HashMap<SymbolKey, u32>,
    next_address: u32,
    dirty: bool,
}

#[derive(Hash, Eq, PartialEq)]
struct SymbolKey {
    name: String,
    lineno: Option<u32>,
    colno: Option<u32>,
}

fn next_symbol_address(next: &mut u32, lineno: Option<u32>, colno: Option<u32>) -> u32 {
    const COLUMN_STRIDE: u32 = 1_000;

    if let Some(base) = lineno.and_then(|line| line.checked_mul(COLUMN_STRIDE)) {
        return base.saturating_add(colno.unwrap_or(0).min(COLUMN_STRIDE - 1));
    }
    let address = *next;
    *next = next.saturating_add(1);
    address
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CategoryKind {
    Tracer,
    Application,
    RustRuntime,
    System,
    Unknown,
}

struct CategoryHandles {
    tracer: CategoryPairHandle,
    application: CategoryPairHandle,
    rust_runtime: CategoryPairHandle,
    system: CategoryPairHandle,
    unknown: CategoryPairHandle,
}

impl CategoryHandles {
    fn new(profile: &mut Profile) -> Self {
        Self {
            tracer: profile.add_category("memcheck", CategoryColor::Purple).into(),
            application: profile
                .add_category("Application", CategoryColor::Green)
                .into(),
            rust_runtime: profile
                .add_category("Rust runtime", CategoryColor::Blue)
                .into(),
            system: profile.add_category("System", CategoryColor::Orange).into(),
            unknown: CategoryHandle::OTHER.into(),
        }
    }

    fn get(&self, kind: CategoryKind) -> CategoryPairHandle {
        match kind {
            CategoryKind::Tracer => self.tracer,
            CategoryKind::Application => self.application,
            CategoryKind::RustRuntime => self.rust_runtime,
            CategoryKind::System => self.system,
            CategoryKind::Unknown => self.unknown,
        }
    }
}

fn determine_category(cwd: &Path, frame: &ResolvedFrame) -> CategoryKind {
    if frame.name.starts_with("memcheck::") {
        return CategoryKind::Tracer;
    }
    let Some(path) = frame.filename.as_deref() else {
        return CategoryKind::Unknown;
    };

    let normalized = path.to_string_lossy();
    if normalized.contains("/rustc/") || normalized.contains("/rustlib/") {
        CategoryKind::RustRuntime
    } else if path.starts_with(cwd) {
        CategoryKind::Application
    } else if path.starts_with("/usr") || path.starts_with("/lib") {
        CategoryKind::System
    } else {
        CategoryKind::Unknown
    }
}
