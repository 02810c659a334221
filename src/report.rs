//! Writing snapshots of the trace store to per-process artifacts.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::Serialize;
use tracing::info;

use crate::{
    bootstrap::BootstrapUsage,
    config::{Config, ReportFormat, ReportMode},
    counters::GlobalCounters,
    error::ReportError,
    profile::AllocationProfile,
    resolve::Resolver,
    store::AllocationRecord,
    symbols::Symbolizer,
    tracer::{Snapshot, Tracer},
};

/// Writes tracer snapshots to `{dir}/memcheck-info_{pid}` (text),
/// `{dir}/memcheck-info_{pid}.jsonl` (JSON lines) or
/// `{dir}/memcheck-profile_{pid}.json` (Firefox Profiler).
///
/// In one-shot mode each report overwrites the artifact and drains the
/// tracer. In continuous mode text and JSON reports are appended and the
/// tracer keeps its records; the profile always holds the latest snapshot.
#[derive(Debug)]
pub struct Reporter {
    dir: PathBuf,
    mode: ReportMode,
    format: ReportFormat,
    pid: u32,
    dumps: u32,
}

impl Reporter {
    pub fn new(dir: impl Into<PathBuf>, mode: ReportMode, format: ReportFormat) -> Self {
        Reporter {
            dir: dir.into(),
            mode,
            format,
            pid: std::process::id(),
            dumps: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Reporter::new(&config.output_dir, config.mode, config.format)
    }

    pub fn path(&self) -> PathBuf {
        let file = match self.format {
            ReportFormat::Text => format!("memcheck-info_{}", self.pid),
            ReportFormat::Json => format!("memcheck-info_{}.jsonl", self.pid),
            ReportFormat::Firefox => format!("memcheck-profile_{}.json", self.pid),
        };
        self.dir.join(file)
    }

    /// Number of reports written so far.
    pub fn dumps(&self) -> u32 {
        self.dumps
    }

    /// Snapshot `tracer` and write the report, returning how many live
    /// records it held.
    ///
    /// The artifact is opened before the snapshot is taken, so a one-shot
    /// report to an unwritable path leaves the tracer untouched.
    pub fn report<R: Resolver, const CAPACITY: usize>(
        &mut self,
        tracer: &Tracer<R, CAPACITY>,
    ) -> Result<usize, ReportError> {
        let path = self.path();
        let file = self.open(&path)?;

        let snapshot = match self.mode {
            ReportMode::OneShot => tracer.drain(),
            ReportMode::Continuous => tracer.snapshot(),
        };
        self.dumps += 1;

        let mut out = BufWriter::new(file);
        self.write(&snapshot, &mut out)
            .and_then(|()| out.flush().map_err(ReportError::io(&path)))?;

        info!(
            path = %path.display(),
            dump = self.dumps,
            records = snapshot.records.len(),
            dropped = snapshot.counters.dropped,
            "memcheck report written"
        );
        Ok(snapshot.records.len())
    }

    /// Render `snapshot` in the configured format.
    pub fn write(&self, snapshot: &Snapshot, out: &mut impl Write) -> Result<(), ReportError> {
        let mut symbolizer = Symbolizer::new();
        match self.format {
            ReportFormat::Text => self
                .write_text(snapshot, &mut symbolizer, out)
                .map_err(ReportError::io(self.path())),
            ReportFormat::Json => self.write_json(snapshot, &mut symbolizer, out),
            ReportFormat::Firefox => {
                let profile =
                    AllocationProfile::from_snapshot(snapshot, self.pid, &mut symbolizer)?;
                profile.write_json(out)
            }
        }
    }

    fn open(&self, path: &Path) -> Result<File, ReportError> {
        fs::create_dir_all(&self.dir).map_err(ReportError::io(&self.dir))?;
        let mut options = OpenOptions::new();
        options.create(true);
        if self.mode == ReportMode::Continuous && self.format != ReportFormat::Firefox {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        options.open(path).map_err(ReportError::io(path))
    }

    fn write_text(
        &self,
        snapshot: &Snapshot,
        symbolizer: &mut Symbolizer,
        out: &mut impl Write,
    ) -> std::io::Result<()> {
        let continuous = self.mode == ReportMode::Continuous;
        if continuous {
            writeln!(
                out,
                "memcheck dump: {} offset_ms: {}",
                self.dumps,
                snapshot.offset_ms(snapshot.taken_at_ns)
            )?;
        }

        for record in &snapshot.records {
            if continuous {
                write!(out, "memcheck offset_ms: {}, ", snapshot.offset_ms(record.timestamp_ns))?;
            }
            writeln!(
                out,
                "memcheck address: {:#x}, allocation size: {}, thread id: {}, thread name: {}",
                record.address, record.size, record.thread_id, record.thread_name
            )?;
            for &ip in &record.stack {
                writeln!(out, "  {ip:#x}({})", symbolizer.name(ip))?;
            }
        }

        let c = &snapshot.counters;
        writeln!(
            out,
            "memcheck statistics: malloc:{} calloc:{} realloc:{} free:{} \
             malloc_bytes:{} calloc_bytes:{} realloc_bytes:{} free_bytes:{} \
             outstanding_ops:{} outstanding_bytes:{} max_depth:{} not_released:{} dropped:{}",
            c.malloc.count,
            c.calloc.count,
            c.realloc.count,
            c.free.count,
            c.malloc.bytes,
            c.calloc.bytes,
            c.realloc.bytes,
            c.free.bytes,
            c.outstanding_ops(),
            c.outstanding_bytes(),
            snapshot.high_water,
            snapshot.records.len(),
            c.dropped,
        )?;
        writeln!(
            out,
            "memcheck statistics: tmp calloc {} {}",
            snapshot.bootstrap.bytes, snapshot.bootstrap.grants
        )
    }

    fn write_json(
        &self,
        snapshot: &Snapshot,
        symbolizer: &mut Symbolizer,
        out: &mut impl Write,
    ) -> Result<(), ReportError> {
        let io_error = || ReportError::io(self.path());

        for record in &snapshot.records {
            let symbols = record
                .stack
                .iter()
                .map(|&ip| symbolizer.name(ip).to_string())
                .collect();
            let line = JsonLine::Record {
                dump: self.dumps,
                offset_ms: snapshot.offset_ms(record.timestamp_ns),
                record,
                symbols,
            };
            serde_json::to_writer(&mut *out, &line)?;
            out.write_all(b"\n").map_err(io_error())?;
        }

        let summary = JsonLine::Summary {
            dump: self.dumps,
            mode: self.mode,
            offset_ms: snapshot.offset_ms(snapshot.taken_at_ns),
            counters: &snapshot.counters,
            outstanding_ops: snapshot.counters.outstanding_ops(),
            outstanding_bytes: snapshot.counters.outstanding_bytes(),
            max_depth: snapshot.high_water,
            not_released: snapshot.records.len(),
            bootstrap: &snapshot.bootstrap,
        };
        serde_json::to_writer(&mut *out, &summary)?;
        out.write_all(b"\n").map_err(io_error())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonLine<'a> {
    Record {
        dump: u32,
        offset_ms: u64,
        #[serde(flatten)]
        record: &'a AllocationRecord,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        symbols: Vec<String>,
    },
    Summary {
        dump: u32,
        mode: ReportMode,
        offset_ms: u64,
        counters: &'a GlobalCounters,
        outstanding_ops: u64,
        outstanding_bytes: u64,
        max_depth: usize,
        not_released: usize,
        bootstrap: &'a BootstrapUsage,
    },
}
