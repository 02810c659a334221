//! The background thread that opens the tracking window and triggers
//! reports.

use std::{
    io,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{error, info, warn};

use crate::{
    config::{Config, ReportMode},
    report::Reporter,
    resolve::Resolver,
    tracer::{Phase, Tracer},
};

pub const THREAD_NAME: &str = "memcheck";

/// Drives one tracer through `WaitingToStart → Tracing → Dumping → Stopped`.
pub struct Controller<R: 'static, const CAPACITY: usize> {
    tracer: &'static Tracer<R, CAPACITY>,
    config: Config,
    reporter: Reporter,
}

impl<R: Resolver + 'static, const CAPACITY: usize> Controller<R, CAPACITY> {
    /// `None` when `tracer` already has a controller.
    pub fn new(tracer: &'static Tracer<R, CAPACITY>, config: Config) -> Option<Self> {
        if !tracer.claim_controller() {
            return None;
        }
        let reporter = Reporter::from_config(&config);
        Some(Controller {
            tracer,
            config,
            reporter,
        })
    }

    /// Run on a dedicated thread named `memcheck`.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        let config = &self.config;
        info!(
            pid = std::process::id(),
            startup_delay = ?config.startup_delay,
            duration = ?config.duration,
            end_delay = ?config.end_delay,
            min_size = config.filter.min,
            max_size = config.filter.max,
            mode = %config.mode,
            format = %config.format,
            callstacks = config.callstacks,
            output = %self.reporter.path().display(),
            "memcheck scheduled"
        );

        self.tracer.configure(config.filter, config.callstacks);
        self.tracer.set_phase(Phase::WaitingToStart);
        sleep_for(config.startup_delay);

        if !self.tracer.start() {
            self.report_unresolved();
            self.tracer.finish();
            return;
        }
        info!(capacity = self.tracer.capacity(), "memcheck tracing started");

        match self.config.mode {
            ReportMode::OneShot => self.run_once(),
            ReportMode::Continuous => self.run_continuously(),
        }

        self.tracer.finish();
        info!(dumps = self.reporter.dumps(), "memcheck stopped");
    }

    fn run_once(&mut self) {
        sleep_for(self.config.duration);
        if self.tracer.is_abstained() {
            self.report_unresolved();
            return;
        }
        self.tracer.stop();
        info!(end_delay = ?self.config.end_delay, "memcheck tracing stopped");
        sleep_for(self.config.end_delay);
        self.dump();
    }

    fn run_continuously(&mut self) {
        loop {
            sleep_for(self.config.duration);
            if self.tracer.is_abstained() {
                self.report_unresolved();
                return;
            }
            self.dump();
            if self
                .config
                .max_dumps
                .is_some_and(|max| self.reporter.dumps() >= max)
            {
                break;
            }
            self.tracer.set_phase(Phase::Tracing);
        }
    }

    fn report_unresolved(&self) {
        match self.tracer.unresolved() {
            Some(primitive) => error!(
                %primitive,
                "real allocation function could not be resolved, not tracing"
            ),
            None => error!("real allocation functions could not be resolved, not tracing"),
        }
    }

    fn dump(&mut self) {
        self.tracer.set_phase(Phase::Dumping);
        if let Err(error) = self.reporter.report(self.tracer) {
            warn!(%error, "memcheck report skipped");
        }
    }
}

/// Sleep until `duration` has passed, even if woken early.
fn sleep_for(duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(deadline - now);
    }
}
