//! Controller configuration, read once from `WPE_MEMCHECK_*` variables.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::Serialize;
use tracing::{level_filters::LevelFilter, warn};

use crate::{error::ConfigError, tracer::SizeFilter};

pub const MIN_SIZE_VAR: &str = "WPE_MEMCHECK_MIN_SIZE";
pub const MAX_SIZE_VAR: &str = "WPE_MEMCHECK_MAX_SIZE";
pub const STARTUP_DELAY_VAR: &str = "WPE_MEMCHECK_STARTUP_DELAY";
pub const DURATION_VAR: &str = "WPE_MEMCHECK_DURATION";
pub const END_DELAY_VAR: &str = "WPE_MEMCHECK_END_DELAY";
pub const CALLSTACK_VAR: &str = "WPE_MEMCHECK_CALLSTACK";
pub const MODE_VAR: &str = "WPE_MEMCHECK_MODE";
pub const DUMPS_VAR: &str = "WPE_MEMCHECK_DUMPS";
pub const FORMAT_VAR: &str = "WPE_MEMCHECK_FORMAT";
pub const OUTPUT_DIR_VAR: &str = "WPE_MEMCHECK_OUTPUT_DIR";
pub const LOG_VAR: &str = "WPE_MEMCHECK_LOG";

pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_OUTPUT_DIR: &str = "/tmp/wpe";

/// What happens to the store when a report is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    /// Trace once for the duration, stop, report, clear the store.
    #[default]
    OneShot,
    /// Keep tracing and append a non-destructive snapshot every period.
    Continuous,
}

impl FromStr for ReportMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "oneshot" | "one-shot" | "once" => Ok(ReportMode::OneShot),
            "continuous" => Ok(ReportMode::Continuous),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ReportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportMode::OneShot => f.write_str("oneshot"),
            ReportMode::Continuous => f.write_str("continuous"),
        }
    }
}

/// Artifact format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
    /// Firefox Profiler processed-profile JSON.
    Firefox,
}

impl FromStr for ReportFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(ReportFormat::Text),
            "json" | "jsonl" => Ok(ReportFormat::Json),
            "firefox" => Ok(ReportFormat::Firefox),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Text => f.write_str("text"),
            ReportFormat::Json => f.write_str("json"),
            ReportFormat::Firefox => f.write_str("firefox"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub filter: SizeFilter,
    pub startup_delay: Duration,
    /// Observation window in one-shot mode, dump period in continuous mode.
    pub duration: Duration,
    /// One-shot only: grace period between stopping and reporting, so
    /// releases of blocks allocated late in the window are still matched.
    pub end_delay: Duration,
    pub callstacks: bool,
    pub mode: ReportMode,
    /// Continuous only: stop after this many dumps. `None` runs forever.
    pub max_dumps: Option<u32>,
    pub format: ReportFormat,
    pub output_dir: PathBuf,
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            filter: SizeFilter::default(),
            startup_delay: DEFAULT_STARTUP_DELAY,
            duration: DEFAULT_DURATION,
            end_delay: Duration::ZERO,
            callstacks: false,
            mode: ReportMode::default(),
            max_dumps: None,
            format: ReportFormat::default(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            log_level: LevelFilter::INFO,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from `lookup`, which maps a variable name to
    /// its value. Unusable values are logged and the key keeps its default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let read = |key: &'static str| lookup(key).map(|value| (key, value));

        if let Some((key, value)) = read(MIN_SIZE_VAR) {
            apply(&mut config.filter.min, parse_number(key, &value));
        }
        if let Some((key, value)) = read(MAX_SIZE_VAR) {
            apply(&mut config.filter.max, parse_number(key, &value));
        }
        if config.filter.min > config.filter.max {
            let error = ConfigError::InvertedRange {
                min: config.filter.min,
                max: config.filter.max,
            };
            warn!(%error, "using default size range");
            config.filter = SizeFilter::default();
        }

        if let Some((key, value)) = read(STARTUP_DELAY_VAR) {
            apply(&mut config.startup_delay, parse_seconds(key, &value));
        }
        if let Some((key, value)) = read(DURATION_VAR) {
            apply(&mut config.duration, parse_seconds(key, &value));
        }
        if let Some((key, value)) = read(END_DELAY_VAR) {
            apply(&mut config.end_delay, parse_seconds(key, &value));
        }
        if let Some((key, value)) = read(CALLSTACK_VAR) {
            apply(&mut config.callstacks, parse_bool(key, &value));
        }
        if let Some((key, value)) = read(MODE_VAR) {
            apply(
                &mut config.mode,
                parse_with(key, &value, "`oneshot` or `continuous`"),
            );
        }
        if let Some((key, value)) = read(DUMPS_VAR) {
            apply(
                &mut config.max_dumps,
                parse_number::<u32>(key, &value).map(|n| (n > 0).then_some(n)),
            );
        }
        if let Some((key, value)) = read(FORMAT_VAR) {
            apply(
                &mut config.format,
                parse_with(key, &value, "`text`, `json` or `firefox`"),
            );
        }
        if let Some((key, value)) = read(OUTPUT_DIR_VAR) {
            if value.is_empty() {
                apply(
                    &mut config.output_dir,
                    Err(ConfigError::Invalid {
                        key,
                        value,
                        expected: "a directory path",
                    }),
                );
            } else {
                config.output_dir = PathBuf::from(value);
            }
        }
        if let Some((key, value)) = read(LOG_VAR) {
            apply(
                &mut config.log_level,
                value.parse().map_err(|_| ConfigError::Invalid {
                    key,
                    value,
                    expected: "a log level",
                }),
            );
        }

        config
    }
}

fn apply<T>(slot: &mut T, parsed: Result<T, ConfigError>) {
    match parsed {
        Ok(value) => *slot = value,
        Err(error) => warn!(%error, "ignoring configuration value"),
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
        expected: "a non-negative integer",
    })
}

fn parse_seconds(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_number(key, value).map(Duration::from_secs)
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            expected: "a boolean",
        }),
    }
}

fn parse_with<T: FromStr>(
    key: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
        expected,
    })
}
