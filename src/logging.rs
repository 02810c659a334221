use tracing::level_filters::LevelFilter;

/// Install a plain stderr subscriber at `level`.
///
/// A subscriber the host process already installed is left in place.
pub fn init(level: LevelFilter) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}
