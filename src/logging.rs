use tracing_subscriber::filter::LevelFilter;

/// Map the CLI verbosity level (0-4) onto a tracing level filter.
pub fn level_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the process-wide subscriber. Called once from main before the
/// mount goes live.
pub fn init(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_max_level(level_filter(verbosity))
        .with_target(false)
        .init();
}
