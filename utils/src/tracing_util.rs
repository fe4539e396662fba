//! Helpers related to tracing, used by main entrypoints

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn install(filter: EnvFilter) {
    // Don't include timestamps and such because they're not really useful and
    // too verbose; the chroot helper's output is only ever shown inline
    // in an error message.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}

/// Initialize tracing with the default configuration; `RUST_LOG` is
/// honored and defaults to `warn`.
pub fn initialize_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    install(filter)
}

/// Initialize tracing at a verbosity handed down by a parent process,
/// e.g. `debug` or `off`.  Anything unparseable means `warn`.
pub fn initialize_tracing_at(level: &str) {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::WARN);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy("");
    install(filter)
}
