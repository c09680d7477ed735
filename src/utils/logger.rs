use tracing_subscriber::{EnvFilter, fmt};

/// Variable holding the log filter directives, e.g. `codecache=debug`.
pub const LOG_ENV: &str = "CODECACHE_LOG";

/// Installs the global stderr subscriber. Safe to call more than once; only
/// the first call takes effect.
pub fn init_logging() {
    init_with_verbosity(0);
}

/// Like [`init_logging`], with `-v` flags raising the level above whatever
/// `CODECACHE_LOG` asks for.
pub fn init_with_verbosity(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
