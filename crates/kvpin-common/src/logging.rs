use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "KVPIN_LOG";

/// Directives used when `KVPIN_LOG` is unset or invalid: kvpin crates at
/// info, everything else in the host process at warn.
pub const DEFAULT_DIRECTIVES: &str = "warn,kvpin=info,kvpin_core=info,kvpin_driver=info";

/// Install a fmt subscriber filtered by `KVPIN_LOG`, e.g.
/// `KVPIN_LOG=kvpin_core=debug`. Does nothing if a global subscriber is
/// already set.
pub fn init_logging() {
    let _ = fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}
