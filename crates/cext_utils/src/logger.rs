use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Environment variable consulted for the log filter before the caller's default.
pub const LOG_ENV: &str = "CEXT_LOG";

/// Installs the process-wide `tracing` subscriber.
///
/// `CEXT_LOG` takes precedence over `default_filter`. Only the first call has
/// any effect; later calls, and calls made after another subscriber was set,
/// are ignored.
pub fn init_logging(default_filter: &str) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::new("warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
