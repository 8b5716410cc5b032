#![forbid(unsafe_code)]

use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global `tracing` subscriber on stderr, leaving stdout to
/// command output and the viewer's control channel. `RUST_LOG` wins over
/// `default_filter`; a second call is a no-op.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
