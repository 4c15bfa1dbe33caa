//! Tracing subscriber setup.
//!
//! Log level comes from `RUST_LOG` (default `info`). Logs go to stderr so
//! command output on stdout stays clean. Calling [`init`] more than once is
//! harmless, so tests and the binary can both call it.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
