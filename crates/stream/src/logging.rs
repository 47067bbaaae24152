//! Logging setup
//!
//! The requested level is scoped to the capture crates; third-party
//! noise stays at warn unless `RUST_LOG` overrides the whole filter.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter directives for a capture run at `default_level`.
///
/// The library and the binary both log under the `uac_stream` crate
/// name, so a single directive covers them.
fn capture_directives(default_level: &str) -> String {
    format!("warn,uac_stream={}", default_level)
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let directives = capture_directives(default_level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))
        .map_err(|e| {
            crate::Error::Config(format!("invalid log filter '{}': {}", directives, e))
        })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    Ok(())
}
