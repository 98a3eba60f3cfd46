//! Tracing subscriber setup for binaries.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a formatting subscriber on stderr.
///
/// `RUST_LOG` takes precedence over `default_level`. Calling this more than
/// once keeps the first subscriber.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if let Err(err) = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
    {
        tracing::debug!(error = %err, "tracing subscriber already installed");
    }
}
