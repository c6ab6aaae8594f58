//! Tracing subscriber bootstrap shared by the Certfleet binaries.

use tracing_subscriber::EnvFilter;

/// Logging options collected from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Use `debug` instead of `info` when `RUST_LOG` is unset
    pub verbose: bool,
    /// Emit JSON lines instead of the human-readable format
    pub json: bool,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes priority over the verbosity flag. Fails if a subscriber
/// has already been installed.
pub fn init_tracing(options: LogOptions) -> anyhow::Result<()> {
    let default_level = if options.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| anyhow::anyhow!("Failed to initialise tracing: {}", e))
}
