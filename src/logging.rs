//! Subscriber setup for the `rw-sync` binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! binary's job. Output goes to stderr so stdout keeps the final tally.
//! `RUST_LOG` wins over the verbosity flag when set.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter: `info` for this crate, `warn` elsewhere; `-v` raises ours to `debug`.
pub fn default_directive(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("warn,reader_sync={level},rw_sync={level}")
}

pub fn init(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(verbose)))
        .map_err(|e| anyhow!("Invalid log filter: {}", e))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_sets_crate_level() {
        assert_eq!(default_directive(false), "warn,reader_sync=info,rw_sync=info");
        assert!(default_directive(true).contains("reader_sync=debug"));
        assert!(EnvFilter::try_new(default_directive(true)).is_ok());
    }
}
