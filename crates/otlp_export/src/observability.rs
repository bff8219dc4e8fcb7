//! `tracing` subscriber setup for binaries and tests.

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Filter applied when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,otlp_export=debug";

/// Installs the global subscriber: an [`EnvFilter`] honouring `RUST_LOG`
/// (falling back to [`DEFAULT_FILTER`]) and a fmt layer with targets.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(service_name: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()?;

    tracing::info!(service = service_name, "Tracing initialised");
    Ok(())
}

/// Routes error-level events to the test writer. Safe to call from every
/// test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("error"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_tracing_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
        assert!(init_tracing("again").is_err());
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
