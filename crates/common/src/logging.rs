//! Tracing output for the host and its streaming thread

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter from `directives` if given, else from `default_level`
fn stream_filter(directives: Option<&str>, default_level: &str) -> crate::Result<EnvFilter> {
    let chosen = directives
        .filter(|d| !d.trim().is_empty())
        .unwrap_or(default_level);
    EnvFilter::try_new(chosen)
        .map_err(|e| crate::Error::Config(format!("Invalid log filter '{}': {}", chosen, e)))
}

/// Install the global subscriber
///
/// Lines carry the thread name so completions logged from `fx3-stream` stand
/// apart from the CLI. `RUST_LOG` overrides `default_level`.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = stream_filter(env.as_deref(), default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_directives_take_precedence() {
        let filter = stream_filter(Some("host=trace"), "info").unwrap();
        assert_eq!(filter.to_string(), "host=trace");

        let filter = stream_filter(Some("  "), "warn").unwrap();
        assert_eq!(filter.to_string(), "warn");

        let filter = stream_filter(None, "debug").unwrap();
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn test_invalid_level_rejected() {
        let err = stream_filter(None, "host=[bogus").unwrap_err();
        assert!(err.to_string().contains("Invalid log filter"));
    }
}
