//! Logging setup
//!
//! The library only emits `tracing` events; hosts that have no subscriber of
//! their own can install one with [`init_logging`].

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Parse a level name, defaulting to `INFO`
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install a global subscriber honoring `RUST_LOG` plus the configured level.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let level = parse_level(&config.level);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|e| Error::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig::default();
        // The first call may lose to another test's subscriber
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
