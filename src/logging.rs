//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the process embedding the crate. [`init_from_config`] is the usual way
//! to do that:
//!
//! ```rust,ignore
//! let config = ScanConfig::load_from("config/xafs_daq.toml")?;
//! xafs_daq::logging::init_from_config(&config.logging)?;
//! ```
//!
//! `RUST_LOG`, when set, overrides the configured level.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{ScanError, ScanResult};

/// Build the filter: `RUST_LOG` if set, otherwise `config.level`.
pub fn env_filter(config: &LoggingConfig) -> ScanResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| ScanError::Logging(format!("invalid level '{}': {e}", config.level)))
}

/// Install the global subscriber.
///
/// Fails with [`ScanError::Logging`] if the level is not a valid filter or a
/// global subscriber is already installed.
pub fn init_from_config(config: &LoggingConfig) -> ScanResult<()> {
    let filter = env_filter(config)?;
    let layer = if config.json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| ScanError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_invalid_level() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "xafs_daq=loud".to_string(),
            json: false,
        };
        assert!(matches!(env_filter(&config), Err(ScanError::Logging(_))));
    }

    #[test]
    #[serial]
    fn test_configured_level_without_rust_log() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "xafs_daq=debug".to_string(),
            json: true,
        };
        let filter = env_filter(&config).unwrap();
        assert_eq!(filter.to_string(), "xafs_daq=debug");
    }

    #[test]
    #[serial]
    fn test_rust_log_overrides_level() {
        std::env::set_var("RUST_LOG", "warn");
        let filter = env_filter(&LoggingConfig::default());
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.unwrap().to_string(), "warn");
    }
}
