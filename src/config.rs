//! Configuration System using Figment
//!
//! Strongly-typed configuration for the scan engine. Values are layered,
//! lowest to highest precedence:
//! 1. Built-in defaults ([`ScanConfig::default`])
//! 2. An optional TOML file (e.g. `config/xafs_daq.toml`)
//! 3. Environment variables prefixed with `XAFS_DAQ_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! XAFS_DAQ_LOGGING__LEVEL=debug
//! XAFS_DAQ_TRAJECTORY__MAX_RETRIES=5
//! XAFS_DAQ_TRAJECTORY__SETTLE_TIMEOUT=30s
//! XAFS_DAQ_DEADBANDS__GAP=0.002
//! ```
//!
//! # Example
//!
//! ```no_run
//! use xafs_daq::config::ScanConfig;
//!
//! let config = ScanConfig::load_from("config/xafs_daq.toml")?;
//! println!("Retries per point: {}", config.trajectory.max_retries);
//! # Ok::<(), xafs_daq::error::ScanError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::Deadbands;
use crate::ranges::{MergeOptions, DEFAULT_ABS_TOLERANCE, DEFAULT_EXPOSURE, DEFAULT_REL_TOLERANCE};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "XAFS_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Logging settings
    pub logging: LoggingConfig,
    /// Range calculation settings
    pub ranges: RangesConfig,
    /// Trajectory controller settings
    pub trajectory: TrajectoryConfig,
    /// Undulator deadbands
    pub deadbands: Deadbands,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error, or a full
    /// `EnvFilter` directive). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Range calculation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangesConfig {
    /// Exposure time for regions that do not set one, seconds
    pub default_exposure: f64,
    /// Absolute tolerance when coalescing duplicate points, eV
    pub merge_abs_tolerance: f64,
    /// Relative tolerance when coalescing duplicate points
    pub merge_rel_tolerance: f64,
}

impl Default for RangesConfig {
    fn default() -> Self {
        Self {
            default_exposure: DEFAULT_EXPOSURE,
            merge_abs_tolerance: DEFAULT_ABS_TOLERANCE,
            merge_rel_tolerance: DEFAULT_REL_TOLERANCE,
        }
    }
}

impl RangesConfig {
    /// Merge options using the configured tolerances.
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            abs_tolerance: self.merge_abs_tolerance,
            rel_tolerance: self.merge_rel_tolerance,
            default_exposure: self.default_exposure,
            ..MergeOptions::default()
        }
    }
}

/// Trajectory controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Extra attempts for a point after the first one misses
    pub max_retries: u32,
    /// Attempts at uploading the scan arrays
    pub setup_retries: u32,
    /// Maximum time to wait for the device to settle after each move
    #[serde(with = "humantime_serde")]
    pub settle_timeout: Duration,
    /// Largest mechanical error still counted as reaching a point
    pub position_tolerance: f64,
    /// Energy → dial offset calibration table (tab-separated)
    pub offset_table: Option<PathBuf>,
    /// Energy → gap calibration table (tab-separated)
    pub gap_table: Option<PathBuf>,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            setup_retries: 3,
            settle_timeout: Duration::from_secs(10),
            position_tolerance: 1e-3,
            offset_table: None,
            gap_table: None,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ScanConfig {
    /// Load defaults overridden by environment variables only.
    pub fn load() -> ScanResult<Self> {
        Self::from_figment(Self::figment())
    }

    /// Load defaults, then `path` (if it exists), then environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Config`] when a layer cannot be parsed and
    /// [`ScanError::Configuration`] when validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    /// Defaults plus environment overrides, for callers that add their own
    /// providers.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract and validate a configuration from any figment.
    pub fn from_figment(figment: Figment) -> ScanResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Exposure and merge tolerances are finite and non-negative
    /// - Deadbands and the position tolerance are finite and non-negative
    /// - At least one setup attempt is allowed
    /// - The settle timeout is not zero
    pub fn validate(&self) -> ScanResult<()> {
        let non_negative = [
            ("ranges.default_exposure", self.ranges.default_exposure),
            ("ranges.merge_abs_tolerance", self.ranges.merge_abs_tolerance),
            ("ranges.merge_rel_tolerance", self.ranges.merge_rel_tolerance),
            ("trajectory.position_tolerance", self.trajectory.position_tolerance),
            ("deadbands.energy", self.deadbands.energy),
            ("deadbands.gap", self.deadbands.gap),
            ("deadbands.energy_taper", self.deadbands.energy_taper),
            ("deadbands.gap_taper", self.deadbands.gap_taper),
        ];
        for (key, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ScanError::Configuration(format!(
                    "{key} must be a non-negative number, got {value}"
                )));
            }
        }

        if self.trajectory.setup_retries == 0 {
            return Err(ScanError::Configuration(
                "trajectory.setup_retries must be at least 1".to_string(),
            ));
        }

        if self.trajectory.settle_timeout.is_zero() {
            return Err(ScanError::Configuration(
                "trajectory.settle_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trajectory.max_retries, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    #[serial]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[logging]
level = "debug"
json = true

[trajectory]
max_retries = 5
settle_timeout = "2s 500ms"
gap_table = "tables/gap.tsv"

[deadbands]
gap = 0.002
"#
        )
        .unwrap();

        let config = ScanConfig::load_from(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.trajectory.max_retries, 5);
        assert_eq!(config.trajectory.settle_timeout, Duration::from_millis(2500));
        assert_eq!(
            config.trajectory.gap_table.as_deref(),
            Some(Path::new("tables/gap.tsv"))
        );
        assert_eq!(config.deadbands.gap, 0.002);
        // Untouched sections keep their defaults
        assert_eq!(config.trajectory.setup_retries, 3);
        assert_eq!(config.ranges, RangesConfig::default());
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = ScanConfig::load_from("/nonexistent/xafs_daq.toml").unwrap();
        assert_eq!(config, ScanConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[trajectory]\nmax_retries = 5").unwrap();

        std::env::set_var("XAFS_DAQ_TRAJECTORY__MAX_RETRIES", "7");
        std::env::set_var("XAFS_DAQ_DEADBANDS__ENERGY", "0.5");
        let result = ScanConfig::load_from(file.path());
        std::env::remove_var("XAFS_DAQ_TRAJECTORY__MAX_RETRIES");
        std::env::remove_var("XAFS_DAQ_DEADBANDS__ENERGY");

        let config = result.unwrap();
        assert_eq!(config.trajectory.max_retries, 7);
        assert_eq!(config.deadbands.energy, 0.5);
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_config_error() {
        std::env::set_var("XAFS_DAQ_TRAJECTORY__MAX_RETRIES", "many");
        let result = ScanConfig::load();
        std::env::remove_var("XAFS_DAQ_TRAJECTORY__MAX_RETRIES");
        assert!(matches!(result, Err(ScanError::Config(_))));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ScanConfig::default();
        config.deadbands.gap = -0.1;
        assert!(matches!(
            config.validate(),
            Err(ScanError::Configuration(msg)) if msg.contains("deadbands.gap")
        ));

        let mut config = ScanConfig::default();
        config.trajectory.settle_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ScanConfig::default();
        config.trajectory.setup_retries = 0;
        assert!(config.validate().is_err());

        let mut config = ScanConfig::default();
        config.ranges.merge_rel_tolerance = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_options_from_config() {
        let ranges = RangesConfig {
            merge_abs_tolerance: 0.01,
            default_exposure: 2.0,
            ..Default::default()
        };
        let options = ranges.merge_options();
        assert!(options.sort);
        assert_eq!(options.abs_tolerance, 0.01);
        assert_eq!(options.default_exposure, 2.0);
    }
}
