//! Custom error types for the energy-scan engine.
//!
//! This module defines the primary error type, `ScanError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report everything that can go wrong between building a scan schedule and
//! stepping an undulator through a firmware trajectory.
//!
//! ## Error Hierarchy
//!
//! - **Scan definition errors** (`InvalidRange`, `InvalidMerge`, `NoEnergies`):
//!   malformed region parameters or an inconsistent merge. Always raised while a
//!   plan is being built, never after motion has started.
//! - **Unit errors** (`IncompatibleUnits`, `UnknownUnit`, `MissingUnits`,
//!   `InvalidBragg`): a quantity could not be converted.
//! - **Synchronization errors** (`SignalRead`, `SignalWrite`, `Disconnected`):
//!   a live device interaction failed. Preprocessors propagate these immediately.
//! - **Motion errors** (`InvalidDeadband`, `InvalidLookupRange`, `SetupFailed`,
//!   `TrajectoryFailed`, `TrajectoryMismatch`, `Timeout`): raised before the
//!   offending write, or after the bounded retry loop is exhausted.
//! - **State errors** (`InvalidState`, `AdvanceInProgress`): the trajectory
//!   controller was driven out of order.
//! - **Execution errors** (`InvalidMessage`): the run engine received a message
//!   it cannot execute in its current state.
//! - **Ambient errors** (`Config`, `Io`, `Csv`, `Logging`).
//!
//! By using `#[from]`, `ScanError` can be created from the underlying library
//! errors, so `?` works across configuration loading and table parsing.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Physical axes of an undulator that enforce a minimum step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadbandAxis {
    /// Photon energy axis.
    Energy,
    /// Magnet gap axis.
    Gap,
    /// Energy taper axis.
    EnergyTaper,
    /// Gap taper axis.
    GapTaper,
}

impl std::fmt::Display for DeadbandAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Energy => write!(f, "energy"),
            Self::Gap => write!(f, "gap"),
            Self::EnergyTaper => write!(f, "energy_taper"),
            Self::GapTaper => write!(f, "gap_taper"),
        }
    }
}

/// Primary error type for the crate.
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ScanError {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Cannot merge ranges: {0}")]
    InvalidMerge(String),

    #[error("Plan parameters do not produce any energy points")]
    NoEnergies,

    #[error("Incompatible units: cannot convert {from} to {to}")]
    IncompatibleUnits { from: String, to: String },

    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("Signal '{0}' does not declare units")]
    MissingUnits(String),

    #[error("No Bragg reflection for wavelength {wavelength} Å with d-spacing {d_spacing} Å")]
    InvalidBragg { wavelength: f64, d_spacing: f64 },

    #[error("Failed to read signal '{signal}': {reason}")]
    SignalRead { signal: String, reason: String },

    #[error("Failed to write signal '{signal}': {reason}")]
    SignalWrite { signal: String, reason: String },

    #[error("Signal '{0}' is not connected")]
    Disconnected(String),

    #[error("Requested {axis} move of {step} is below the deadband of {deadband}")]
    InvalidDeadband {
        axis: DeadbandAxis,
        step: f64,
        deadband: f64,
    },

    #[error("Value {value} is outside the lookup table domain [{min}, {max}]")]
    InvalidLookupRange { value: f64, min: f64, max: f64 },

    #[error("Lookup table error: {0}")]
    LookupTable(String),

    #[error("Trajectory setup failed after {attempts} attempts")]
    SetupFailed { attempts: u32 },

    #[error("Trajectory point {index} not reached after {attempts} attempts (target {target}, last readback {readback})")]
    TrajectoryFailed {
        index: usize,
        attempts: u32,
        target: f64,
        readback: f64,
    },

    #[error("Requested {requested} but trajectory point {index} is {expected}")]
    TrajectoryMismatch {
        index: usize,
        requested: f64,
        expected: f64,
    },

    #[error("Invalid trajectory state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("A trajectory advance is already in flight")]
    AdvanceInProgress,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Cannot execute '{command}': {reason}")]
    InvalidMessage { command: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table parse error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Logging initialization failed: {0}")]
    Logging(String),
}
