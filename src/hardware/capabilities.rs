//! Capability traits for trajectory-capable insertion devices.
//!
//! The trajectory controller is written against [`TrajectoryDevice`] only,
//! so the same state machine drives the signal-level
//! [`PlanarUndulator`](super::undulator::PlanarUndulator) and the simulated
//! [`MockUndulator`](super::mock::MockUndulator).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{DeadbandAxis, ScanError, ScanResult};

/// Firmware operating mode of an undulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanMode {
    /// Point-to-point moves through the setpoint signals.
    #[default]
    #[serde(rename = "NormalMode")]
    Normal,
    /// Firmware-timed internal scanning.
    #[serde(rename = "ScanMode1")]
    Internal,
    /// Advance on an external edge trigger.
    #[serde(rename = "ScanMode2")]
    EdgeTrigger,
    /// Advance on a software "next point" trigger.
    #[serde(rename = "ScanMode3")]
    Software,
    /// Software trigger; a trigger after a missed point retries that point.
    #[serde(rename = "ScanMode4")]
    SoftwareRetries,
}

impl ScanMode {
    /// Name used by the undulator controls.
    pub fn as_str(self) -> &'static str {
        match self {
            ScanMode::Normal => "NormalMode",
            ScanMode::Internal => "ScanMode1",
            ScanMode::EdgeTrigger => "ScanMode2",
            ScanMode::Software => "ScanMode3",
            ScanMode::SoftwareRetries => "ScanMode4",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum step sizes enforced by the device.
///
/// A deadband of zero disables the check for that axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deadbands {
    /// Energy deadband, eV.
    pub energy: f64,
    /// Gap deadband, in the gap's units.
    pub gap: f64,
    /// Energy taper deadband, eV.
    pub energy_taper: f64,
    /// Gap taper deadband, in the gap's units.
    pub gap_taper: f64,
}

impl Deadbands {
    /// Deadband for one axis.
    pub fn for_axis(&self, axis: DeadbandAxis) -> f64 {
        match axis {
            DeadbandAxis::Energy => self.energy,
            DeadbandAxis::Gap => self.gap,
            DeadbandAxis::EnergyTaper => self.energy_taper,
            DeadbandAxis::GapTaper => self.gap_taper,
        }
    }

    /// Reject a move of `step` on `axis` that the device would ignore.
    ///
    /// A step of exactly zero is a no-op and always allowed.
    pub fn check(&self, axis: DeadbandAxis, step: f64) -> ScanResult<()> {
        let deadband = self.for_axis(axis);
        if step != 0.0 && step.abs() < deadband {
            return Err(ScanError::InvalidDeadband {
                axis,
                step,
                deadband,
            });
        }
        Ok(())
    }

    /// Check every consecutive step of a path.
    pub fn check_path(&self, axis: DeadbandAxis, path: &[f64]) -> ScanResult<()> {
        path.windows(2)
            .try_for_each(|pair| self.check(axis, pair[1] - pair[0]))
    }
}

/// Arrays uploaded to the firmware for one trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryArrays {
    /// Energy points in the device's dial representation (keV).
    pub energy_dial: Vec<f64>,
    /// Mechanical (gap) points.
    pub gap: Vec<f64>,
}

impl TrajectoryArrays {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.gap.len()
    }

    /// Whether the trajectory is empty.
    pub fn is_empty(&self) -> bool {
        self.gap.is_empty()
    }
}

/// Capability for devices that step through a preloaded trajectory.
#[async_trait]
pub trait TrajectoryDevice: Send + Sync {
    /// Device name used in logs.
    fn name(&self) -> &str;

    /// Deadbands currently configured on the device.
    fn deadbands(&self) -> Deadbands;

    /// Current firmware mode.
    async fn scan_mode(&self) -> ScanResult<ScanMode>;

    /// Switch firmware mode.
    async fn set_scan_mode(&self, mode: ScanMode) -> ScanResult<()>;

    /// Clear the firmware arrays and upload new ones.
    ///
    /// Returns whether the firmware accepted the arrays (array checks pass
    /// and no mismatches were reported). Callers retry on `false`.
    async fn load_trajectory(&self, arrays: &TrajectoryArrays) -> ScanResult<bool>;

    /// Direct move of the mechanical axis (only valid in [`ScanMode::Normal`]).
    async fn move_mechanical(&self, target: f64) -> ScanResult<()>;

    /// Ask the firmware to go to the next trajectory point.
    async fn trigger_next_point(&self) -> ScanResult<()>;

    /// Wait until motion has stopped.
    async fn wait_settled(&self, timeout: Duration) -> ScanResult<()>;

    /// Current mechanical readback.
    async fn mechanical_position(&self) -> ScanResult<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_mode_names() {
        assert_eq!(ScanMode::Normal.to_string(), "NormalMode");
        assert_eq!(ScanMode::SoftwareRetries.as_str(), "ScanMode4");
        let json = serde_json::to_string(&ScanMode::EdgeTrigger).unwrap();
        assert_eq!(json, "\"ScanMode2\"");
    }

    #[test]
    fn test_deadband_check() {
        let deadbands = Deadbands {
            energy: 1.0,
            gap: 0.01,
            ..Default::default()
        };
        assert!(deadbands.check(DeadbandAxis::Energy, 0.0).is_ok());
        assert!(deadbands.check(DeadbandAxis::Energy, -1.0).is_ok());
        assert!(matches!(
            deadbands.check(DeadbandAxis::Energy, 0.5),
            Err(ScanError::InvalidDeadband {
                axis: DeadbandAxis::Energy,
                ..
            })
        ));
        // Zero deadband disables the check
        assert!(deadbands.check(DeadbandAxis::GapTaper, 1e-9).is_ok());
    }

    #[test]
    fn test_deadband_path() {
        let deadbands = Deadbands {
            gap: 0.01,
            ..Default::default()
        };
        assert!(deadbands
            .check_path(DeadbandAxis::Gap, &[10.0, 10.02, 10.02, 10.05])
            .is_ok());
        assert!(deadbands
            .check_path(DeadbandAxis::Gap, &[10.0, 10.02, 10.025])
            .is_err());
    }
}
