//! Beam-offset coupling between two monochromators.
//!
//! A channel-cut (secondary) monochromator displaces the beam vertically by
//! `2·gap·cos(θ)`. When it moves, the primary monochromator compensates by
//! changing its own beam offset so that the total offset seen downstream is
//! conserved:
//!
//! ```text
//! new_tracked = old_tracked + old_driving - beam_offset(θ_new, gap)
//! ```
//!
//! Everything here is pure. The constants are read from hardware by the
//! caller immediately before every tracked move and are never cached.

use serde::{Deserialize, Serialize};

use crate::error::ScanResult;
use crate::units::{energy_to_bragg, PhysicalQuantity, Unit};

/// Vertical beam displacement of a channel-cut crystal pair, `2·gap·cos(θ)`.
///
/// The result is expressed in the units of `gap`.
pub fn beam_offset(bragg: PhysicalQuantity, gap: PhysicalQuantity) -> ScanResult<PhysicalQuantity> {
    let theta = bragg.value_in(Unit::Radian)?;
    // Make sure gap really is a length before trusting its magnitude
    gap.value_in(Unit::Micrometer)?;
    Ok(gap.scale(2.0 * theta.cos()))
}

/// Which quantity the plan sets on the driving monochromator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrivingAxis {
    /// The plan sets the Bragg angle directly (dial angle; the Bragg offset
    /// is added to obtain the true angle).
    Bragg,
    /// The plan sets a photon energy; the true Bragg angle is derived from
    /// the crystal d-spacing.
    Energy,
}

/// Crystal constants of the driving monochromator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CouplingConstants {
    /// Calibration offset between dial and true Bragg angle.
    pub bragg_offset: PhysicalQuantity,
    /// Spacing between the two crystals of the channel cut.
    pub gap: PhysicalQuantity,
    /// Lattice spacing of the reflecting planes.
    pub d_spacing: PhysicalQuantity,
}

/// Live state needed to compute one corrective move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CouplingReadings {
    /// Current beam offset of the tracking (primary) monochromator.
    pub tracked_offset: PhysicalQuantity,
    /// Current beam offset of the driving (secondary) monochromator.
    pub driving_offset: PhysicalQuantity,
    /// Crystal constants of the driving monochromator.
    pub constants: CouplingConstants,
}

/// True Bragg angle the driving monochromator will sit at for `target`.
///
/// The Bragg offset only applies to [`DrivingAxis::Bragg`]: an energy
/// setpoint is already calibrated, so its angle comes from the d-spacing
/// alone.
pub fn true_bragg(
    axis: DrivingAxis,
    target: PhysicalQuantity,
    constants: &CouplingConstants,
) -> ScanResult<PhysicalQuantity> {
    match axis {
        DrivingAxis::Bragg => target.checked_add(constants.bragg_offset),
        DrivingAxis::Energy => energy_to_bragg(target, constants.d_spacing),
    }
}

/// New beam offset for the tracking monochromator, in the units of
/// `readings.tracked_offset`.
pub fn tracked_offset(
    axis: DrivingAxis,
    target: PhysicalQuantity,
    readings: &CouplingReadings,
) -> ScanResult<PhysicalQuantity> {
    let theta = true_bragg(axis, target, &readings.constants)?;
    let new_driving = beam_offset(theta, readings.constants.gap)?;
    readings
        .tracked_offset
        .checked_add(readings.driving_offset)?
        .checked_sub(new_driving)
}
