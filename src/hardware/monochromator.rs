//! Monochromator device bundles.
//!
//! A device here is just a named set of [`SignalRef`] handles. The tracking
//! preprocessors match messages against these handles by identity, so every
//! consumer must share the same `Arc`s (clone the bundle, never rebuild it).

use crate::signal::{SignalRef, SoftSignal};

/// A double-crystal or channel-cut monochromator with a coupled beam offset.
#[derive(Clone)]
pub struct Monochromator {
    /// Device name.
    pub name: String,
    /// Bragg angle setpoint (dial angle).
    pub bragg: SignalRef,
    /// Photon energy setpoint.
    pub energy: SignalRef,
    /// Vertical beam offset introduced by the crystals.
    pub beam_offset: SignalRef,
    /// Calibration offset between dial and true Bragg angle.
    pub bragg_offset: SignalRef,
    /// Crystal gap.
    pub gap: SignalRef,
    /// Lattice spacing of the reflecting planes.
    pub d_spacing: SignalRef,
}

impl std::fmt::Debug for Monochromator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monochromator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A monochromator whose beam offset can be adjusted independently of energy.
#[derive(Clone)]
pub struct FixedOffsetMonochromator {
    /// Device name.
    pub name: String,
    /// Photon energy setpoint.
    pub energy: SignalRef,
    /// Adjustable beam offset.
    pub beam_offset: SignalRef,
}

impl std::fmt::Debug for FixedOffsetMonochromator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedOffsetMonochromator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Simulated bundles
// =============================================================================

/// Soft signals behind a simulated [`Monochromator`].
#[derive(Debug, Clone)]
pub struct SoftMonochromator {
    /// Bragg angle, arcseconds.
    pub bragg: SoftSignal<f64>,
    /// Energy, eV.
    pub energy: SoftSignal<f64>,
    /// Beam offset, µm.
    pub beam_offset: SoftSignal<f64>,
    /// Bragg offset, arcseconds.
    pub bragg_offset: SoftSignal<f64>,
    /// Crystal gap, µm.
    pub gap: SoftSignal<f64>,
    /// d-spacing, Å.
    pub d_spacing: SoftSignal<f64>,
}

impl SoftMonochromator {
    /// Create soft signals named `{name}-bragg`, `{name}-energy`, ...
    pub fn new(name: &str) -> Self {
        let signal = |suffix: &str, units: &str| {
            SoftSignal::new(format!("{name}-{suffix}"), 0.0).with_units(units)
        };
        Self {
            bragg: signal("bragg", "arcsec"),
            energy: signal("energy", "eV"),
            beam_offset: signal("beam_offset", "um"),
            bragg_offset: signal("bragg_offset", "arcsec"),
            gap: signal("gap", "um"),
            d_spacing: signal("d_spacing", "Å"),
        }
    }

    /// Device bundle sharing these signals.
    pub fn device(&self, name: &str) -> Monochromator {
        Monochromator {
            name: name.to_string(),
            bragg: self.bragg.handle(),
            energy: self.energy.handle(),
            beam_offset: self.beam_offset.handle(),
            bragg_offset: self.bragg_offset.handle(),
            gap: self.gap.handle(),
            d_spacing: self.d_spacing.handle(),
        }
    }
}

/// Soft signals behind a simulated [`FixedOffsetMonochromator`].
#[derive(Debug, Clone)]
pub struct SoftFixedOffsetMonochromator {
    /// Energy, eV.
    pub energy: SoftSignal<f64>,
    /// Beam offset, µm.
    pub beam_offset: SoftSignal<f64>,
}

impl SoftFixedOffsetMonochromator {
    /// Create soft signals named `{name}-energy` and `{name}-beam_offset`.
    pub fn new(name: &str) -> Self {
        Self {
            energy: SoftSignal::new(format!("{name}-energy"), 0.0).with_units("eV"),
            beam_offset: SoftSignal::new(format!("{name}-beam_offset"), 0.0).with_units("um"),
        }
    }

    /// Device bundle sharing these signals.
    pub fn device(&self, name: &str) -> FixedOffsetMonochromator {
        FixedOffsetMonochromator {
            name: name.to_string(),
            energy: self.energy.handle(),
            beam_offset: self.beam_offset.handle(),
        }
    }
}
