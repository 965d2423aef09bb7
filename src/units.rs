//! Physical quantities and X-ray unit conversions.
//!
//! Everything that moves during an energy scan speaks a different unit:
//! monochromator crystals are positioned in Bragg angle (usually arcseconds),
//! undulators in keV dial units, beam offsets and gaps in microns, and the
//! scan schedule itself in electron-volts or photoelectron wavenumber (Å⁻¹).
//! [`PhysicalQuantity`] carries the unit alongside the value so that values read
//! from live signals can be combined without guessing.
//!
//! # Conversions
//!
//! ```text
//! E = hc / λ                 energy ⇄ wavelength
//! λ = 2 d sin(θ) / n         wavelength ⇄ Bragg angle
//! E − E0 = ħ²k² / 2mₑ        energy ⇄ photoelectron wavenumber
//! ```
//!
//! # Example
//!
//! ```
//! use xafs_daq::units::{energy_to_bragg, PhysicalQuantity, Unit};
//!
//! let energy = PhysicalQuantity::new(8333.0, Unit::ElectronVolt);
//! let d = PhysicalQuantity::new(3.1355, Unit::Angstrom);
//! let bragg = energy_to_bragg(energy, d).unwrap();
//! assert!(bragg.to(Unit::Degree).unwrap().value() > 13.0);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ScanError, ScanResult};

/// Planck constant times the speed of light, in eV·Å.
pub const HC_EV_ANGSTROM: f64 = 12_398.419_843_320_026;

/// ħ²/2mₑ expressed in eV·Å², the coefficient relating photoelectron
/// wavenumber to kinetic energy.
pub const ALPHA_EV_ANGSTROM2: f64 = 3.809_982_111_457_362;

const ARCSEC_PER_DEGREE: f64 = 3600.0;

// =============================================================================
// Units
// =============================================================================

/// Physical dimension of a unit. Only quantities of equal dimension convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    /// Photon or electron energy.
    Energy,
    /// Distances: wavelengths, gaps, beam offsets, d-spacings.
    Length,
    /// Plane angles such as the Bragg angle.
    Angle,
    /// Photoelectron wavenumber (inverse length).
    Wavenumber,
}

/// Units understood by the scan engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    /// eV
    ElectronVolt,
    /// keV
    KiloElectronVolt,
    /// m
    Meter,
    /// mm
    Millimeter,
    /// µm
    Micrometer,
    /// nm
    Nanometer,
    /// Å
    Angstrom,
    /// rad
    Radian,
    /// °
    Degree,
    /// ″
    Arcsecond,
    /// Å⁻¹
    InverseAngstrom,
}

impl Unit {
    /// The dimension this unit measures.
    pub fn dimension(self) -> Dimension {
        match self {
            Unit::ElectronVolt | Unit::KiloElectronVolt => Dimension::Energy,
            Unit::Meter | Unit::Millimeter | Unit::Micrometer | Unit::Nanometer | Unit::Angstrom => {
                Dimension::Length
            }
            Unit::Radian | Unit::Degree | Unit::Arcsecond => Dimension::Angle,
            Unit::InverseAngstrom => Dimension::Wavenumber,
        }
    }

    /// Factor that converts a value in this unit into the dimension's base unit
    /// (eV, Å, rad, Å⁻¹).
    fn base_factor(self) -> f64 {
        match self {
            Unit::ElectronVolt => 1.0,
            Unit::KiloElectronVolt => 1.0e3,
            Unit::Meter => 1.0e10,
            Unit::Millimeter => 1.0e7,
            Unit::Micrometer => 1.0e4,
            Unit::Nanometer => 10.0,
            Unit::Angstrom => 1.0,
            Unit::Radian => 1.0,
            Unit::Degree => std::f64::consts::PI / 180.0,
            Unit::Arcsecond => std::f64::consts::PI / 180.0 / ARCSEC_PER_DEGREE,
            Unit::InverseAngstrom => 1.0,
        }
    }

    /// Canonical symbol, as published in signal metadata.
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::ElectronVolt => "eV",
            Unit::KiloElectronVolt => "keV",
            Unit::Meter => "m",
            Unit::Millimeter => "mm",
            Unit::Micrometer => "um",
            Unit::Nanometer => "nm",
            Unit::Angstrom => "Å",
            Unit::Radian => "rad",
            Unit::Degree => "deg",
            Unit::Arcsecond => "arcsec",
            Unit::InverseAngstrom => "1/Å",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = match s.trim() {
            "eV" | "electron_volt" => Unit::ElectronVolt,
            "keV" | "kiloelectron_volt" => Unit::KiloElectronVolt,
            "m" | "meter" => Unit::Meter,
            "mm" | "millimeter" => Unit::Millimeter,
            "um" | "µm" | "μm" | "micron" | "microns" | "micrometer" => Unit::Micrometer,
            "nm" | "nanometer" => Unit::Nanometer,
            "Å" | "A" | "angstrom" => Unit::Angstrom,
            "rad" | "radian" | "radians" => Unit::Radian,
            "deg" | "degree" | "degrees" | "°" => Unit::Degree,
            "arcsec" | "arcsecond" | "arcseconds" | "″" => Unit::Arcsecond,
            "1/Å" | "1/A" | "Å⁻¹" | "A^-1" | "1/angstrom" => Unit::InverseAngstrom,
            other => return Err(ScanError::UnknownUnit(other.to_string())),
        };
        Ok(unit)
    }
}

// =============================================================================
// PhysicalQuantity
// =============================================================================

/// A scalar tagged with its unit of measure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalQuantity {
    value: f64,
    unit: Unit,
}

impl PhysicalQuantity {
    /// Create a new quantity.
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Numeric magnitude in [`Self::unit`].
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Unit of the magnitude.
    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Physical dimension.
    pub fn dimension(&self) -> Dimension {
        self.unit.dimension()
    }

    /// Convert to another unit of the same dimension.
    pub fn to(self, unit: Unit) -> ScanResult<Self> {
        if self.unit == unit {
            return Ok(self);
        }
        if self.unit.dimension() != unit.dimension() {
            return Err(ScanError::IncompatibleUnits {
                from: self.unit.to_string(),
                to: unit.to_string(),
            });
        }
        let value = self.value * self.unit.base_factor() / unit.base_factor();
        Ok(Self { value, unit })
    }

    /// Magnitude expressed in `unit`.
    pub fn value_in(self, unit: Unit) -> ScanResult<f64> {
        self.to(unit).map(|q| q.value)
    }

    /// Sum of two quantities, expressed in the unit of `self`.
    pub fn checked_add(self, other: Self) -> ScanResult<Self> {
        let other = other.value_in(self.unit)?;
        Ok(Self::new(self.value + other, self.unit))
    }

    /// Difference of two quantities, expressed in the unit of `self`.
    pub fn checked_sub(self, other: Self) -> ScanResult<Self> {
        let other = other.value_in(self.unit)?;
        Ok(Self::new(self.value - other, self.unit))
    }

    /// Scale by a dimensionless factor.
    pub fn scale(self, factor: f64) -> Self {
        Self::new(self.value * factor, self.unit)
    }

    fn expect_dimension(self, dimension: Dimension, expected: Unit) -> ScanResult<Self> {
        if self.dimension() == dimension {
            Ok(self)
        } else {
            Err(ScanError::IncompatibleUnits {
                from: self.unit.to_string(),
                to: expected.to_string(),
            })
        }
    }
}

impl fmt::Display for PhysicalQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

// =============================================================================
// Photon conversions
// =============================================================================

/// Photon energy to wavelength, `λ = hc / E`. Result in Å.
pub fn energy_to_wavelength(energy: PhysicalQuantity) -> ScanResult<PhysicalQuantity> {
    let ev = energy
        .expect_dimension(Dimension::Energy, Unit::ElectronVolt)?
        .value_in(Unit::ElectronVolt)?;
    Ok(PhysicalQuantity::new(HC_EV_ANGSTROM / ev, Unit::Angstrom))
}

/// Photon wavelength to energy, `E = hc / λ`. Result in eV.
pub fn wavelength_to_energy(wavelength: PhysicalQuantity) -> ScanResult<PhysicalQuantity> {
    let angstrom = wavelength
        .expect_dimension(Dimension::Length, Unit::Angstrom)?
        .value_in(Unit::Angstrom)?;
    Ok(PhysicalQuantity::new(
        HC_EV_ANGSTROM / angstrom,
        Unit::ElectronVolt,
    ))
}

/// Bragg angle to wavelength for reflection order `order`, `λ = 2 d sin(θ) / n`.
pub fn bragg_to_wavelength(
    bragg: PhysicalQuantity,
    d_spacing: PhysicalQuantity,
    order: u32,
) -> ScanResult<PhysicalQuantity> {
    let theta = bragg
        .expect_dimension(Dimension::Angle, Unit::Radian)?
        .value_in(Unit::Radian)?;
    let d = d_spacing
        .expect_dimension(Dimension::Length, Unit::Angstrom)?
        .value_in(Unit::Angstrom)?;
    Ok(PhysicalQuantity::new(
        2.0 * d * theta.sin() / f64::from(order.max(1)),
        Unit::Angstrom,
    ))
}

/// Wavelength to Bragg angle for reflection order `order`. Result in radians.
///
/// Fails with [`ScanError::InvalidBragg`] when the wavelength is too long to be
/// diffracted by the crystal.
pub fn wavelength_to_bragg(
    wavelength: PhysicalQuantity,
    d_spacing: PhysicalQuantity,
    order: u32,
) -> ScanResult<PhysicalQuantity> {
    let lambda = wavelength
        .expect_dimension(Dimension::Length, Unit::Angstrom)?
        .value_in(Unit::Angstrom)?;
    let d = d_spacing
        .expect_dimension(Dimension::Length, Unit::Angstrom)?
        .value_in(Unit::Angstrom)?;
    let sine = f64::from(order.max(1)) * lambda / 2.0 / d;
    if !(0.0..=1.0).contains(&sine) || !sine.is_finite() {
        return Err(ScanError::InvalidBragg {
            wavelength: lambda,
            d_spacing: d,
        });
    }
    Ok(PhysicalQuantity::new(sine.asin(), Unit::Radian))
}

/// First-order Bragg angle for a photon energy.
pub fn energy_to_bragg(
    energy: PhysicalQuantity,
    d_spacing: PhysicalQuantity,
) -> ScanResult<PhysicalQuantity> {
    wavelength_to_bragg(energy_to_wavelength(energy)?, d_spacing, 1)
}

/// Photon energy diffracted at a first-order Bragg angle.
pub fn bragg_to_energy(
    bragg: PhysicalQuantity,
    d_spacing: PhysicalQuantity,
) -> ScanResult<PhysicalQuantity> {
    wavelength_to_energy(bragg_to_wavelength(bragg, d_spacing, 1)?)
}

// =============================================================================
// Photoelectron conversions
// =============================================================================

/// Convert an energy (eV) to photoelectron wavenumber (Å⁻¹).
///
/// `relative_to` measures the difference between two wavenumbers, e.g.
/// `energy_to_wavenumber(25.0, 20.0)` is the k-step between 20 eV and 25 eV.
pub fn energy_to_wavenumber(energy: f64, relative_to: f64) -> f64 {
    let k_ref = (relative_to / ALPHA_EV_ANGSTROM2).sqrt();
    let k = (energy / ALPHA_EV_ANGSTROM2).sqrt();
    k - k_ref
}

/// Convert a photoelectron wavenumber (Å⁻¹) to energy (eV).
///
/// `relative_to` is a wavenumber; the result is the energy difference between
/// the two wavenumbers.
pub fn wavenumber_to_energy(wavenumber: f64, relative_to: f64) -> f64 {
    wavenumber.powi(2) * ALPHA_EV_ANGSTROM2 - relative_to.powi(2) * ALPHA_EV_ANGSTROM2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_unit_parsing() {
        assert_eq!("arcsec".parse::<Unit>().unwrap(), Unit::Arcsecond);
        assert_eq!("µm".parse::<Unit>().unwrap(), Unit::Micrometer);
        assert_eq!("keV".parse::<Unit>().unwrap(), Unit::KiloElectronVolt);
        assert!(matches!(
            "furlong".parse::<Unit>(),
            Err(ScanError::UnknownUnit(_))
        ));
    }

    #[test]
    fn test_quantity_conversion() {
        let gap = PhysicalQuantity::new(4000.0, Unit::Micrometer);
        assert_close(gap.value_in(Unit::Millimeter).unwrap(), 4.0, 1e-12);

        let angle = PhysicalQuantity::new(3600.0, Unit::Arcsecond);
        assert_close(angle.value_in(Unit::Degree).unwrap(), 1.0, 1e-12);
    }

    #[test]
    fn test_incompatible_conversion() {
        let energy = PhysicalQuantity::new(8333.0, Unit::ElectronVolt);
        assert!(matches!(
            energy.to(Unit::Millimeter),
            Err(ScanError::IncompatibleUnits { .. })
        ));
    }

    #[test]
    fn test_checked_arithmetic_carries_units() {
        let bragg = PhysicalQuantity::new(67407.927958, Unit::Arcsecond);
        let offset = PhysicalQuantity::new(-2159.15, Unit::Arcsecond);
        let total = bragg.checked_add(offset).unwrap();
        assert_eq!(total.unit(), Unit::Arcsecond);
        assert_close(total.value(), 65248.777958, 1e-9);

        let kev = PhysicalQuantity::new(1.0, Unit::KiloElectronVolt);
        let sum = kev
            .checked_add(PhysicalQuantity::new(500.0, Unit::ElectronVolt))
            .unwrap();
        assert_close(sum.value(), 1.5, 1e-12);
    }

    #[test]
    fn test_energy_wavelength_round_trip() {
        let energy = PhysicalQuantity::new(10_000.0, Unit::ElectronVolt);
        let wavelength = energy_to_wavelength(energy).unwrap();
        assert_close(wavelength.value(), 1.2398419843, 1e-9);
        let back = wavelength_to_energy(wavelength).unwrap();
        assert_close(back.value(), 10_000.0, 1e-8);
    }

    #[test]
    fn test_bragg_round_trip() {
        let d = PhysicalQuantity::new(1.92, Unit::Angstrom);
        let energy = PhysicalQuantity::new(10_057.9, Unit::ElectronVolt);
        let bragg = energy_to_bragg(energy, d).unwrap();
        let back = bragg_to_energy(bragg, d).unwrap();
        assert_close(back.value(), 10_057.9, 1e-7);
    }

    #[test]
    fn test_bragg_out_of_reach() {
        // 1 keV photons cannot be diffracted by a 1.92 Å crystal
        let d = PhysicalQuantity::new(1.92, Unit::Angstrom);
        let energy = PhysicalQuantity::new(1_000.0, Unit::ElectronVolt);
        assert!(matches!(
            energy_to_bragg(energy, d),
            Err(ScanError::InvalidBragg { .. })
        ));
    }

    #[test]
    fn test_energy_to_wavenumber() {
        assert_close(energy_to_wavenumber(50.0, 0.0), 3.6226262844, 1e-8);
        assert_close(energy_to_wavenumber(25.0, 20.0), 0.2704335772, 1e-8);
    }

    #[test]
    fn test_wavenumber_to_energy() {
        assert_close(wavenumber_to_energy(3.6226262844180233, 0.0), 50.0, 1e-9);
        let k0 = energy_to_wavenumber(20.0, 0.0);
        assert_close(wavenumber_to_energy(k0 + 0.25, k0), 4.6027442, 1e-6);
    }
}
