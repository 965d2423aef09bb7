//! Energy and wavenumber regions, and merging them into a scan schedule.
//!
//! An X-ray absorption scan is rarely uniform: coarse steps in the pre-edge,
//! fine steps across the edge, and steps linear in photoelectron wavenumber
//! (k) through the extended region, often with longer exposures at high k.
//! Each portion is described by a [`RangeRegion`]; [`merge_ranges`] combines
//! several regions into one monotonic [`MergedSchedule`].
//!
//! Region calculation is pure and never touches hardware.
//!
//! # Example
//!
//! ```
//! use xafs_daq::ranges::{merge_ranges, EnergyRegion, MergeOptions, RangeRegion};
//!
//! let regions: [RangeRegion; 2] = [
//!     EnergyRegion::with_step("energy", 1.0, 5.0, 1.0).with_exposure(0.5).into(),
//!     EnergyRegion::with_step("energy", 5.0, 7.0, 0.5).with_exposure(1.0).into(),
//! ];
//! let schedule = merge_ranges(&regions, &MergeOptions::default()).unwrap();
//! assert_eq!(schedule.points, vec![1.0, 2.0, 3.0, 4.0, 5.0, 5.5, 6.0, 6.5, 7.0]);
//! // The boundary point takes the exposure of the later region
//! assert_eq!(schedule.exposures[4], 1.0);
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{ScanError, ScanResult};
use crate::units::{energy_to_wavenumber, wavenumber_to_energy};

/// Exposure time used when a region does not specify one, in seconds.
pub const DEFAULT_EXPOSURE: f64 = 0.5;

/// Absolute tolerance for treating two scan points as the same point.
pub const DEFAULT_ABS_TOLERANCE: f64 = 1e-9;

/// Relative tolerance for treating two scan points as the same point.
pub const DEFAULT_REL_TOLERANCE: f64 = 1e-9;

// =============================================================================
// Frame & spacing
// =============================================================================

/// Points and per-point exposure times produced by one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Axis the points belong to.
    pub axis: String,
    /// Scan points (absolute energies once E0 has been applied), in eV.
    pub points: Vec<f64>,
    /// Exposure time for each point, in seconds.
    pub exposures: Vec<f64>,
}

impl Frame {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the frame has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// How the points between `start` and `stop` are spaced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Spacing {
    /// Fixed number of points, both ends included.
    Num(usize),
    /// Fixed step size. The sign is taken from the direction of the region.
    Step(f64),
}

/// Linearly spaced values from `start` to `stop`, both ends included.
fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let last = num - 1;
            let span = stop - start;
            (0..num)
                .map(|i| {
                    if i == last {
                        stop
                    } else {
                        start + span * (i as f64) / (last as f64)
                    }
                })
                .collect()
        }
    }
}

/// Round a step count that should be integral but carries float error, e.g.
/// `(1.3 - 1.0) / 0.1 = 2.9999999999999996`.
fn step_count(span: f64, step: f64) -> usize {
    let steps = (span / step).abs();
    let nearest = steps.round();
    if (steps - nearest).abs() <= 1e-9 * nearest.max(1.0) {
        nearest as usize
    } else {
        steps.floor() as usize
    }
}

fn sample_line(start: f64, stop: f64, spacing: Spacing) -> ScanResult<Vec<f64>> {
    if !start.is_finite() || !stop.is_finite() {
        return Err(ScanError::InvalidRange(format!(
            "start and stop must be finite, got {start} and {stop}"
        )));
    }
    match spacing {
        Spacing::Num(0) => Err(ScanError::InvalidRange(
            "a region needs at least one point".to_string(),
        )),
        Spacing::Num(1) if start != stop => Err(ScanError::InvalidRange(format!(
            "a single-point region must have start == stop, got {start} and {stop}"
        ))),
        Spacing::Num(num) => Ok(linspace(start, stop, num)),
        Spacing::Step(step) => {
            if !step.is_finite() || step == 0.0 {
                return Err(ScanError::InvalidRange(format!(
                    "step must be a non-zero finite number, got {step}"
                )));
            }
            let span = stop - start;
            if span == 0.0 {
                return Ok(vec![start]);
            }
            let step = step.abs().copysign(span);
            let steps = step_count(span, step);
            let reached = start + step * steps as f64;
            if close(reached, stop, 1e-9, 1e-9) {
                Ok(linspace(start, stop, steps + 1))
            } else {
                // Stop is not a whole number of steps away: keep the regular
                // grid and finish on stop with a shorter final step.
                let mut points = linspace(start, reached, steps + 1);
                points.push(stop);
                Ok(points)
            }
        }
    }
}

fn close(a: f64, b: f64, abs_tol: f64, rel_tol: f64) -> bool {
    (a - b).abs() <= abs_tol + rel_tol * a.abs().max(b.abs())
}

// =============================================================================
// Regions
// =============================================================================

/// A region that is linear in energy.
///
/// When `e0` is given, `start` and `stop` are relative to it and the returned
/// points are absolute energies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyRegion {
    axis: String,
    start: f64,
    stop: f64,
    spacing: Spacing,
    #[serde(default)]
    e0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exposure: Option<f64>,
}

impl EnergyRegion {
    /// `num` evenly spaced energies from `start` to `stop`.
    pub fn with_num(axis: impl Into<String>, start: f64, stop: f64, num: usize) -> Self {
        Self {
            axis: axis.into(),
            start,
            stop,
            spacing: Spacing::Num(num),
            e0: None,
            exposure: None,
        }
    }

    /// Energies from `start` to `stop` every `step` eV.
    pub fn with_step(axis: impl Into<String>, start: f64, stop: f64, step: f64) -> Self {
        Self {
            spacing: Spacing::Step(step),
            ..Self::with_num(axis, start, stop, 2)
        }
    }

    /// Make `start`/`stop` relative to the reference energy `e0`.
    pub fn with_e0(mut self, e0: f64) -> Self {
        self.e0 = Some(e0);
        self
    }

    /// Constant exposure time for every point, in seconds.
    pub fn with_exposure(mut self, exposure: f64) -> Self {
        self.exposure = Some(exposure);
        self
    }

    /// Exposure time set on the region, if any.
    pub fn exposure(&self) -> Option<f64> {
        self.exposure
    }

    /// Axis name.
    pub fn axis(&self) -> &str {
        &self.axis
    }

    /// Reference energy, if any.
    pub fn e0(&self) -> Option<f64> {
        self.e0
    }

    /// Calculate the points and exposures.
    pub fn calculate(&self) -> ScanResult<Frame> {
        self.calculate_with_default(DEFAULT_EXPOSURE)
    }

    /// Calculate, using `default_exposure` unless the region sets its own.
    pub fn calculate_with_default(&self, default_exposure: f64) -> ScanResult<Frame> {
        let exposure = self.exposure.unwrap_or(default_exposure);
        validate_exposure(exposure)?;
        let shift = self.e0.unwrap_or(0.0);
        let points: Vec<f64> = sample_line(self.start, self.stop, self.spacing)?
            .into_iter()
            .map(|e| e + shift)
            .collect();
        let exposures = vec![exposure; points.len()];
        Ok(Frame {
            axis: self.axis.clone(),
            points,
            exposures,
        })
    }
}

/// A region that is linear in photoelectron wavenumber (Å⁻¹) but produces
/// points in energy (eV).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavenumberRegion {
    axis: String,
    start: f64,
    stop: f64,
    spacing: Spacing,
    #[serde(default)]
    e0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exposure: Option<f64>,
}

impl WavenumberRegion {
    /// `num` points evenly spaced in k from `k_start` to `k_stop`.
    pub fn with_num(axis: impl Into<String>, k_start: f64, k_stop: f64, num: usize) -> Self {
        Self {
            axis: axis.into(),
            start: k_start,
            stop: k_stop,
            spacing: Spacing::Num(num),
            e0: None,
            exposure: None,
        }
    }

    /// Points from `k_start` to `k_stop` every `k_step` Å⁻¹.
    pub fn with_step(axis: impl Into<String>, k_start: f64, k_stop: f64, k_step: f64) -> Self {
        Self {
            spacing: Spacing::Step(k_step),
            ..Self::with_num(axis, k_start, k_stop, 2)
        }
    }

    /// Edge energy the wavenumbers are measured from.
    pub fn with_e0(mut self, e0: f64) -> Self {
        self.e0 = Some(e0);
        self
    }

    /// Constant exposure time for every point, in seconds.
    pub fn with_exposure(mut self, exposure: f64) -> Self {
        self.exposure = Some(exposure);
        self
    }

    /// Exposure time set on the region, if any.
    pub fn exposure(&self) -> Option<f64> {
        self.exposure
    }

    /// Axis name.
    pub fn axis(&self) -> &str {
        &self.axis
    }

    /// Reference energy, if any.
    pub fn e0(&self) -> Option<f64> {
        self.e0
    }

    /// The evenly spaced wavenumbers, before conversion to energy.
    pub fn wavenumbers(&self) -> ScanResult<Vec<f64>> {
        if self.start < 0.0 || self.stop < 0.0 {
            return Err(ScanError::InvalidRange(format!(
                "wavenumbers must be non-negative, got {} to {}",
                self.start, self.stop
            )));
        }
        sample_line(self.start, self.stop, self.spacing)
    }

    /// Calculate absolute energies and exposures.
    pub fn calculate(&self) -> ScanResult<Frame> {
        self.calculate_with_default(DEFAULT_EXPOSURE)
    }

    /// Calculate, using `default_exposure` unless the region sets its own.
    pub fn calculate_with_default(&self, default_exposure: f64) -> ScanResult<Frame> {
        let exposure = self.exposure.unwrap_or(default_exposure);
        validate_exposure(exposure)?;
        let e0 = self.e0.unwrap_or(0.0);
        let points: Vec<f64> = self
            .wavenumbers()?
            .into_iter()
            .map(|k| wavenumber_to_energy(k, 0.0) + e0)
            .collect();
        let exposures = vec![exposure; points.len()];
        Ok(Frame {
            axis: self.axis.clone(),
            points,
            exposures,
        })
    }
}

/// Scales the exposure of a wrapped region with wavenumber,
/// `base_duration · k^k_weight`, with k measured from `e0`.
///
/// With `k_weight == 0` every point gets `base_duration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KWeighted {
    region: Box<RangeRegion>,
    base_duration: f64,
    #[serde(default)]
    k_weight: f64,
    #[serde(default)]
    e0: Option<f64>,
}

impl KWeighted {
    /// Wrap `region`, weighting its exposures.
    pub fn new(region: impl Into<RangeRegion>, base_duration: f64, k_weight: f64) -> Self {
        Self {
            region: Box::new(region.into()),
            base_duration,
            k_weight,
            e0: None,
        }
    }

    /// Override the reference energy used to compute k. Defaults to the
    /// wrapped region's E0.
    pub fn with_e0(mut self, e0: f64) -> Self {
        self.e0 = Some(e0);
        self
    }

    /// Wrapped region.
    pub fn region(&self) -> &RangeRegion {
        &self.region
    }

    fn reference_energy(&self) -> f64 {
        self.e0.or_else(|| self.region.e0()).unwrap_or(0.0)
    }

    /// Calculate the wrapped region's points with k-weighted exposures.
    pub fn calculate(&self) -> ScanResult<Frame> {
        validate_exposure(self.base_duration)?;
        if !self.k_weight.is_finite() {
            return Err(ScanError::InvalidRange(format!(
                "k-weight must be finite, got {}",
                self.k_weight
            )));
        }
        let mut frame = self.region.calculate()?;
        if self.k_weight == 0.0 {
            frame.exposures = vec![self.base_duration; frame.len()];
            return Ok(frame);
        }
        let ks = match self.region.as_ref() {
            // Use the exact wavenumbers rather than re-deriving them from energy
            RangeRegion::Wavenumber(region) if self.e0.is_none() || self.e0 == region.e0 => {
                region.wavenumbers()?
            }
            _ => energies_to_wavenumbers(&frame.points, self.reference_energy())?,
        };
        frame.exposures = ks
            .iter()
            .map(|k| self.base_duration * k.powf(self.k_weight))
            .collect();
        Ok(frame)
    }
}

fn energies_to_wavenumbers(energies: &[f64], e0: f64) -> ScanResult<Vec<f64>> {
    if let Some(below) = energies.iter().find(|e| **e < e0) {
        return Err(ScanError::InvalidRange(format!(
            "cannot apply k-weight to energy {below} below E0 {e0}"
        )));
    }
    Ok(energies
        .iter()
        .map(|e| energy_to_wavenumber(e - e0, 0.0))
        .collect())
}

fn validate_exposure(exposure: f64) -> ScanResult<()> {
    if exposure.is_finite() && exposure >= 0.0 {
        Ok(())
    } else {
        Err(ScanError::InvalidRange(format!(
            "exposure must be a non-negative number, got {exposure}"
        )))
    }
}

/// Any region that can contribute to a scan schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeRegion {
    /// Linear in energy.
    Energy(EnergyRegion),
    /// Linear in wavenumber.
    Wavenumber(WavenumberRegion),
    /// Wrapped region with k-weighted exposures.
    KWeighted(KWeighted),
}

impl RangeRegion {
    /// Calculate the points and exposures of this region.
    pub fn calculate(&self) -> ScanResult<Frame> {
        self.calculate_with_default(DEFAULT_EXPOSURE)
    }

    /// Calculate, using `default_exposure` for regions without their own
    /// exposure. K-weighted regions always use their base duration.
    pub fn calculate_with_default(&self, default_exposure: f64) -> ScanResult<Frame> {
        match self {
            RangeRegion::Energy(region) => region.calculate_with_default(default_exposure),
            RangeRegion::Wavenumber(region) => region.calculate_with_default(default_exposure),
            RangeRegion::KWeighted(region) => region.calculate(),
        }
    }

    /// Reference energy of the region, if any.
    pub fn e0(&self) -> Option<f64> {
        match self {
            RangeRegion::Energy(region) => region.e0(),
            RangeRegion::Wavenumber(region) => region.e0(),
            RangeRegion::KWeighted(region) => region.e0.or_else(|| region.region.e0()),
        }
    }

    /// Axis name of the region.
    pub fn axis(&self) -> &str {
        match self {
            RangeRegion::Energy(region) => region.axis(),
            RangeRegion::Wavenumber(region) => region.axis(),
            RangeRegion::KWeighted(region) => region.region.axis(),
        }
    }
}

impl From<EnergyRegion> for RangeRegion {
    fn from(region: EnergyRegion) -> Self {
        RangeRegion::Energy(region)
    }
}

impl From<WavenumberRegion> for RangeRegion {
    fn from(region: WavenumberRegion) -> Self {
        RangeRegion::Wavenumber(region)
    }
}

impl From<KWeighted> for RangeRegion {
    fn from(region: KWeighted) -> Self {
        RangeRegion::KWeighted(region)
    }
}

// =============================================================================
// merge_ranges
// =============================================================================

/// Options for [`merge_ranges`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Sort the concatenated points before removing duplicates.
    pub sort: bool,
    /// Absolute tolerance for duplicate points.
    pub abs_tolerance: f64,
    /// Relative tolerance for duplicate points.
    pub rel_tolerance: f64,
    /// Exposure for regions that do not set one, seconds.
    pub default_exposure: f64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            sort: true,
            abs_tolerance: DEFAULT_ABS_TOLERANCE,
            rel_tolerance: DEFAULT_REL_TOLERANCE,
            default_exposure: DEFAULT_EXPOSURE,
        }
    }
}

impl MergeOptions {
    /// Keep the argument order instead of sorting.
    pub fn unsorted(mut self) -> Self {
        self.sort = false;
        self
    }
}

/// Monotonic scan points with matching exposure times.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedSchedule {
    /// Scan points, in eV.
    pub points: Vec<f64>,
    /// Exposure time for each point, in seconds.
    pub exposures: Vec<f64>,
}

impl MergedSchedule {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the schedule has no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterate over `(point, exposure)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.points.iter().copied().zip(self.exposures.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Ascending,
    Descending,
}

fn direction_of(points: &[f64]) -> Option<Direction> {
    let first = *points.first()?;
    let last = *points.last()?;
    match last.partial_cmp(&first) {
        Some(Ordering::Greater) => Some(Direction::Ascending),
        Some(Ordering::Less) => Some(Direction::Descending),
        _ => None,
    }
}

/// Combine several regions into one schedule.
///
/// Points from all regions are concatenated in argument order. With
/// `options.sort` they are stable-sorted in the direction running from the
/// first region's first point to the last region's last point. Adjacent
/// points within tolerance are then coalesced; the exposure at a coalesced
/// point comes from the region given later in `regions`.
///
/// Without sorting, regions whose directions disagree, or whose concatenation
/// is not monotonic, are rejected with [`ScanError::InvalidMerge`].
pub fn merge_ranges(regions: &[RangeRegion], options: &MergeOptions) -> ScanResult<MergedSchedule> {
    // (point, exposure, region index)
    let mut entries: Vec<(f64, f64, usize)> = Vec::new();
    let mut directions = Vec::new();
    for (index, region) in regions.iter().enumerate() {
        let frame = region.calculate_with_default(options.default_exposure)?;
        if let Some(direction) = direction_of(&frame.points) {
            directions.push(direction);
        }
        entries.extend(
            frame
                .points
                .iter()
                .zip(frame.exposures.iter())
                .map(|(p, e)| (*p, *e, index)),
        );
    }

    let overall = match (entries.first(), entries.last()) {
        (Some(first), Some(last)) if last.0 < first.0 => Direction::Descending,
        _ => Direction::Ascending,
    };

    if options.sort {
        entries.sort_by(|a, b| {
            let ordering = a.0.total_cmp(&b.0);
            match overall {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            }
        });
    } else if let Some(first) = directions.first() {
        if directions.iter().any(|d| d != first) {
            return Err(ScanError::InvalidMerge(
                "regions mix ascending and descending directions".to_string(),
            ));
        }
    }

    let mut schedule = MergedSchedule::default();
    let mut owner: Vec<usize> = Vec::new();
    for (point, exposure, index) in entries {
        if let (Some(last_point), Some(last_owner)) = (schedule.points.last(), owner.last_mut()) {
            if close(*last_point, point, options.abs_tolerance, options.rel_tolerance) {
                if index >= *last_owner {
                    *last_owner = index;
                    if let Some(last_exposure) = schedule.exposures.last_mut() {
                        *last_exposure = exposure;
                    }
                }
                continue;
            }
            let in_order = match overall {
                Direction::Ascending => point > *last_point,
                Direction::Descending => point < *last_point,
            };
            if !in_order {
                return Err(ScanError::InvalidMerge(format!(
                    "point {point} breaks monotonic order after {last_point}"
                )));
            }
        }
        schedule.points.push(point);
        schedule.exposures.push(exposure);
        owner.push(index);
    }
    Ok(schedule)
}
