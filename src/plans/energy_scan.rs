//! Energy scans: step the X-ray energy through a list of points and read
//! detectors at each one.
//!
//! For each point the plan yields:
//!
//! ```text
//! checkpoint
//! set(energy_signal, E)  ... for every energy signal      ┐ group "point-i"
//! set(time_signal, t)    ... for every exposure signal    ┘
//! wait("point-i")
//! read(energy_signal) ...  read(detector) ...
//! save
//! ```
//!
//! wrapped in a single `open_run` / `close_run` pair. The whole message
//! sequence is computed when the plan is built, so a plan never touches
//! hardware itself.

use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use tracing::debug;

use crate::error::{ScanError, ScanResult};
use crate::plan::{Msg, Plan};
use crate::ranges::{merge_ranges, MergeOptions, RangeRegion, DEFAULT_EXPOSURE};
use crate::signal::SignalRef;

/// Plan name for [`EnergyScan`]
pub const ENERGY_SCAN: &str = "energy_scan";
/// Plan name for [`xafs_scan`]
pub const XAFS_SCAN: &str = "xafs_scan";

/// Exposure for each point: one value for all, or one per point.
#[derive(Debug, Clone, PartialEq)]
pub enum Exposure {
    /// Same exposure at every point, seconds.
    Constant(f64),
    /// Exposure per point, seconds.
    PerPoint(Vec<f64>),
}

impl Default for Exposure {
    fn default() -> Self {
        Exposure::Constant(DEFAULT_EXPOSURE)
    }
}

impl From<f64> for Exposure {
    fn from(exposure: f64) -> Self {
        Exposure::Constant(exposure)
    }
}

impl From<Vec<f64>> for Exposure {
    fn from(exposures: Vec<f64>) -> Self {
        Exposure::PerPoint(exposures)
    }
}

/// Builder for [`EnergyScan`].
///
/// # Example
///
/// ```rust,ignore
/// let plan = EnergyScan::builder((0..100).map(|i| i as f64).collect())
///     .e0(13000.0)
///     .exposure(0.5)
///     .energy_signal(mono.energy.clone())
///     .energy_signal(undulator_energy.clone())
///     .time_signal(ion_chamber_time.clone())
///     .detector(i0.clone())
///     .build()?;
/// ```
#[derive(Default)]
pub struct EnergyScanBuilder {
    name: Option<String>,
    energies: Vec<f64>,
    exposure: Exposure,
    e0: f64,
    energy_signals: Vec<SignalRef>,
    time_signals: Vec<SignalRef>,
    detectors: Vec<SignalRef>,
    metadata: Map<String, Value>,
}

impl EnergyScanBuilder {
    /// Exposure for each point.
    pub fn exposure(mut self, exposure: impl Into<Exposure>) -> Self {
        self.exposure = exposure.into();
        self
    }

    /// Edge energy; every energy is relative to it.
    pub fn e0(mut self, e0: f64) -> Self {
        self.e0 = e0;
        self
    }

    /// Signal that receives each energy.
    pub fn energy_signal(mut self, signal: SignalRef) -> Self {
        self.energy_signals.push(signal);
        self
    }

    /// Signal that receives each exposure time.
    pub fn time_signal(mut self, signal: SignalRef) -> Self {
        self.time_signals.push(signal);
        self
    }

    /// Signal read at every point.
    pub fn detector(mut self, signal: SignalRef) -> Self {
        self.detectors.push(signal);
        self
    }

    /// Extra run metadata. Overrides the plan's own keys.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn plan_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Validate the arguments and compute the message sequence.
    ///
    /// # Errors
    ///
    /// - [`ScanError::NoEnergies`] if there are no energies
    /// - [`ScanError::Configuration`] if no energy signal was given
    /// - [`ScanError::InvalidRange`] if the exposures do not match the energies
    pub fn build(self) -> ScanResult<EnergyScan> {
        if self.energies.is_empty() {
            return Err(ScanError::NoEnergies);
        }
        if self.energy_signals.is_empty() {
            return Err(ScanError::Configuration(
                "an energy scan needs at least one energy signal".to_string(),
            ));
        }
        let exposures = match self.exposure {
            Exposure::Constant(exposure) => vec![exposure; self.energies.len()],
            Exposure::PerPoint(exposures) if exposures.len() == self.energies.len() => exposures,
            Exposure::PerPoint(exposures) => {
                return Err(ScanError::InvalidRange(format!(
                    "{} exposures given for {} energies",
                    exposures.len(),
                    self.energies.len()
                )))
            }
        };
        if let Some(bad) = exposures.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return Err(ScanError::InvalidRange(format!(
                "exposure must be a non-negative number, got {bad}"
            )));
        }
        let energies: Vec<f64> = self.energies.iter().map(|e| e + self.e0).collect();
        let name = self.name.unwrap_or_else(|| ENERGY_SCAN.to_string());

        let mut metadata = Map::new();
        metadata.insert("plan_name".into(), json!(name));
        metadata.insert("E0".into(), json!(self.e0));
        metadata.insert("energies".into(), json!(energies));
        metadata.insert("exposures".into(), json!(exposures));
        metadata.extend(self.metadata);

        let mut queue = VecDeque::new();
        queue.push_back(Msg::open_run(metadata.clone()));
        for (index, (energy, exposure)) in energies.iter().zip(&exposures).enumerate() {
            let group = format!("point-{index}");
            queue.push_back(Msg::checkpoint());
            for signal in &self.energy_signals {
                queue.push_back(Msg::set(signal.clone(), *energy).with_group(&group));
            }
            for signal in &self.time_signals {
                queue.push_back(Msg::set(signal.clone(), *exposure).with_group(&group));
            }
            queue.push_back(Msg::wait(group));
            for signal in self.energy_signals.iter().chain(&self.detectors) {
                queue.push_back(Msg::read(signal.clone()));
            }
            queue.push_back(Msg::save());
        }
        queue.push_back(Msg::close_run());
        debug!(plan = %name, points = energies.len(), messages = queue.len(), "plan built");

        Ok(EnergyScan {
            name,
            energies,
            exposures,
            metadata,
            queue,
        })
    }
}

/// A list scan over X-ray energies.
#[derive(Debug)]
pub struct EnergyScan {
    name: String,
    energies: Vec<f64>,
    exposures: Vec<f64>,
    metadata: Map<String, Value>,
    queue: VecDeque<Msg>,
}

impl EnergyScan {
    /// Start building a scan over `energies` (eV, relative to E0 if one is
    /// given).
    pub fn builder(energies: Vec<f64>) -> EnergyScanBuilder {
        EnergyScanBuilder {
            energies,
            ..Default::default()
        }
    }

    /// Absolute energies, eV.
    pub fn energies(&self) -> &[f64] {
        &self.energies
    }

    /// Exposure for each energy, seconds.
    pub fn exposures(&self) -> &[f64] {
        &self.exposures
    }

    /// Metadata passed to `open_run`.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Messages not yet yielded.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl Plan for EnergyScan {
    fn plan_name(&self) -> &str {
        &self.name
    }

    fn next_message(&mut self) -> Option<Msg> {
        self.queue.pop_front()
    }
}

/// Signals an XAFS scan drives and reads.
#[derive(Clone, Default)]
pub struct ScanSignals {
    /// Signals that receive each energy (monochromators, undulators).
    pub energy: Vec<SignalRef>,
    /// Signals that receive each exposure time.
    pub time: Vec<SignalRef>,
    /// Signals read at every point.
    pub detectors: Vec<SignalRef>,
}

/// Scan across an absorption edge.
///
/// `regions` are relative to `e0` and are merged with [`merge_ranges`];
/// their k-weighted exposures are set on the time signals.
///
/// # Errors
///
/// Region and merge errors are returned unchanged; a merge that produces no
/// points fails with [`ScanError::NoEnergies`].
pub fn xafs_scan(
    regions: &[RangeRegion],
    e0: f64,
    signals: ScanSignals,
    options: &MergeOptions,
) -> ScanResult<EnergyScan> {
    let schedule = merge_ranges(regions, options)?;
    if schedule.is_empty() {
        return Err(ScanError::NoEnergies);
    }
    let region_kinds: Vec<Value> = regions
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()
        .map_err(|e| ScanError::InvalidRange(e.to_string()))?;

    let builder = EnergyScan::builder(schedule.points)
        .plan_name(XAFS_SCAN)
        .e0(e0)
        .exposure(schedule.exposures)
        .metadata("regions", region_kinds);
    let builder = signals
        .energy
        .into_iter()
        .fold(builder, EnergyScanBuilder::energy_signal);
    let builder = signals
        .time
        .into_iter()
        .fold(builder, EnergyScanBuilder::time_signal);
    signals
        .detectors
        .into_iter()
        .fold(builder, EnergyScanBuilder::detector)
        .build()
}
