//! Planar undulator built from control-system signals.
//!
//! The undulator exposes its energy axis as a *dial* in keV that differs
//! from the true photon energy by a calibration offset:
//!
//! ```text
//! energy [eV] = dial [keV] · 1000 − offset [eV]
//! dial [keV]  = (energy [eV] + offset [eV]) / 1000
//! ```
//!
//! The offset is either set explicitly or taken from a calibration table
//! with [`PlanarUndulator::auto_offset`].
//!
//! For trajectory scans the firmware holds an energy array and a gap array.
//! After an upload it reports two array checks and a mismatch count; setup
//! only counts as successful when both checks pass with no mismatches.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::capabilities::{Deadbands, ScanMode, TrajectoryArrays, TrajectoryDevice};
use super::lookup::LookupTable;
use crate::config::ScanConfig;
use crate::error::{DeadbandAxis, ScanError, ScanResult};
use crate::signal::{SignalRef, SoftSignal};

/// Time the "next point" trigger is held high.
pub const DEFAULT_TRIGGER_PULSE: Duration = Duration::from_millis(100);

/// Convert a dial reading (keV) to photon energy (eV).
pub fn dial_to_energy(kev: f64, offset: f64) -> f64 {
    kev * 1000.0 - offset
}

/// Convert a photon energy (eV) to the dial representation (keV).
pub fn energy_to_dial(energy: f64, offset: f64) -> f64 {
    (energy + offset) / 1000.0
}

/// Signals of a planar undulator.
#[derive(Clone)]
pub struct UndulatorSignals {
    /// Energy dial setpoint, keV.
    pub energy_dial_setpoint: SignalRef,
    /// Energy dial readback, keV.
    pub energy_dial_readback: SignalRef,
    /// Offset between dial and photon energy, eV.
    pub energy_offset: SignalRef,
    /// Energy taper setpoint.
    pub energy_taper_setpoint: SignalRef,
    /// Gap setpoint.
    pub gap_setpoint: SignalRef,
    /// Gap readback.
    pub gap_readback: SignalRef,
    /// Gap taper setpoint.
    pub gap_taper_setpoint: SignalRef,
    /// True while any axis is moving.
    pub busy: SignalRef<bool>,
    /// Firmware scan mode.
    pub scan_mode: SignalRef<ScanMode>,
    /// Writing `true` clears the scan arrays.
    pub clear_scan_array: SignalRef<bool>,
    /// Number of points in the scan arrays.
    pub scan_array_length: SignalRef<usize>,
    /// Energy scan array (dial units).
    pub scan_energy_array: SignalRef<Vec<f64>>,
    /// Gap scan array.
    pub scan_gap_array: SignalRef<Vec<f64>>,
    /// Pulsed to move to the next scan point.
    pub scan_next_point: SignalRef<bool>,
    /// Number of energy/gap mismatches found by the firmware.
    pub scan_mismatch_count: SignalRef<u32>,
    /// Gap array accepted by the firmware.
    pub scan_gap_array_check: SignalRef<bool>,
    /// Energy array accepted by the firmware.
    pub scan_energy_array_check: SignalRef<bool>,
    /// Index of the current scan point.
    pub scan_current_index: SignalRef<usize>,
}

/// APS-style planar undulator.
pub struct PlanarUndulator {
    name: String,
    signals: UndulatorSignals,
    deadbands: RwLock<Deadbands>,
    offset_table: Option<LookupTable>,
    trigger_pulse: Duration,
}

impl std::fmt::Debug for PlanarUndulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanarUndulator")
            .field("name", &self.name)
            .field("deadbands", &*self.deadbands.read())
            .field("offset_table", &self.offset_table.is_some())
            .finish()
    }
}

impl PlanarUndulator {
    /// Create an undulator from its signals.
    pub fn new(name: impl Into<String>, signals: UndulatorSignals) -> Self {
        Self {
            name: name.into(),
            signals,
            deadbands: RwLock::new(Deadbands::default()),
            offset_table: None,
            trigger_pulse: DEFAULT_TRIGGER_PULSE,
        }
    }

    /// Create an undulator with the configured deadbands and, when
    /// `trajectory.offset_table` is set, its calibration table.
    pub fn from_config(
        name: impl Into<String>,
        signals: UndulatorSignals,
        config: &ScanConfig,
    ) -> ScanResult<Self> {
        config.validate()?;
        let device = Self::new(name, signals).with_deadbands(config.deadbands);
        match &config.trajectory.offset_table {
            Some(path) => Ok(device.with_offset_table(LookupTable::from_path(path)?)),
            None => Ok(device),
        }
    }

    /// Initial deadbands.
    pub fn with_deadbands(self, deadbands: Deadbands) -> Self {
        *self.deadbands.write() = deadbands;
        self
    }

    /// Calibration table used by [`Self::auto_offset`].
    pub fn with_offset_table(mut self, table: LookupTable) -> Self {
        self.offset_table = Some(table);
        self
    }

    /// How long the "next point" trigger is held high.
    pub fn with_trigger_pulse(mut self, pulse: Duration) -> Self {
        self.trigger_pulse = pulse;
        self
    }

    /// Underlying signals.
    pub fn signals(&self) -> &UndulatorSignals {
        &self.signals
    }

    /// Replace one deadband.
    pub fn set_deadband(&self, axis: DeadbandAxis, deadband: f64) -> ScanResult<()> {
        if !deadband.is_finite() || deadband < 0.0 {
            return Err(ScanError::Configuration(format!(
                "{axis} deadband must be a non-negative number, got {deadband}"
            )));
        }
        let mut deadbands = self.deadbands.write();
        match axis {
            DeadbandAxis::Energy => deadbands.energy = deadband,
            DeadbandAxis::Gap => deadbands.gap = deadband,
            DeadbandAxis::EnergyTaper => deadbands.energy_taper = deadband,
            DeadbandAxis::GapTaper => deadbands.gap_taper = deadband,
        }
        Ok(())
    }

    /// Offset for `energy` interpolated from the calibration table.
    pub fn auto_offset(&self, energy: f64) -> ScanResult<f64> {
        let table = self.offset_table.as_ref().ok_or_else(|| {
            ScanError::Configuration(format!("{} has no offset table", self.name))
        })?;
        table.interpolate(energy)
    }

    /// Write the calibrated offset for `energy` to the offset signal.
    pub async fn apply_auto_offset(&self, energy: f64) -> ScanResult<f64> {
        let offset = self.auto_offset(energy)?;
        info!(undulator = %self.name, energy, offset, "applying calibrated offset");
        self.signals.energy_offset.set(offset).await?;
        Ok(offset)
    }

    /// Photon energy from the dial readback, eV.
    pub async fn energy(&self) -> ScanResult<f64> {
        let dial = self.signals.energy_dial_readback.get_value().await?;
        let offset = self.signals.energy_offset.get_value().await?;
        Ok(dial_to_energy(dial, offset))
    }

    /// Move to a photon energy (eV) through the dial setpoint.
    pub async fn set_energy(&self, energy: f64) -> ScanResult<()> {
        let offset = self.signals.energy_offset.get_value().await?;
        let current = dial_to_energy(self.signals.energy_dial_setpoint.get_value().await?, offset);
        self.deadbands
            .read()
            .check(DeadbandAxis::Energy, energy - current)?;
        self.signals
            .energy_dial_setpoint
            .set(energy_to_dial(energy, offset))
            .await
    }

    async fn checked_set(&self, signal: &SignalRef, axis: DeadbandAxis, value: f64) -> ScanResult<()> {
        let current = signal.get_value().await?;
        self.deadbands.read().check(axis, value - current)?;
        signal.set(value).await
    }

    /// Move the gap.
    pub async fn set_gap(&self, gap: f64) -> ScanResult<()> {
        self.checked_set(&self.signals.gap_setpoint, DeadbandAxis::Gap, gap)
            .await
    }

    /// Move the energy taper.
    pub async fn set_energy_taper(&self, taper: f64) -> ScanResult<()> {
        self.checked_set(&self.signals.energy_taper_setpoint, DeadbandAxis::EnergyTaper, taper)
            .await
    }

    /// Move the gap taper.
    pub async fn set_gap_taper(&self, taper: f64) -> ScanResult<()> {
        self.checked_set(&self.signals.gap_taper_setpoint, DeadbandAxis::GapTaper, taper)
            .await
    }

    /// Whether the last array upload was accepted.
    pub async fn scan_setup_successful(&self) -> ScanResult<bool> {
        let mismatched = self.signals.scan_mismatch_count.get_value().await?;
        let gap_ok = self.signals.scan_gap_array_check.get_value().await?;
        let energy_ok = self.signals.scan_energy_array_check.get_value().await?;
        debug!(mismatched, gap_ok, energy_ok, "scan array checks");
        Ok(gap_ok && energy_ok && mismatched == 0)
    }
}

#[async_trait]
impl TrajectoryDevice for PlanarUndulator {
    fn name(&self) -> &str {
        &self.name
    }

    fn deadbands(&self) -> Deadbands {
        *self.deadbands.read()
    }

    async fn scan_mode(&self) -> ScanResult<ScanMode> {
        self.signals.scan_mode.get_value().await
    }

    async fn set_scan_mode(&self, mode: ScanMode) -> ScanResult<()> {
        debug!(undulator = %self.name, %mode, "setting scan mode");
        self.signals.scan_mode.set(mode).await
    }

    #[instrument(skip(self, arrays), fields(undulator = %self.name, points = arrays.len()))]
    async fn load_trajectory(&self, arrays: &TrajectoryArrays) -> ScanResult<bool> {
        self.signals.clear_scan_array.set(true).await?;
        self.signals.scan_array_length.set(arrays.len()).await?;
        self.signals
            .scan_energy_array
            .set(arrays.energy_dial.clone())
            .await?;
        self.signals.scan_gap_array.set(arrays.gap.clone()).await?;
        self.scan_setup_successful().await
    }

    async fn move_mechanical(&self, target: f64) -> ScanResult<()> {
        let mode = self.scan_mode().await?;
        if mode != ScanMode::Normal {
            return Err(ScanError::InvalidState {
                operation: "move the gap directly",
                state: mode.to_string(),
            });
        }
        self.set_gap(target).await
    }

    async fn trigger_next_point(&self) -> ScanResult<()> {
        self.signals.scan_next_point.set(true).await?;
        tokio::time::sleep(self.trigger_pulse).await;
        self.signals.scan_next_point.set(false).await
    }

    async fn wait_settled(&self, timeout: Duration) -> ScanResult<()> {
        let mut rx = self.signals.busy.subscribe()?;
        let name = self.signals.busy.name().to_string();
        let settled = async move {
            loop {
                if !*rx.borrow_and_update() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(ScanError::Disconnected(name.clone()));
                }
            }
        };
        tokio::time::timeout(timeout, settled)
            .await
            .map_err(|_| ScanError::Timeout(timeout))?
    }

    async fn mechanical_position(&self) -> ScanResult<f64> {
        self.signals.gap_readback.get_value().await
    }
}

// =============================================================================
// Simulated signals
// =============================================================================

/// Soft signals behind a simulated [`PlanarUndulator`].
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct SoftUndulator {
    pub energy_dial_setpoint: SoftSignal<f64>,
    pub energy_dial_readback: SoftSignal<f64>,
    pub energy_offset: SoftSignal<f64>,
    pub energy_taper_setpoint: SoftSignal<f64>,
    pub gap_setpoint: SoftSignal<f64>,
    pub gap_readback: SoftSignal<f64>,
    pub gap_taper_setpoint: SoftSignal<f64>,
    pub busy: SoftSignal<bool>,
    pub scan_mode: SoftSignal<ScanMode>,
    pub clear_scan_array: SoftSignal<bool>,
    pub scan_array_length: SoftSignal<usize>,
    pub scan_energy_array: SoftSignal<Vec<f64>>,
    pub scan_gap_array: SoftSignal<Vec<f64>>,
    pub scan_next_point: SoftSignal<bool>,
    pub scan_mismatch_count: SoftSignal<u32>,
    pub scan_gap_array_check: SoftSignal<bool>,
    pub scan_energy_array_check: SoftSignal<bool>,
    pub scan_current_index: SoftSignal<usize>,
}

impl SoftUndulator {
    /// Create soft signals named `{prefix}:...`.
    pub fn new(prefix: &str) -> Self {
        let float = |suffix: &str, units: &str| {
            SoftSignal::new(format!("{prefix}:{suffix}"), 0.0).with_units(units)
        };
        Self {
            energy_dial_setpoint: float("EnergySetC", "keV"),
            energy_dial_readback: float("EnergyM", "keV"),
            energy_offset: float("EnergyOffset", "eV"),
            energy_taper_setpoint: float("TaperEnergySetC", "keV"),
            gap_setpoint: float("GapSetC", "mm"),
            gap_readback: float("GapM", "mm").read_only(),
            gap_taper_setpoint: float("TaperGapSetC", "mm"),
            busy: SoftSignal::new(format!("{prefix}:BusyM"), false).read_only(),
            scan_mode: SoftSignal::new(format!("{prefix}:GapScanModeSetC"), ScanMode::Normal),
            clear_scan_array: SoftSignal::new(format!("{prefix}:GapArraySetClearC"), false),
            scan_array_length: SoftSignal::new(format!("{prefix}:GapArrayLenC"), 0),
            scan_energy_array: SoftSignal::new(format!("{prefix}:EnergyArraySetC"), Vec::new()),
            scan_gap_array: SoftSignal::new(format!("{prefix}:GapArraySetC"), Vec::new()),
            scan_next_point: SoftSignal::new(format!("{prefix}:MoveToNextGapC"), false),
            scan_mismatch_count: SoftSignal::new(format!("{prefix}:MismatchCountM"), 0),
            scan_gap_array_check: SoftSignal::new(format!("{prefix}:GapArrayCheckM"), true),
            scan_energy_array_check: SoftSignal::new(format!("{prefix}:EnergyArrayCheckM"), true),
            scan_current_index: SoftSignal::new(format!("{prefix}:ScanIndexM"), 0).read_only(),
        }
    }

    /// Signal handles sharing these soft signals.
    pub fn signals(&self) -> UndulatorSignals {
        UndulatorSignals {
            energy_dial_setpoint: self.energy_dial_setpoint.handle(),
            energy_dial_readback: self.energy_dial_readback.handle(),
            energy_offset: self.energy_offset.handle(),
            energy_taper_setpoint: self.energy_taper_setpoint.handle(),
            gap_setpoint: self.gap_setpoint.handle(),
            gap_readback: self.gap_readback.handle(),
            gap_taper_setpoint: self.gap_taper_setpoint.handle(),
            busy: self.busy.handle(),
            scan_mode: self.scan_mode.handle(),
            clear_scan_array: self.clear_scan_array.handle(),
            scan_array_length: self.scan_array_length.handle(),
            scan_energy_array: self.scan_energy_array.handle(),
            scan_gap_array: self.scan_gap_array.handle(),
            scan_next_point: self.scan_next_point.handle(),
            scan_mismatch_count: self.scan_mismatch_count.handle(),
            scan_gap_array_check: self.scan_gap_array_check.handle(),
            scan_energy_array_check: self.scan_energy_array_check.handle(),
            scan_current_index: self.scan_current_index.handle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn undulator() -> (SoftUndulator, PlanarUndulator) {
        let soft = SoftUndulator::new("S25ID:USID");
        let device = PlanarUndulator::new("undulator", soft.signals())
            .with_trigger_pulse(Duration::from_millis(1));
        (soft, device)
    }

    #[test]
    fn test_dial_conversion() {
        assert_eq!(dial_to_energy(10.0, 50.0), 9950.0);
        assert_eq!(energy_to_dial(9950.0, 50.0), 10.0);
    }

    #[tokio::test]
    async fn test_energy_applies_offset() {
        let (soft, device) = undulator();
        soft.energy_offset.set_readback(-30.0);
        soft.energy_dial_readback.set_readback(8.3);
        assert!((device.energy().await.unwrap() - 8330.0).abs() < 1e-9);

        device.set_energy(8500.0).await.unwrap();
        let written = soft.energy_dial_setpoint.put_history();
        assert_eq!(written.len(), 1);
        assert!((written[0] - 8.47).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_sub_deadband_set_is_rejected_before_write() {
        let (soft, device) = undulator();
        device.set_deadband(DeadbandAxis::Gap, 0.01).unwrap();
        soft.gap_setpoint.set_readback(12.0);

        let result = device.set_gap(12.005).await;
        assert!(matches!(
            result,
            Err(ScanError::InvalidDeadband {
                axis: DeadbandAxis::Gap,
                ..
            })
        ));
        assert!(soft.gap_setpoint.put_history().is_empty());

        // Zero-length moves and moves beyond the deadband are fine
        device.set_gap(12.0).await.unwrap();
        device.set_gap(12.5).await.unwrap();
        assert_eq!(soft.gap_setpoint.put_history(), vec![12.0, 12.5]);
    }

    #[tokio::test]
    async fn test_taper_deadbands() {
        let (soft, device) = undulator();
        device.set_deadband(DeadbandAxis::EnergyTaper, 0.1).unwrap();
        device.set_deadband(DeadbandAxis::GapTaper, 0.1).unwrap();
        assert!(device.set_energy_taper(0.05).await.is_err());
        assert!(device.set_gap_taper(-0.05).await.is_err());
        assert!(device.set_gap_taper(0.2).await.is_ok());
        assert!(soft.energy_taper_setpoint.put_history().is_empty());
        assert!(device.set_deadband(DeadbandAxis::Energy, -1.0).is_err());
    }

    #[tokio::test]
    async fn test_auto_offset() {
        let table = LookupTable::new(vec![5000.0, 10000.0], vec![-40.0, -30.0]).unwrap();
        let (soft, device) = undulator();
        let device = device.with_offset_table(table);
        assert_eq!(device.auto_offset(7500.0).unwrap(), -35.0);
        assert!(matches!(
            device.auto_offset(12000.0),
            Err(ScanError::InvalidLookupRange { .. })
        ));
        device.apply_auto_offset(10000.0).await.unwrap();
        assert_eq!(soft.energy_offset.current(), -30.0);

        let (_, bare) = undulator();
        assert!(matches!(
            bare.auto_offset(7500.0),
            Err(ScanError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_applies_deadbands_and_offset_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("offset.tsv");
        std::fs::write(&table, "energy\toffset\n5000\t-40\n10000\t-30\n").unwrap();

        let mut config = ScanConfig::default();
        config.deadbands.energy = 5.0;
        config.trajectory.offset_table = Some(table);
        let soft = SoftUndulator::new("S25ID:USID");
        let device = PlanarUndulator::from_config("undulator", soft.signals(), &config).unwrap();

        assert_eq!(device.deadbands().energy, 5.0);
        assert_eq!(device.auto_offset(7500.0).unwrap(), -35.0);
        assert!(matches!(
            device.set_energy(2.0).await,
            Err(ScanError::InvalidDeadband {
                axis: DeadbandAxis::Energy,
                ..
            })
        ));
        assert!(soft.energy_dial_setpoint.put_history().is_empty());

        config.deadbands.gap = -1.0;
        assert!(PlanarUndulator::from_config("undulator", soft.signals(), &config).is_err());
    }

    #[tokio::test]
    async fn test_load_trajectory_reports_checks() {
        let (soft, device) = undulator();
        let arrays = TrajectoryArrays {
            energy_dial: vec![8.3, 8.4],
            gap: vec![12.0, 12.2],
        };
        assert!(device.load_trajectory(&arrays).await.unwrap());
        assert_eq!(soft.scan_array_length.current(), 2);
        assert_eq!(soft.scan_gap_array.current(), vec![12.0, 12.2]);
        assert_eq!(soft.clear_scan_array.put_history(), vec![true]);

        soft.scan_mismatch_count.set_readback(1);
        assert!(!device.load_trajectory(&arrays).await.unwrap());
    }

    #[tokio::test]
    async fn test_trigger_pulses_next_point() {
        let (soft, device) = undulator();
        device.trigger_next_point().await.unwrap();
        assert_eq!(soft.scan_next_point.put_history(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_direct_move_requires_normal_mode() {
        let (soft, device) = undulator();
        device.set_scan_mode(ScanMode::SoftwareRetries).await.unwrap();
        assert!(matches!(
            device.move_mechanical(12.0).await,
            Err(ScanError::InvalidState { .. })
        ));
        assert!(soft.gap_setpoint.put_history().is_empty());
    }

    #[tokio::test]
    async fn test_wait_settled() {
        let (soft, device) = undulator();
        soft.busy.set_readback(true);
        let busy = soft.busy.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            busy.set_readback(false);
        });
        device.wait_settled(Duration::from_secs(2)).await.unwrap();

        soft.busy.set_readback(true);
        assert!(matches!(
            device.wait_settled(Duration::from_millis(20)).await,
            Err(ScanError::Timeout(_))
        ));
    }
}
