//! Firmware-driven trajectory scans.
//!
//! Instead of commanding the undulator point by point, a whole energy path is
//! uploaded to its firmware up front and the scan then advances with
//! "next point" triggers. The controller owns the lifecycle:
//!
//! ```text
//!            prepare            kickoff             advance (×N)
//!   Idle ──────────────▶ Prepared ──────────▶ Running ──────────┐
//!    ▲                      │                    │  ▲           │
//!    │                      │                    │  └───────────┘
//!    │ prepare              │ setup/verify       │ retries exhausted
//!    │                      ▼ failure            ▼
//!   Done / Failed ◀──────────────────────────  Failed
//!            unstage: Prepared|Running → Done, Failed stays Failed
//! ```
//!
//! # Invariants
//!
//! - The physics (energy), dial and mechanical (gap) arrays always have the
//!   same length, and the cursor never exceeds it.
//! - Deadbands and lookup-table limits are checked for the whole path before
//!   anything is written to the device.
//! - `kickoff` performs exactly one direct move (to the first point);
//!   `advance` only ever triggers the firmware.
//! - A failed point is retried a bounded number of times, each miss logged,
//!   then the controller enters `Failed` with the cursor left on that point.
//! - Entering `Failed` puts the device back in normal mode straight away, so
//!   a scan aborted by an error never leaves the firmware armed.
//! - At most one `advance` runs at a time; a concurrent call is rejected
//!   without waiting.
//! - `unstage` always restores normal mode and may be called repeatedly.
//!
//! [`TrajectoryPositioner`] wraps a controller as an energy [`Signal`], so an
//! unmodified step plan drives the trajectory one `set` at a time.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::TrajectoryConfig;
use crate::error::{DeadbandAxis, ScanError, ScanResult};
use crate::hardware::capabilities::{ScanMode, TrajectoryArrays, TrajectoryDevice};
use crate::hardware::lookup::LookupTable;
use crate::hardware::undulator::energy_to_dial;
use crate::signal::{Signal, SignalRef};

/// Lifecycle state of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryState {
    /// No trajectory loaded.
    Idle,
    /// Arrays uploaded, waiting for kickoff.
    Prepared,
    /// Device is stepping through the trajectory.
    Running,
    /// Trajectory finished and the device is back in normal mode.
    Done,
    /// Setup or a point failed; re-prepare to continue.
    Failed,
}

impl fmt::Display for TrajectoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrajectoryState::Idle => "idle",
            TrajectoryState::Prepared => "prepared",
            TrajectoryState::Running => "running",
            TrajectoryState::Done => "done",
            TrajectoryState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the dial offset is chosen when a trajectory is prepared.
#[derive(Debug, Clone, PartialEq)]
pub enum OffsetPolicy {
    /// A fixed offset, eV.
    Explicit(f64),
    /// Interpolated from a calibration table at the first point of the path.
    Auto(LookupTable),
}

impl OffsetPolicy {
    fn resolve(&self, first_energy: f64) -> ScanResult<f64> {
        match self {
            OffsetPolicy::Explicit(offset) => Ok(*offset),
            OffsetPolicy::Auto(table) => table.interpolate(first_energy),
        }
    }
}

/// Snapshot of the loaded trajectory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrajectoryPlan {
    /// Current lifecycle state.
    pub state: TrajectoryState,
    /// Requested energies, eV.
    pub physics: Vec<f64>,
    /// Gap for each energy.
    pub mechanical: Vec<f64>,
    /// Dial value for each energy, keV.
    pub dial: Vec<f64>,
    /// Offset used to compute the dial values, eV.
    pub offset: f64,
    /// Number of points reached so far.
    pub cursor: usize,
}

impl TrajectoryPlan {
    fn idle() -> Self {
        Self {
            state: TrajectoryState::Idle,
            physics: Vec::new(),
            mechanical: Vec::new(),
            dial: Vec::new(),
            offset: 0.0,
            cursor: 0,
        }
    }

    /// Number of points in the trajectory.
    pub fn len(&self) -> usize {
        self.physics.len()
    }

    /// Whether no trajectory is loaded.
    pub fn is_empty(&self) -> bool {
        self.physics.is_empty()
    }

    /// Energy of the next point to be reached, if any.
    pub fn next_point(&self) -> Option<f64> {
        self.physics.get(self.cursor).copied()
    }
}

/// Clears the in-flight flag when an advance finishes, however it finishes.
struct AdvanceGuard<'a>(&'a AtomicBool);

impl Drop for AdvanceGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives a [`TrajectoryDevice`] through a precomputed path.
pub struct TrajectoryScanController<D> {
    device: Arc<D>,
    config: TrajectoryConfig,
    gap_table: LookupTable,
    offset: Mutex<OffsetPolicy>,
    plan: Mutex<TrajectoryPlan>,
    advancing: AtomicBool,
}

impl<D> fmt::Debug for TrajectoryScanController<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrajectoryScanController")
            .field("config", &self.config)
            .field("plan", &*self.plan.lock())
            .finish_non_exhaustive()
    }
}

impl<D: TrajectoryDevice> TrajectoryScanController<D> {
    /// Create a controller.
    ///
    /// `gap_table` maps energy (eV) to gap and defines the energies a
    /// trajectory may visit.
    pub fn new(
        device: Arc<D>,
        gap_table: LookupTable,
        offset: OffsetPolicy,
        config: TrajectoryConfig,
    ) -> Self {
        Self {
            device,
            config,
            gap_table,
            offset: Mutex::new(offset),
            plan: Mutex::new(TrajectoryPlan::idle()),
            advancing: AtomicBool::new(false),
        }
    }

    /// Load the gap and offset tables named in `config`.
    pub fn from_config(device: Arc<D>, config: TrajectoryConfig) -> ScanResult<Self> {
        let gap_path = config.gap_table.as_ref().ok_or_else(|| {
            ScanError::Configuration("trajectory.gap_table is required".to_string())
        })?;
        let gap_table = LookupTable::from_path(gap_path)?;
        let offset = match &config.offset_table {
            Some(path) => OffsetPolicy::Auto(LookupTable::from_path(path)?),
            None => OffsetPolicy::Explicit(0.0),
        };
        Ok(Self::new(device, gap_table, offset, config))
    }

    /// The controlled device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Current state.
    pub fn state(&self) -> TrajectoryState {
        self.plan.lock().state
    }

    /// Number of points reached.
    pub fn cursor(&self) -> usize {
        self.plan.lock().cursor
    }

    /// Snapshot of the loaded trajectory.
    pub fn plan(&self) -> TrajectoryPlan {
        self.plan.lock().clone()
    }

    /// Change the offset policy. Applies from the next `prepare`; a
    /// prepared trajectory keeps its dial values.
    pub fn set_offset_policy(&self, policy: OffsetPolicy) {
        *self.offset.lock() = policy;
    }

    fn transition(&self, to: TrajectoryState) {
        let mut plan = self.plan.lock();
        if plan.state != to {
            info!(device = self.device.name(), from = %plan.state, to = %to, "trajectory state");
            plan.state = to;
        }
    }

    /// Enter `Failed` and put the device back in normal mode.
    ///
    /// A failure to restore the mode is logged; the caller's error wins.
    async fn fail(&self) {
        self.transition(TrajectoryState::Failed);
        if let Err(err) = self.device.set_scan_mode(ScanMode::Normal).await {
            error!(error = %err, "could not restore normal scan mode");
        }
    }

    fn invalid(&self, operation: &'static str) -> ScanError {
        ScanError::InvalidState {
            operation,
            state: self.state().to_string(),
        }
    }

    /// Compute every array and check deadbands without touching the device.
    fn build(&self, path: &[f64]) -> ScanResult<(TrajectoryArrays, f64)> {
        let first = *path.first().ok_or_else(|| {
            ScanError::InvalidRange("a trajectory needs at least one point".to_string())
        })?;
        let mechanical = self.gap_table.interpolate_all(path)?;
        let deadbands = self.device.deadbands();
        deadbands.check_path(DeadbandAxis::Energy, path)?;
        deadbands.check_path(DeadbandAxis::Gap, &mechanical)?;
        let offset = self.offset.lock().resolve(first)?;
        let energy_dial = path.iter().map(|e| energy_to_dial(*e, offset)).collect();
        Ok((
            TrajectoryArrays {
                energy_dial,
                gap: mechanical,
            },
            offset,
        ))
    }

    /// Upload a path of energies (eV) and arm the firmware.
    ///
    /// Valid from `Idle`, `Prepared`, `Done` and `Failed`.
    #[instrument(skip(self, path), fields(device = self.device.name(), points = path.len()))]
    pub async fn prepare(&self, path: &[f64]) -> ScanResult<()> {
        if self.state() == TrajectoryState::Running {
            return Err(self.invalid("prepare"));
        }
        let (arrays, offset) = self.build(path)?;

        let mode = self.device.scan_mode().await?;
        debug!(%mode, "current scan mode");
        if mode != ScanMode::Normal {
            self.device.set_scan_mode(ScanMode::Normal).await?;
        }

        let attempts = self.config.setup_retries.max(1);
        let mut accepted = false;
        for attempt in 1..=attempts {
            if self.device.load_trajectory(&arrays).await? {
                accepted = true;
                break;
            }
            warn!(attempt, attempts, "scan arrays rejected by firmware");
        }
        if !accepted {
            error!(attempts, "trajectory setup failed");
            self.device.set_scan_mode(ScanMode::Normal).await?;
            return Err(ScanError::SetupFailed { attempts });
        }

        self.device.set_scan_mode(ScanMode::SoftwareRetries).await?;
        {
            let mut plan = self.plan.lock();
            *plan = TrajectoryPlan {
                state: plan.state,
                physics: path.to_vec(),
                mechanical: arrays.gap,
                dial: arrays.energy_dial,
                offset,
                cursor: 0,
            };
        }
        self.transition(TrajectoryState::Prepared);
        Ok(())
    }

    /// Move directly to the first point and start the trajectory.
    ///
    /// Returns the energy of the first point.
    #[instrument(skip(self), fields(device = self.device.name()))]
    pub async fn kickoff(&self) -> ScanResult<f64> {
        let (first_energy, first_gap) = {
            let plan = self.plan.lock();
            if plan.state != TrajectoryState::Prepared {
                return Err(ScanError::InvalidState {
                    operation: "kickoff",
                    state: plan.state.to_string(),
                });
            }
            (plan.physics[0], plan.mechanical[0])
        };

        let result = async {
            self.device.set_scan_mode(ScanMode::Normal).await?;
            self.device.move_mechanical(first_gap).await?;
            self.device.wait_settled(self.config.settle_timeout).await?;
            self.device.set_scan_mode(ScanMode::SoftwareRetries).await
        }
        .await;

        if let Err(err) = result {
            error!(error = %err, "kickoff failed");
            self.fail().await;
            return Err(err);
        }
        self.plan.lock().cursor = 1;
        self.transition(TrajectoryState::Running);
        Ok(first_energy)
    }

    /// Step to the next point, retrying a missed point.
    ///
    /// Returns the energy of the point reached.
    pub async fn advance(&self) -> ScanResult<f64> {
        if self
            .advancing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(ScanError::AdvanceInProgress);
        }
        let _guard = AdvanceGuard(&self.advancing);
        self.advance_inner().await
    }

    #[instrument(skip(self), fields(device = self.device.name()))]
    async fn advance_inner(&self) -> ScanResult<f64> {
        let (index, energy, target) = {
            let plan = self.plan.lock();
            if plan.state != TrajectoryState::Running {
                return Err(ScanError::InvalidState {
                    operation: "advance",
                    state: plan.state.to_string(),
                });
            }
            if plan.cursor >= plan.len() {
                return Err(ScanError::InvalidState {
                    operation: "advance",
                    state: "at the end of the trajectory".to_string(),
                });
            }
            (plan.cursor, plan.physics[plan.cursor], plan.mechanical[plan.cursor])
        };

        let attempts = self.config.max_retries + 1;
        let mut readback = f64::NAN;
        for attempt in 1..=attempts {
            let reached = self.step(target).await;
            match reached {
                Ok(position) if (position - target).abs() <= self.config.position_tolerance => {
                    self.plan.lock().cursor = index + 1;
                    debug!(index, attempt, energy, "point reached");
                    return Ok(energy);
                }
                Ok(position) => {
                    readback = position;
                    warn!(index, attempt, target, readback, "trajectory point missed");
                }
                Err(err) => {
                    error!(index, attempt, error = %err, "trajectory step failed");
                    self.fail().await;
                    return Err(err);
                }
            }
        }

        error!(index, attempts, target, readback, "trajectory point not reached");
        self.fail().await;
        Err(ScanError::TrajectoryFailed {
            index,
            attempts,
            target,
            readback,
        })
    }

    async fn step(&self, target: f64) -> ScanResult<f64> {
        debug!(target, "triggering next point");
        self.device.trigger_next_point().await?;
        self.device.wait_settled(self.config.settle_timeout).await?;
        self.device.mechanical_position().await
    }

    /// Restore normal mode. `Prepared`/`Running` become `Done`; `Failed`
    /// stays `Failed`. Safe to call any number of times.
    #[instrument(skip(self), fields(device = self.device.name()))]
    pub async fn unstage(&self) -> ScanResult<()> {
        let result = self.device.set_scan_mode(ScanMode::Normal).await;
        if matches!(
            self.state(),
            TrajectoryState::Prepared | TrajectoryState::Running
        ) {
            self.transition(TrajectoryState::Done);
        }
        result
    }
}

// =============================================================================
// TrajectoryPositioner - Energy Signal Backed by a Trajectory
// =============================================================================

/// Absolute tolerance when matching a requested energy to the next point, eV.
const POINT_ABS_TOLERANCE: f64 = 1e-6;
/// Relative tolerance when matching a requested energy to the next point.
const POINT_REL_TOLERANCE: f64 = 1e-9;

fn same_point(requested: f64, expected: f64) -> bool {
    (requested - expected).abs()
        <= POINT_ABS_TOLERANCE + POINT_REL_TOLERANCE * expected.abs()
}

/// Exposes a [`TrajectoryScanController`] as an ordinary energy signal.
///
/// Plans keep issuing `set(energy)` for every point; while a trajectory is
/// prepared or running, those sets become `kickoff` and `advance` calls. The
/// requested energy must be the next point of the trajectory. Outside a
/// trajectory, sets go to the optional fallback signal (usually the
/// undulator's plain energy setpoint).
pub struct TrajectoryPositioner<D> {
    name: String,
    controller: Arc<TrajectoryScanController<D>>,
    fallback: Option<SignalRef>,
    reached: watch::Sender<f64>,
}

impl<D> fmt::Debug for TrajectoryPositioner<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrajectoryPositioner")
            .field("name", &self.name)
            .field("last_point", &*self.reached.borrow())
            .finish_non_exhaustive()
    }
}

impl<D: TrajectoryDevice> TrajectoryPositioner<D> {
    /// Wrap a controller.
    pub fn new(name: impl Into<String>, controller: Arc<TrajectoryScanController<D>>) -> Self {
        let (reached, _) = watch::channel(f64::NAN);
        Self {
            name: name.into(),
            controller,
            fallback: None,
            reached,
        }
    }

    /// Signal to write when no trajectory is loaded.
    pub fn with_fallback(mut self, fallback: SignalRef) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// The wrapped controller.
    pub fn controller(&self) -> &Arc<TrajectoryScanController<D>> {
        &self.controller
    }

    fn check_point(&self, index: usize, requested: f64, expected: Option<f64>) -> ScanResult<()> {
        match expected {
            Some(expected) if same_point(requested, expected) => Ok(()),
            Some(expected) => Err(ScanError::TrajectoryMismatch {
                index,
                requested,
                expected,
            }),
            None => Err(ScanError::InvalidState {
                operation: "set",
                state: "at the end of the trajectory".to_string(),
            }),
        }
    }
}

#[async_trait]
impl<D: TrajectoryDevice + 'static> Signal<f64> for TrajectoryPositioner<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn units(&self) -> Option<&str> {
        Some("eV")
    }

    async fn get_value(&self) -> ScanResult<f64> {
        match self.controller.state() {
            TrajectoryState::Prepared | TrajectoryState::Running | TrajectoryState::Failed => {
                Ok(*self.reached.borrow())
            }
            TrajectoryState::Idle | TrajectoryState::Done => match &self.fallback {
                Some(fallback) => fallback.get_value().await,
                None => Ok(*self.reached.borrow()),
            },
        }
    }

    async fn set(&self, value: f64) -> ScanResult<()> {
        let plan = self.controller.plan();
        let reached = match plan.state {
            TrajectoryState::Prepared => {
                self.check_point(0, value, plan.physics.first().copied())?;
                self.controller.kickoff().await?
            }
            TrajectoryState::Running => {
                self.check_point(plan.cursor, value, plan.next_point())?;
                self.controller.advance().await?
            }
            TrajectoryState::Idle | TrajectoryState::Done => match &self.fallback {
                Some(fallback) => {
                    fallback.set(value).await?;
                    value
                }
                None => {
                    return Err(ScanError::InvalidState {
                        operation: "set",
                        state: plan.state.to_string(),
                    })
                }
            },
            TrajectoryState::Failed => {
                return Err(ScanError::InvalidState {
                    operation: "set",
                    state: plan.state.to_string(),
                })
            }
        };
        self.reached.send_replace(reached);
        Ok(())
    }

    fn subscribe(&self) -> ScanResult<watch::Receiver<f64>> {
        Ok(self.reached.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::Deadbands;
    use crate::hardware::mock::MockUndulator;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn gap_table() -> LookupTable {
        // gap [mm] = 10 + energy [keV]
        LookupTable::new(vec![5000.0, 20000.0], vec![15.0, 30.0]).unwrap()
    }

    fn config() -> TrajectoryConfig {
        TrajectoryConfig {
            max_retries: 2,
            setup_retries: 3,
            settle_timeout: Duration::from_secs(1),
            position_tolerance: 1e-6,
            ..Default::default()
        }
    }

    fn controller(undulator: &MockUndulator) -> TrajectoryScanController<MockUndulator> {
        TrajectoryScanController::new(
            Arc::new(undulator.clone()),
            gap_table(),
            OffsetPolicy::Explicit(20.0),
            config(),
        )
    }

    const PATH: [f64; 3] = [8000.0, 8100.0, 8200.0];

    #[tokio::test]
    async fn test_full_lifecycle() {
        let undulator = MockUndulator::new("undulator");
        let controller = controller(&undulator);
        assert_eq!(controller.state(), TrajectoryState::Idle);

        controller.prepare(&PATH).await.unwrap();
        assert_eq!(controller.state(), TrajectoryState::Prepared);
        assert_eq!(undulator.mode(), ScanMode::SoftwareRetries);
        let arrays = undulator.arrays();
        assert_eq!(arrays.len(), 3);
        for (gap, expected) in arrays.gap.iter().zip([18.0, 18.1, 18.2]) {
            assert!((gap - expected).abs() < 1e-9);
        }
        assert!((arrays.energy_dial[0] - 8.02).abs() < 1e-12);

        assert_eq!(controller.kickoff().await.unwrap(), 8000.0);
        assert_eq!(controller.state(), TrajectoryState::Running);
        assert_eq!(undulator.direct_moves(), vec![18.0]);

        assert_eq!(controller.advance().await.unwrap(), 8100.0);
        assert_eq!(controller.advance().await.unwrap(), 8200.0);
        assert_eq!(controller.cursor(), 3);

        // Exactly one direct move; every other step was a trigger
        assert_eq!(undulator.direct_moves().len(), 1);
        assert_eq!(undulator.trigger_count(), 2);

        assert!(matches!(
            controller.advance().await,
            Err(ScanError::InvalidState { .. })
        ));

        controller.unstage().await.unwrap();
        assert_eq!(controller.state(), TrajectoryState::Done);
        assert_eq!(undulator.mode(), ScanMode::Normal);
        controller.unstage().await.unwrap();
        assert_eq!(controller.state(), TrajectoryState::Done);
    }

    #[tokio::test]
    async fn test_out_of_table_path_writes_nothing() {
        let undulator = MockUndulator::new("undulator");
        let controller = controller(&undulator);
        let result = controller.prepare(&[8000.0, 25000.0]).await;
        assert!(matches!(
            result,
            Err(ScanError::InvalidLookupRange { value, .. }) if value == 25000.0
        ));
        assert_eq!(controller.state(), TrajectoryState::Idle);
        assert_eq!(undulator.setup_attempts(), 0);
        assert!(undulator.mode_history().is_empty());
    }

    #[tokio::test]
    async fn test_deadband_checked_before_upload() {
        let undulator = MockUndulator::new("undulator").with_deadbands(Deadbands {
            energy: 5.0,
            ..Default::default()
        });
        let controller = controller(&undulator);
        let result = controller.prepare(&[8000.0, 8002.0, 8100.0]).await;
        assert!(matches!(
            result,
            Err(ScanError::InvalidDeadband {
                axis: DeadbandAxis::Energy,
                ..
            })
        ));
        assert_eq!(undulator.setup_attempts(), 0);
    }

    #[tokio::test]
    async fn test_setup_retries() {
        let undulator = MockUndulator::new("undulator");
        let controller = controller(&undulator);
        undulator.fail_setup_attempts(2);
        controller.prepare(&PATH).await.unwrap();
        assert_eq!(undulator.setup_attempts(), 3);

        let undulator = MockUndulator::new("undulator");
        let controller = self::controller(&undulator);
        undulator.fail_setup_attempts(3);
        assert!(matches!(
            controller.prepare(&PATH).await,
            Err(ScanError::SetupFailed { attempts: 3 })
        ));
        assert_eq!(controller.state(), TrajectoryState::Idle);
        assert_eq!(undulator.mode(), ScanMode::Normal);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missed_point_is_retried() {
        let undulator = MockUndulator::new("undulator");
        let controller = controller(&undulator);
        controller.prepare(&PATH).await.unwrap();
        controller.kickoff().await.unwrap();

        undulator.fail_next_steps(&[true]);
        assert_eq!(controller.advance().await.unwrap(), 8100.0);
        assert_eq!(undulator.trigger_count(), 2);
        assert!(logs_contain("trajectory point missed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retries_exhausted() {
        let undulator = MockUndulator::new("undulator");
        let controller = controller(&undulator);
        controller.prepare(&PATH).await.unwrap();
        controller.kickoff().await.unwrap();

        undulator.fail_next_steps(&[true, true, true]);
        let result = controller.advance().await;
        assert!(matches!(
            result,
            Err(ScanError::TrajectoryFailed {
                index: 1,
                attempts: 3,
                ..
            })
        ));
        assert_eq!(controller.state(), TrajectoryState::Failed);
        // Cursor stays on the failed point
        assert_eq!(controller.cursor(), 1);
        assert_eq!(undulator.trigger_count(), 3);
        assert!(logs_contain("trajectory point not reached"));
        // The failure itself disarmed the firmware
        assert_eq!(undulator.mode(), ScanMode::Normal);

        // Cleanup is still possible, and repeatable
        controller.unstage().await.unwrap();
        controller.unstage().await.unwrap();
        assert_eq!(controller.state(), TrajectoryState::Failed);
        assert_eq!(undulator.mode(), ScanMode::Normal);

        assert!(matches!(
            controller.advance().await,
            Err(ScanError::InvalidState { .. })
        ));

        // A fresh prepare recovers
        controller.prepare(&PATH).await.unwrap();
        assert_eq!(controller.state(), TrajectoryState::Prepared);
        assert_eq!(controller.cursor(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_calls() {
        let undulator = MockUndulator::new("undulator");
        let controller = controller(&undulator);
        assert!(controller.kickoff().await.is_err());
        assert!(controller.advance().await.is_err());

        controller.prepare(&PATH).await.unwrap();
        assert!(controller.advance().await.is_err());
        controller.kickoff().await.unwrap();
        assert!(controller.kickoff().await.is_err());
        assert!(matches!(
            controller.prepare(&PATH).await,
            Err(ScanError::InvalidState { .. })
        ));

        // Unstage from Idle is a harmless no-op
        let idle = self::controller(&MockUndulator::new("other"));
        idle.unstage().await.unwrap();
        assert_eq!(idle.state(), TrajectoryState::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_advance_rejected() {
        let undulator = MockUndulator::new("undulator").with_settle_delay(Duration::from_millis(50));
        let controller = controller(&undulator);
        controller.prepare(&PATH).await.unwrap();
        controller.kickoff().await.unwrap();

        let (first, second) = tokio::join!(controller.advance(), controller.advance());
        assert_eq!(first.unwrap(), 8100.0);
        assert!(matches!(second, Err(ScanError::AdvanceInProgress)));
        // The rejected call did not touch the state machine
        assert_eq!(controller.state(), TrajectoryState::Running);
        assert_eq!(controller.cursor(), 2);
    }

    #[tokio::test]
    async fn test_offset_change_keeps_prepared_dial() {
        let undulator = MockUndulator::new("undulator");
        let controller = controller(&undulator);
        controller.prepare(&PATH).await.unwrap();
        let before = controller.plan().dial;

        controller.set_offset_policy(OffsetPolicy::Explicit(100.0));
        assert_eq!(controller.plan().dial, before);
        assert_eq!(undulator.arrays().energy_dial, before);

        controller.unstage().await.unwrap();
        controller.prepare(&PATH).await.unwrap();
        assert!((controller.plan().dial[0] - 8.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_auto_offset_policy() {
        let undulator = MockUndulator::new("undulator");
        let offsets = LookupTable::new(vec![5000.0, 10000.0], vec![-40.0, -30.0]).unwrap();
        let controller = TrajectoryScanController::new(
            Arc::new(undulator.clone()),
            gap_table(),
            OffsetPolicy::Auto(offsets),
            config(),
        );
        controller.prepare(&PATH).await.unwrap();
        let plan = controller.plan();
        assert!((plan.offset - -34.0).abs() < 1e-9);
        assert!((plan.dial[0] - 7.966).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_kickoff_settle_timeout_fails() {
        let undulator = MockUndulator::new("undulator").with_settle_delay(Duration::from_secs(5));
        let controller = TrajectoryScanController::new(
            Arc::new(undulator.clone()),
            gap_table(),
            OffsetPolicy::Explicit(0.0),
            TrajectoryConfig {
                settle_timeout: Duration::from_millis(10),
                ..config()
            },
        );
        controller.prepare(&PATH).await.unwrap();
        assert!(matches!(
            controller.kickoff().await,
            Err(ScanError::Timeout(_))
        ));
        assert_eq!(controller.state(), TrajectoryState::Failed);
        assert_eq!(undulator.mode(), ScanMode::Normal);
        controller.unstage().await.unwrap();
        assert_eq!(undulator.mode(), ScanMode::Normal);
    }

    #[tokio::test]
    async fn test_failure_restores_normal_mode_without_unstage() {
        let undulator = MockUndulator::new("undulator");
        let controller = TrajectoryScanController::new(
            Arc::new(undulator.clone()),
            gap_table(),
            OffsetPolicy::Explicit(20.0),
            TrajectoryConfig {
                max_retries: 0,
                ..config()
            },
        );
        controller.prepare(&PATH).await.unwrap();
        controller.kickoff().await.unwrap();
        assert_eq!(undulator.mode(), ScanMode::SoftwareRetries);

        undulator.fail_next_steps(&[true]);
        assert!(matches!(
            controller.advance().await,
            Err(ScanError::TrajectoryFailed { attempts: 1, .. })
        ));
        assert_eq!(controller.state(), TrajectoryState::Failed);
        assert_eq!(undulator.mode_history().last(), Some(&ScanMode::Normal));
    }

    #[tokio::test]
    async fn test_positioner_drives_trajectory() {
        let undulator = MockUndulator::new("undulator");
        let controller = Arc::new(controller(&undulator));
        let positioner = TrajectoryPositioner::new("undulator-energy", Arc::clone(&controller));
        let mut rx = positioner.subscribe().unwrap();

        controller.prepare(&PATH).await.unwrap();
        for energy in PATH {
            positioner.set(energy).await.unwrap();
            assert_eq!(positioner.get_value().await.unwrap(), energy);
        }
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 8200.0);
        assert_eq!(undulator.direct_moves().len(), 1);
        assert_eq!(undulator.trigger_count(), 2);
        controller.unstage().await.unwrap();
    }

    #[tokio::test]
    async fn test_positioner_rejects_unexpected_energy() {
        let undulator = MockUndulator::new("undulator");
        let controller = Arc::new(controller(&undulator));
        let positioner = TrajectoryPositioner::new("undulator-energy", Arc::clone(&controller));
        controller.prepare(&PATH).await.unwrap();
        positioner.set(8000.0).await.unwrap();

        assert!(matches!(
            positioner.set(8200.0).await,
            Err(ScanError::TrajectoryMismatch { index: 1, .. })
        ));
        // Nothing was triggered and the trajectory is still usable
        assert_eq!(undulator.trigger_count(), 0);
        positioner.set(8100.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_positioner_fallback_outside_trajectory() {
        let undulator = MockUndulator::new("undulator");
        let controller = Arc::new(controller(&undulator));
        let bare = TrajectoryPositioner::new("undulator-energy", Arc::clone(&controller));
        assert!(matches!(
            bare.set(9000.0).await,
            Err(ScanError::InvalidState { .. })
        ));

        let setpoint = crate::signal::SoftSignal::new("undulator-energy-sp", 0.0).with_units("eV");
        let positioner = TrajectoryPositioner::new("undulator-energy", controller)
            .with_fallback(setpoint.handle());
        positioner.set(9000.0).await.unwrap();
        assert_eq!(setpoint.put_history(), vec![9000.0]);
        assert_eq!(positioner.get_value().await.unwrap(), 9000.0);
        assert!(undulator.direct_moves().is_empty());
    }
}
