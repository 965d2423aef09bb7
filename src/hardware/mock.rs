//! Mock Hardware Implementations
//!
//! Provides a simulated undulator firmware for testing without a beamline.
//! All waiting uses async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockUndulator` - Simulated trajectory firmware with injectable faults
//!
//! # Behaviour
//!
//! - Direct moves only in `NormalMode`, "next point" triggers only in `ScanMode4`
//! - A trigger after a successful step moves on to the next array index; a
//!   trigger after a missed step retries the same index
//! - Configurable settle delay (default 0ms)

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::error::{ScanError, ScanResult};
use crate::hardware::capabilities::{Deadbands, ScanMode, TrajectoryArrays, TrajectoryDevice};

// =============================================================================
// MockUndulator - Simulated Trajectory Firmware
// =============================================================================

#[derive(Debug, Default)]
struct FirmwareState {
    mode: ScanMode,
    gap: f64,
    arrays: TrajectoryArrays,
    /// Index the firmware is at, `None` before the first trigger.
    index: Option<usize>,
    /// Whether the last trigger reached its target.
    last_step_ok: bool,
    /// Remaining setup attempts that report a failed array check.
    setup_failures: u32,
    /// Upcoming triggers, `true` meaning the step silently fails.
    step_faults: VecDeque<bool>,
    direct_moves: Vec<f64>,
    triggers: u32,
    setup_attempts: u32,
    mode_history: Vec<ScanMode>,
    disconnected: bool,
}

/// Simulated undulator firmware.
///
/// Clones share the same firmware state, so a test can keep one handle for
/// inspection while the controller owns another.
///
/// # Example
///
/// ```rust,ignore
/// let undulator = MockUndulator::new("undulator").with_gap(12.0);
/// undulator.fail_next_steps(&[false, true]); // second trigger misses
/// ```
#[derive(Debug, Clone)]
pub struct MockUndulator {
    name: String,
    state: Arc<Mutex<FirmwareState>>,
    deadbands: Deadbands,
    settle_delay: Duration,
}

impl MockUndulator {
    /// Create a mock in normal mode with the gap at 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(FirmwareState {
                last_step_ok: true,
                ..Default::default()
            })),
            deadbands: Deadbands::default(),
            settle_delay: Duration::ZERO,
        }
    }

    /// Start at a given gap.
    pub fn with_gap(self, gap: f64) -> Self {
        self.state.lock().gap = gap;
        self
    }

    /// Deadbands reported to the controller.
    pub fn with_deadbands(mut self, deadbands: Deadbands) -> Self {
        self.deadbands = deadbands;
        self
    }

    /// Time [`TrajectoryDevice::wait_settled`] takes.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Start in a given scan mode.
    pub fn with_mode(self, mode: ScanMode) -> Self {
        self.state.lock().mode = mode;
        self
    }

    /// Queue step outcomes for the upcoming triggers (`true` = silently miss).
    pub fn fail_next_steps(&self, faults: &[bool]) {
        self.state.lock().step_faults.extend(faults.iter().copied());
    }

    /// Make the next `attempts` array uploads fail their checks.
    pub fn fail_setup_attempts(&self, attempts: u32) {
        self.state.lock().setup_failures = attempts;
    }

    /// Simulate losing the connection to the controller.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    /// Current firmware mode.
    pub fn mode(&self) -> ScanMode {
        self.state.lock().mode
    }

    /// Current gap.
    pub fn gap(&self) -> f64 {
        self.state.lock().gap
    }

    /// Uploaded arrays.
    pub fn arrays(&self) -> TrajectoryArrays {
        self.state.lock().arrays.clone()
    }

    /// Every direct move target, oldest first.
    pub fn direct_moves(&self) -> Vec<f64> {
        self.state.lock().direct_moves.clone()
    }

    /// Number of "next point" triggers received.
    pub fn trigger_count(&self) -> u32 {
        self.state.lock().triggers
    }

    /// Number of array uploads.
    pub fn setup_attempts(&self) -> u32 {
        self.state.lock().setup_attempts
    }

    /// Every mode written, oldest first.
    pub fn mode_history(&self) -> Vec<ScanMode> {
        self.state.lock().mode_history.clone()
    }

    fn ensure_connected(&self, state: &FirmwareState) -> ScanResult<()> {
        if state.disconnected {
            Err(ScanError::Disconnected(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TrajectoryDevice for MockUndulator {
    fn name(&self) -> &str {
        &self.name
    }

    fn deadbands(&self) -> Deadbands {
        self.deadbands
    }

    async fn scan_mode(&self) -> ScanResult<ScanMode> {
        let state = self.state.lock();
        self.ensure_connected(&state)?;
        Ok(state.mode)
    }

    async fn set_scan_mode(&self, mode: ScanMode) -> ScanResult<()> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        state.mode = mode;
        state.mode_history.push(mode);
        Ok(())
    }

    async fn load_trajectory(&self, arrays: &TrajectoryArrays) -> ScanResult<bool> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        state.setup_attempts += 1;
        state.arrays = arrays.clone();
        state.index = None;
        state.last_step_ok = true;
        if state.setup_failures > 0 {
            state.setup_failures -= 1;
            return Ok(false);
        }
        Ok(arrays.energy_dial.len() == arrays.gap.len())
    }

    async fn move_mechanical(&self, target: f64) -> ScanResult<()> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        if state.mode != ScanMode::Normal {
            return Err(ScanError::InvalidState {
                operation: "move the gap directly",
                state: state.mode.to_string(),
            });
        }
        debug!(undulator = %self.name, target, "direct gap move");
        state.direct_moves.push(target);
        state.gap = target;
        // Firmware index follows a direct move to the first array point
        if state.arrays.gap.first() == Some(&target) {
            state.index = Some(0);
        }
        Ok(())
    }

    async fn trigger_next_point(&self) -> ScanResult<()> {
        let mut state = self.state.lock();
        self.ensure_connected(&state)?;
        if state.mode != ScanMode::SoftwareRetries {
            return Err(ScanError::InvalidState {
                operation: "trigger the next point",
                state: state.mode.to_string(),
            });
        }
        state.triggers += 1;
        let index = match (state.index, state.last_step_ok) {
            (None, _) => 0,
            (Some(i), true) => i + 1,
            (Some(i), false) => i,
        };
        let Some(target) = state.arrays.gap.get(index).copied() else {
            return Err(ScanError::InvalidState {
                operation: "trigger the next point",
                state: "at the end of the scan array".to_string(),
            });
        };
        state.index = Some(index);
        let fault = state.step_faults.pop_front().unwrap_or(false);
        state.last_step_ok = !fault;
        if !fault {
            state.gap = target;
        }
        debug!(undulator = %self.name, index, target, fault, "next point");
        Ok(())
    }

    async fn wait_settled(&self, timeout: Duration) -> ScanResult<()> {
        if self.settle_delay > timeout {
            sleep(timeout).await;
            return Err(ScanError::Timeout(timeout));
        }
        sleep(self.settle_delay).await;
        Ok(())
    }

    async fn mechanical_position(&self) -> ScanResult<f64> {
        let state = self.state.lock();
        self.ensure_connected(&state)?;
        Ok(state.gap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrays() -> TrajectoryArrays {
        TrajectoryArrays {
            energy_dial: vec![8.3, 8.4, 8.5],
            gap: vec![12.0, 12.1, 12.2],
        }
    }

    #[tokio::test]
    async fn test_mock_firmware_steps() {
        let undulator = MockUndulator::new("id");
        assert!(undulator.load_trajectory(&arrays()).await.unwrap());
        undulator.move_mechanical(12.0).await.unwrap();
        undulator
            .set_scan_mode(ScanMode::SoftwareRetries)
            .await
            .unwrap();
        undulator.trigger_next_point().await.unwrap();
        assert_eq!(undulator.gap(), 12.1);
        undulator.trigger_next_point().await.unwrap();
        assert_eq!(undulator.gap(), 12.2);
        assert!(undulator.trigger_next_point().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_firmware_retries_missed_point() {
        let undulator = MockUndulator::new("id").with_mode(ScanMode::SoftwareRetries);
        undulator.load_trajectory(&arrays()).await.unwrap();
        undulator.fail_next_steps(&[false, true]);
        undulator.trigger_next_point().await.unwrap();
        assert_eq!(undulator.gap(), 12.0);
        undulator.trigger_next_point().await.unwrap();
        // Missed: still at the previous point
        assert_eq!(undulator.gap(), 12.0);
        undulator.trigger_next_point().await.unwrap();
        assert_eq!(undulator.gap(), 12.1);
        assert_eq!(undulator.trigger_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_mode_rules() {
        let undulator = MockUndulator::new("id");
        assert!(undulator.trigger_next_point().await.is_err());
        undulator
            .set_scan_mode(ScanMode::SoftwareRetries)
            .await
            .unwrap();
        assert!(undulator.move_mechanical(1.0).await.is_err());
        assert!(undulator.direct_moves().is_empty());
    }

    #[tokio::test]
    async fn test_mock_setup_failures() {
        let undulator = MockUndulator::new("id");
        undulator.fail_setup_attempts(2);
        assert!(!undulator.load_trajectory(&arrays()).await.unwrap());
        assert!(!undulator.load_trajectory(&arrays()).await.unwrap());
        assert!(undulator.load_trajectory(&arrays()).await.unwrap());
        assert_eq!(undulator.setup_attempts(), 3);
    }

    #[tokio::test]
    async fn test_mock_settle_timeout() {
        let undulator = MockUndulator::new("id").with_settle_delay(Duration::from_millis(50));
        assert!(undulator
            .wait_settled(Duration::from_millis(100))
            .await
            .is_ok());
        assert!(matches!(
            undulator.wait_settled(Duration::from_millis(10)).await,
            Err(ScanError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_disconnect() {
        let undulator = MockUndulator::new("id");
        undulator.set_disconnected(true);
        assert!(matches!(
            undulator.mechanical_position().await,
            Err(ScanError::Disconnected(_))
        ));
    }
}
