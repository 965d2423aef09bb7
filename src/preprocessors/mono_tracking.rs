//! Keep the beam height constant while a coupled monochromator moves.
//!
//! Whenever a plan sets the driving signal of the secondary monochromator,
//! a `set` of the primary monochromator's beam offset is spliced in front of
//! it. The correction is computed from five live reads taken at the moment
//! the message is about to run, in this order:
//!
//! 1. tracked (primary) beam offset
//! 2. driving (secondary) beam offset
//! 3. Bragg offset
//! 4. crystal gap
//! 5. d-spacing
//!
//! The mutator only reads. All writes happen when the run engine executes
//! the spliced message.

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::coupling::{tracked_offset, CouplingConstants, CouplingReadings, DrivingAxis};
use crate::error::{ScanError, ScanResult};
use crate::hardware::monochromator::{FixedOffsetMonochromator, Monochromator};
use crate::plan::{MessageMutator, MessageStream, Msg, MutatedStream};
use crate::signal::{read_quantity, SignalRef};
use crate::units::{PhysicalQuantity, Unit};

/// Splices corrective beam-offset moves in front of driving moves.
#[derive(Clone)]
pub struct MonoTracking {
    axis: DrivingAxis,
    driving: SignalRef,
    tracked_offset: SignalRef,
    driving_offset: SignalRef,
    bragg_offset: SignalRef,
    gap: SignalRef,
    d_spacing: SignalRef,
}

impl std::fmt::Debug for MonoTracking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonoTracking")
            .field("axis", &self.axis)
            .field("driving", &self.driving.name())
            .field("tracked_offset", &self.tracked_offset.name())
            .finish()
    }
}

impl MonoTracking {
    /// Track `driving`'s motion with `tracking`'s beam offset.
    ///
    /// With [`DrivingAxis::Bragg`] the trigger is a set of `driving.bragg`,
    /// with [`DrivingAxis::Energy`] a set of `driving.energy`.
    pub fn new(axis: DrivingAxis, driving: &Monochromator, tracking: &FixedOffsetMonochromator) -> Self {
        let trigger = match axis {
            DrivingAxis::Bragg => driving.bragg.clone(),
            DrivingAxis::Energy => driving.energy.clone(),
        };
        Self {
            axis,
            driving: trigger,
            tracked_offset: tracking.beam_offset.clone(),
            driving_offset: driving.beam_offset.clone(),
            bragg_offset: driving.bragg_offset.clone(),
            gap: driving.gap.clone(),
            d_spacing: driving.d_spacing.clone(),
        }
    }

    /// Axis whose sets trigger a correction.
    pub fn axis(&self) -> DrivingAxis {
        self.axis
    }

    async fn read(&self, signal: &SignalRef) -> ScanResult<PhysicalQuantity> {
        let quantity = read_quantity(signal.as_ref()).await?;
        debug!(signal = signal.name(), value = %quantity, "read coupling input");
        Ok(quantity)
    }

    #[instrument(skip(self, msg), fields(driving = self.driving.name()), err)]
    async fn correction(&self, msg: &Msg) -> ScanResult<Msg> {
        let value = msg.value().ok_or_else(|| ScanError::SignalWrite {
            signal: self.driving.name().to_string(),
            reason: "set message carries no value".to_string(),
        })?;
        let units = self
            .driving
            .units()
            .ok_or_else(|| ScanError::MissingUnits(self.driving.name().to_string()))?;
        let target = PhysicalQuantity::new(value, units.parse::<Unit>()?);

        let readings = CouplingReadings {
            tracked_offset: self.read(&self.tracked_offset).await?,
            driving_offset: self.read(&self.driving_offset).await?,
            constants: CouplingConstants {
                bragg_offset: self.read(&self.bragg_offset).await?,
                gap: self.read(&self.gap).await?,
                d_spacing: self.read(&self.d_spacing).await?,
            },
        };
        let offset = tracked_offset(self.axis, target, &readings)?;
        debug!(target = %target, new_offset = %offset, "inserting tracking move");

        let mut corrective = Msg::set(self.tracked_offset.clone(), offset.value())
            .with_run(msg.run.clone());
        corrective.group = msg.group.clone();
        Ok(corrective)
    }
}

#[async_trait]
impl MessageMutator for MonoTracking {
    async fn insert_before(&mut self, msg: &Msg) -> ScanResult<Vec<Msg>> {
        if msg.is_set_of(&self.driving) {
            Ok(vec![self.correction(msg).await?])
        } else {
            Ok(Vec::new())
        }
    }
}

/// Make the primary monochromator's beam offset follow the secondary
/// monochromator's Bragg angle.
pub fn secondary_mono_tracking_wrapper<S: MessageStream>(
    plan: S,
    secondary_mono: &Monochromator,
    primary_mono: &FixedOffsetMonochromator,
) -> MutatedStream<S, MonoTracking> {
    MutatedStream::new(
        plan,
        MonoTracking::new(DrivingAxis::Bragg, secondary_mono, primary_mono),
    )
}

/// Keep the beam at a fixed height while the secondary monochromator is
/// driven by energy.
pub fn fixed_offset_wrapper<S: MessageStream>(
    plan: S,
    primary_mono: &FixedOffsetMonochromator,
    secondary_mono: &Monochromator,
) -> MutatedStream<S, MonoTracking> {
    MutatedStream::new(
        plan,
        MonoTracking::new(DrivingAxis::Energy, secondary_mono, primary_mono),
    )
}
