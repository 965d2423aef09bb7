//! Beamline devices.
//!
//! Signal-level device bundles for the monochromators and the undulator,
//! the [`TrajectoryDevice`] capability used by the trajectory controller,
//! calibration lookup tables and a simulated undulator firmware.

pub mod capabilities;
pub mod lookup;
pub mod mock;
pub mod monochromator;
pub mod undulator;

pub use capabilities::{Deadbands, ScanMode, TrajectoryArrays, TrajectoryDevice};
pub use lookup::LookupTable;
pub use mock::MockUndulator;
pub use monochromator::{
    FixedOffsetMonochromator, Monochromator, SoftFixedOffsetMonochromator, SoftMonochromator,
};
pub use undulator::{PlanarUndulator, SoftUndulator, UndulatorSignals};
