//! Energy-scan coordination for X-ray absorption spectroscopy beamlines.
//!
//! The crate turns a description of an XAFS scan into coordinated motion of
//! the beamline optics:
//!
//! - [`ranges`]: energy and wavenumber regions merged into one monotonic
//!   schedule of points and exposure times
//! - [`units`]: unit-tagged quantities and the X-ray conversions between
//!   energy, wavelength, Bragg angle and wavenumber
//! - [`plan`] and [`plans`]: scan plans as streams of instructions
//! - [`preprocessors`]: stream rewriters that shift the primary
//!   monochromator's beam offset whenever the secondary one moves
//! - [`trajectory`]: firmware-driven undulator trajectories with bounded
//!   per-point retries
//! - [`engine`]: executes a stream against device signals and reports
//!   documents
//!
//! Configuration is loaded with [`config::ScanConfig`] and logging is set up
//! with [`logging::init_from_config`].

pub mod config;
pub mod coupling;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod plan;
pub mod plans;
pub mod preprocessors;
pub mod ranges;
pub mod signal;
pub mod trajectory;
pub mod units;

pub use config::ScanConfig;
pub use error::{ScanError, ScanResult};
