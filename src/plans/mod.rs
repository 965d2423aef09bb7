//! Scan plans.

pub mod energy_scan;

pub use energy_scan::{xafs_scan, EnergyScan, EnergyScanBuilder, Exposure, ScanSignals};
