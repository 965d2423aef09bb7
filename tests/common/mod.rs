//! Common test utilities for xafs_daq integration tests
//!
//! This module provides reusable test helpers for:
//! - Simulated coupled monochromators preloaded with calibration constants
//! - Tab-separated lookup tables written to temporary files
//! - Float comparisons with an explicit tolerance

#![allow(dead_code)] // Utilities may not all be used by every test binary

use std::io::Write;
use std::path::PathBuf;

use tempfile::TempDir;
use xafs_daq::hardware::{
    FixedOffsetMonochromator, Monochromator, SoftFixedOffsetMonochromator, SoftMonochromator,
};

/// Bragg offset of the secondary monochromator, arcseconds.
pub const BRAGG_OFFSET: f64 = -2159.15;
/// Crystal gap of the secondary monochromator, µm.
pub const GAP: f64 = 4000.0;
/// Si(111) d-spacing, Å.
pub const D_SPACING: f64 = 3.1356;
/// Beam offset of the secondary monochromator at the start, µm.
pub const SECONDARY_BEAM_OFFSET: f64 = 7503.055409;
/// Beam offset of the primary monochromator at the start, µm.
pub const PRIMARY_BEAM_OFFSET: f64 = 10_000.0;

/// Simulated primary and secondary monochromators.
pub struct MonoRig {
    pub primary: SoftFixedOffsetMonochromator,
    pub secondary: SoftMonochromator,
    pub primary_device: FixedOffsetMonochromator,
    pub secondary_device: Monochromator,
}

impl MonoRig {
    /// Both monochromators with the calibration constants above.
    pub fn new() -> Self {
        let primary = SoftFixedOffsetMonochromator::new("primary_mono");
        let secondary = SoftMonochromator::new("secondary_mono");
        primary.beam_offset.set_readback(PRIMARY_BEAM_OFFSET);
        secondary.beam_offset.set_readback(SECONDARY_BEAM_OFFSET);
        secondary.bragg_offset.set_readback(BRAGG_OFFSET);
        secondary.gap.set_readback(GAP);
        secondary.d_spacing.set_readback(D_SPACING);
        Self {
            primary_device: primary.device("primary_mono"),
            secondary_device: secondary.device("secondary_mono"),
            primary,
            secondary,
        }
    }
}

/// Write a two-column tab-separated table into `dir` and return its path.
pub fn write_table(dir: &TempDir, name: &str, header: (&str, &str), rows: &[(f64, f64)]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("create table");
    writeln!(file, "{}\t{}", header.0, header.1).expect("write header");
    for (x, y) in rows {
        writeln!(file, "{x}\t{y}").expect("write row");
    }
    path
}

/// Assert `actual` is within `tolerance` of `expected`.
pub fn assert_near(actual: f64, expected: f64, tolerance: f64, context: &str) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "{context}: expected {expected} ± {tolerance}, got {actual}"
    );
}
