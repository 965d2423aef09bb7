//! Calibration lookup tables.
//!
//! Undulator calibrations (energy → gap, energy → dial offset) are stored as
//! two-column, tab-separated text files with a header row:
//!
//! ```text
//! energy	offset
//! 5000	-42.1
//! 10000	-38.7
//! 20000	-31.0
//! ```
//!
//! The first column must be strictly monotonic. Values in between are
//! linearly interpolated; queries outside the table are refused rather than
//! extrapolated.

use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use tracing::debug;

use crate::error::{ScanError, ScanResult};

#[derive(Debug, Deserialize)]
struct Row(f64, f64);

/// A monotonic two-column lookup table.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl LookupTable {
    /// Build a table from columns. `xs` may be increasing or decreasing.
    pub fn new(mut xs: Vec<f64>, mut ys: Vec<f64>) -> ScanResult<Self> {
        if xs.len() != ys.len() {
            return Err(ScanError::LookupTable(format!(
                "column lengths differ ({} vs {})",
                xs.len(),
                ys.len()
            )));
        }
        if xs.len() < 2 {
            return Err(ScanError::LookupTable(
                "a lookup table needs at least two rows".to_string(),
            ));
        }
        if xs.iter().chain(ys.iter()).any(|v| !v.is_finite()) {
            return Err(ScanError::LookupTable(
                "lookup table contains non-finite values".to_string(),
            ));
        }
        if xs[0] > xs[1] {
            xs.reverse();
            ys.reverse();
        }
        if let Some(pair) = xs.windows(2).find(|pair| pair[1] <= pair[0]) {
            return Err(ScanError::LookupTable(format!(
                "first column is not strictly monotonic near {}",
                pair[0]
            )));
        }
        Ok(Self { xs, ys })
    }

    /// Parse a tab-separated table with a header row.
    pub fn from_reader<R: Read>(reader: R) -> ScanResult<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(reader);
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for row in csv.deserialize() {
            let Row(x, y) = row?;
            xs.push(x);
            ys.push(y);
        }
        Self::new(xs, ys)
    }

    /// Load a table from disk.
    pub fn from_path(path: impl AsRef<Path>) -> ScanResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading lookup table");
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Smallest and largest value of the first column.
    pub fn domain(&self) -> (f64, f64) {
        (self.xs[0], self.xs[self.xs.len() - 1])
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    /// Always false; a table has at least two rows.
    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    /// Linearly interpolate the second column at `x`.
    pub fn interpolate(&self, x: f64) -> ScanResult<f64> {
        let (min, max) = self.domain();
        if !(min..=max).contains(&x) {
            return Err(ScanError::InvalidLookupRange { value: x, min, max });
        }
        // Index of the first row strictly greater than x
        let upper = self.xs.partition_point(|v| *v <= x);
        if upper == 0 {
            return Ok(self.ys[0]);
        }
        if upper >= self.xs.len() {
            return Ok(self.ys[self.ys.len() - 1]);
        }
        let (x0, x1) = (self.xs[upper - 1], self.xs[upper]);
        let (y0, y1) = (self.ys[upper - 1], self.ys[upper]);
        Ok(y0 + (y1 - y0) * (x - x0) / (x1 - x0))
    }

    /// Interpolate every value of `xs`, failing on the first one outside the
    /// table.
    pub fn interpolate_all(&self, xs: &[f64]) -> ScanResult<Vec<f64>> {
        xs.iter().map(|x| self.interpolate(*x)).collect()
    }
}
