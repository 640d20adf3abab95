//! Conversion of input samples into event-space coordinates.
//!
//! The physics of the conversion lives outside this crate; the pipeline
//! only needs a converter that fills a coordinate for a row and a bin
//! value, or reports the sample as out of range.

use crate::input::DetectorInfo;

/// Row being converted.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub row: usize,
    pub detector: &'a DetectorInfo,
}

/// Maps `(row, bin value)` to an N-dimensional coordinate.
///
/// Shared by every pipeline worker.
pub trait CoordinateConverter: Send + Sync {
    /// Number of coordinates produced per sample.
    fn ndim(&self) -> usize;

    /// Writes the coordinate of one sample into `out` (length `ndim`).
    /// Returns `false` if the sample falls outside the converter's range;
    /// the contents of `out` are then unspecified.
    fn convert(&self, row: &RowContext<'_>, value: f64, out: &mut [f64]) -> bool;
}

/// One-dimensional converter passing the bin value through, limited to
/// `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdentityConverter {
    min: f64,
    max: f64,
}

impl IdentityConverter {
    pub fn new(min: f64, max: f64) -> Self {
        IdentityConverter { min, max }
    }

    /// Accepts every finite value.
    pub fn unbounded() -> Self {
        IdentityConverter {
            min: f64::MIN,
            max: f64::MAX,
        }
    }
}

impl CoordinateConverter for IdentityConverter {
    fn ndim(&self) -> usize {
        1
    }

    fn convert(&self, _row: &RowContext<'_>, value: f64, out: &mut [f64]) -> bool {
        if !(self.min..=self.max).contains(&value) {
            return false;
        }
        out[0] = value;
        true
    }
}

/// Converter backed by a closure.
pub struct FnConverter<F> {
    ndim: usize,
    convert: F,
}

impl<F> FnConverter<F>
where
    F: Fn(&RowContext<'_>, f64, &mut [f64]) -> bool + Send + Sync,
{
    pub fn new(ndim: usize, convert: F) -> Self {
        FnConverter { ndim, convert }
    }
}

impl<F> CoordinateConverter for FnConverter<F>
where
    F: Fn(&RowContext<'_>, f64, &mut [f64]) -> bool + Send + Sync,
{
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn convert(&self, row: &RowContext<'_>, value: f64, out: &mut [f64]) -> bool {
        (self.convert)(row, value, out)
    }
}

impl<F> std::fmt::Debug for FnConverter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnConverter")
            .field("ndim", &self.ndim)
            .finish_non_exhaustive()
    }
}
