//! Tabular input consumed by the population pipeline.
//!
//! Each row (spectrum) carries an X axis, per-bin signal and error arrays
//! and optionally the detector it was recorded by. Rows without a detector,
//! or whose detector is masked or a monitor, contribute nothing.

use crate::errors::{BoxError, BoxResult};

pub type DetectorId = i64;

/// Detector attached to an input row.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorInfo {
    pub id: DetectorId,
    /// Scattering angle, azimuth and secondary flight path, as the
    /// converter needs them
    pub position: [f64; 3],
    pub masked: bool,
    pub monitor: bool,
}

impl DetectorInfo {
    pub fn new(id: DetectorId, position: [f64; 3]) -> Self {
        DetectorInfo {
            id,
            position,
            masked: false,
            monitor: false,
        }
    }

    pub fn masked(mut self) -> Self {
        self.masked = true;
        self
    }

    pub fn monitor(mut self) -> Self {
        self.monitor = true;
        self
    }

    /// Whether samples recorded by this detector should be converted.
    pub fn is_usable(&self) -> bool {
        !self.masked && !self.monitor
    }
}

/// Read access to a table of spectra.
///
/// Implementations are shared by all pipeline workers, so they must be
/// `Sync`.
pub trait SpectrumSource: Sync {
    fn row_count(&self) -> usize;

    /// X values: bin boundaries (histogram, one more than the bins) or
    /// bin points (same length as the bins).
    fn x(&self, row: usize) -> &[f64];

    /// Signal per bin.
    fn y(&self, row: usize) -> &[f64];

    /// Error per bin (not squared).
    fn e(&self, row: usize) -> &[f64];

    fn detector(&self, row: usize) -> Option<&DetectorInfo>;

    /// Number of bins in `row`.
    fn bin_count(&self, row: usize) -> usize {
        self.y(row).len()
    }

    fn is_histogram(&self, row: usize) -> bool {
        self.x(row).len() == self.y(row).len() + 1
    }

    /// Value handed to the converter for a bin: the bin centre for
    /// histograms, the point itself otherwise.
    fn bin_value(&self, row: usize, bin: usize) -> f64 {
        let x = self.x(row);
        if self.is_histogram(row) {
            0.5 * (x[bin] + x[bin + 1])
        } else {
            x[bin]
        }
    }

    /// The detector of `row` if it is present, unmasked and not a monitor.
    fn usable_detector(&self, row: usize) -> Option<&DetectorInfo> {
        self.detector(row).filter(|d| d.is_usable())
    }

    /// Checks the table shape before any sample is converted.
    ///
    /// # Errors
    ///
    /// Returns [`BoxError::InvalidInput`] if the table has no rows, no
    /// usable row, or a row whose X, Y and E lengths disagree.
    fn validate(&self) -> BoxResult<()> {
        let rows = self.row_count();
        if rows == 0 {
            return Err(BoxError::InvalidInput("table has no rows".into()));
        }
        let mut usable = 0;
        for row in 0..rows {
            let (x, y, e) = (self.x(row).len(), self.y(row).len(), self.e(row).len());
            if e != y || (x != y && x != y + 1) {
                return Err(BoxError::InvalidInput(format!(
                    "row {} has {} x, {} y and {} e values",
                    row, x, y, e
                )));
            }
            if self.usable_detector(row).is_some() {
                usable += 1;
            }
        }
        if usable == 0 {
            return Err(BoxError::InvalidInput(format!(
                "none of the {} rows has a usable detector",
                rows
            )));
        }
        Ok(())
    }

    /// Total number of bins over all rows.
    fn sample_count(&self) -> usize {
        (0..self.row_count()).map(|row| self.bin_count(row)).sum()
    }
}

/// One row of a [`Workspace2D`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spectrum {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub e: Vec<f64>,
    pub detector: Option<DetectorInfo>,
}

impl Spectrum {
    pub fn new(x: Vec<f64>, y: Vec<f64>, e: Vec<f64>) -> Self {
        Spectrum {
            x,
            y,
            e,
            detector: None,
        }
    }

    pub fn with_detector(mut self, detector: DetectorInfo) -> Self {
        self.detector = Some(detector);
        self
    }
}

/// In-memory table of spectra.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workspace2D {
    spectra: Vec<Spectrum>,
}

impl Workspace2D {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, spectrum: Spectrum) {
        self.spectra.push(spectrum);
    }

    pub fn spectrum(&self, row: usize) -> Option<&Spectrum> {
        self.spectra.get(row)
    }

    pub fn spectra(&self) -> &[Spectrum] {
        &self.spectra
    }
}

impl FromIterator<Spectrum> for Workspace2D {
    fn from_iter<I: IntoIterator<Item = Spectrum>>(iter: I) -> Self {
        Workspace2D {
            spectra: iter.into_iter().collect(),
        }
    }
}

impl SpectrumSource for Workspace2D {
    fn row_count(&self) -> usize {
        self.spectra.len()
    }

    fn x(&self, row: usize) -> &[f64] {
        &self.spectra[row].x
    }

    fn y(&self, row: usize) -> &[f64] {
        &self.spectra[row].y
    }

    fn e(&self, row: usize) -> &[f64] {
        &self.spectra[row].e
    }

    fn detector(&self, row: usize) -> Option<&DetectorInfo> {
        self.spectra[row].detector.as_ref()
    }
}
