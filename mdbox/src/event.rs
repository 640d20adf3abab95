//! Event records stored in leaf boxes.

use serde::{Deserialize, Serialize};

use crate::extents::Coordinate;

/// Number of leading columns in a flattened event row before the
/// coordinates: signal, error-squared, origin id.
pub const EVENT_HEADER_COLUMNS: usize = 3;

/// Identifier of the input row (detector spectrum) an event came from
pub type OriginId = u32;

/// A single converted measurement: a point in the event space plus its
/// signal and squared error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdEvent {
    pub coordinate: Coordinate,
    pub signal: f64,
    pub error_squared: f64,
    pub origin_id: OriginId,
}

impl MdEvent {
    pub fn new(coordinate: &[f64], signal: f64, error_squared: f64, origin_id: OriginId) -> Self {
        MdEvent {
            coordinate: Coordinate::from_slice(coordinate),
            signal,
            error_squared,
            origin_id,
        }
    }

    pub fn ndim(&self) -> usize {
        self.coordinate.len()
    }

    /// Width of one flattened event row for `ndim` dimensions.
    pub fn row_width(ndim: usize) -> usize {
        EVENT_HEADER_COLUMNS + ndim
    }

    /// Appends this event as one `event_data` row:
    /// `signal, error_squared, origin_id, c0, c1, ...`.
    pub fn write_row(&self, out: &mut Vec<f64>) {
        out.push(self.signal);
        out.push(self.error_squared);
        out.push(self.origin_id as f64);
        out.extend_from_slice(&self.coordinate);
    }

    /// Decodes one `event_data` row. The caller guarantees
    /// `row.len() == row_width(ndim)`.
    pub fn from_row(row: &[f64]) -> Self {
        MdEvent {
            signal: row[0],
            error_squared: row[1],
            origin_id: row[2] as OriginId,
            coordinate: Coordinate::from_slice(&row[EVENT_HEADER_COLUMNS..]),
        }
    }
}
