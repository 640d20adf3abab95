//! Error types for box tree construction, population and persistence.
//!
//! Errors fall in three groups:
//! - configuration and input errors, raised before any event is inserted
//! - structural errors, raised while rebuilding a tree from flat arrays
//! - I/O and container errors from the persistence layer
//!
//! Per-sample problems during population (NaN signal, out-of-range
//! coordinates, masked rows) are never errors; they are counted in the
//! population report instead.

use std::io;
use thiserror::Error;

/// Errors that can occur while building, populating or persisting a box tree
#[derive(Debug, Error)]
pub enum BoxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Box controller configuration cannot change once the tree holds data")]
    ConfigurationLocked,

    #[error("Dimensionality mismatch: expected {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid input table: {0}")]
    InvalidInput(String),

    #[error("Coordinate {coordinate:?} is outside the tree extents")]
    OutOfBounds { coordinate: Vec<f64> },

    #[error("Structural error in '{array}' at index {index}: {message}")]
    Structural {
        array: &'static str,
        index: usize,
        message: String,
    },

    #[error("Events of box {box_id} are still on disk; load them first")]
    EventsNotLoaded { box_id: usize },

    #[error("Container error: {0}")]
    Container(String),

    #[error("Group '{0}' not found")]
    GroupNotFound(String),

    #[error("Dataset '{dataset}' not found in group '{group}'")]
    DatasetNotFound { group: String, dataset: String },

    #[error("Attribute '{attribute}' not found in group '{group}'")]
    AttributeNotFound { group: String, attribute: String },
}

impl BoxError {
    /// Builds a structural error for the given flat array and index.
    pub fn structural(array: &'static str, index: usize, message: impl Into<String>) -> Self {
        BoxError::Structural {
            array,
            index,
            message: message.into(),
        }
    }

    /// Returns true for errors that reject a configuration or input table
    /// before any work is done.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            BoxError::InvalidConfiguration(_)
                | BoxError::ConfigurationLocked
                | BoxError::DimensionMismatch { .. }
                | BoxError::InvalidInput(_)
        )
    }

    /// Returns true for errors found while validating a flat box structure.
    pub fn is_structural(&self) -> bool {
        matches!(self, BoxError::Structural { .. })
    }
}

impl From<bincode::error::EncodeError> for BoxError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BoxError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BoxError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BoxError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BoxError {
    fn from(err: serde_json::Error) -> Self {
        BoxError::Serialization(err.to_string())
    }
}

/// Result type for box tree operations
pub type BoxResult<T> = Result<T, BoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_error_message() {
        let err = BoxError::structural("box_children", 7, "child range out of bounds");
        assert!(err.is_structural());
        assert!(!err.is_fatal_config());
        let msg = err.to_string();
        assert!(msg.contains("box_children"));
        assert!(msg.contains("7"));
    }

    #[test]
    fn test_fatal_config_classification() {
        assert!(BoxError::InvalidConfiguration("threshold".into()).is_fatal_config());
        assert!(BoxError::ConfigurationLocked.is_fatal_config());
        assert!(BoxError::DimensionMismatch {
            expected: 3,
            actual: 2
        }
        .is_fatal_config());
        assert!(BoxError::InvalidInput("no rows".into()).is_fatal_config());
        assert!(!BoxError::Container("bad magic".into()).is_fatal_config());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: BoxError = io_err.into();
        assert!(matches!(err, BoxError::Io(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: BoxError = json_err.into();
        assert!(matches!(err, BoxError::Serialization(_)));
    }
}
