//! Error types for segmentation operations.

use thiserror::Error;

use crate::axis::Axis;

/// Errors raised by the segmentation engine.
#[derive(Debug, Error)]
pub enum SegmentationError {
    /// Discovery was requested on a population below the hard minimum.
    #[error("Insufficient population for {axis}: required {required}, actual {actual}")]
    InsufficientPopulation {
        /// Axis being discovered
        axis: Axis,
        /// Minimum population size
        required: usize,
        /// Population size provided
        actual: usize,
    },

    /// A feature vector was combined with scaler parameters of a different feature set.
    #[error("Scaler mismatch on {axis}: expected features {expected:?}, actual {actual:?}")]
    StaleScalerMismatch {
        /// Axis whose definition was used
        axis: Axis,
        /// Feature names the definition was fitted on
        expected: Vec<String>,
        /// Feature names that were supplied
        actual: Vec<String>,
    },

    /// A customer's history is internally inconsistent.
    #[error("Corrupt history for customer {customer_id}: {reason}")]
    CorruptHistory {
        /// Customer whose history was rejected
        customer_id: String,
        /// What was wrong
        reason: String,
    },

    /// The history source could not provide a customer's records.
    #[error("History unavailable for customer {customer_id}: {reason}")]
    HistoryUnavailable {
        /// Customer that was requested
        customer_id: String,
        /// Underlying failure
        reason: String,
    },

    /// A different snapshot already exists under the same key.
    #[error("Conflicting snapshot already recorded for {key}")]
    SnapshotConflict {
        /// Display form of the snapshot key
        key: String,
    },

    /// Invalid parameter provided.
    #[error("Invalid parameter: {message}")]
    InvalidParameter {
        /// Description of what's wrong with the parameter
        message: String,
    },

    /// The underlying k-means fit failed.
    #[error("Clustering failed: {0}")]
    Clustering(String),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The job was cancelled before this unit of work started.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] polars::prelude::PolarsError),
}

impl SegmentationError {
    /// Create an InsufficientPopulation error.
    pub fn insufficient_population(axis: Axis, required: usize, actual: usize) -> Self {
        Self::InsufficientPopulation {
            axis,
            required,
            actual,
        }
    }

    /// Create a CorruptHistory error.
    pub fn corrupt_history(customer_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptHistory {
            customer_id: customer_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidParameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Whether this error signals a programming error rather than bad data.
    ///
    /// Batch jobs abort on these instead of recording them per customer.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::StaleScalerMismatch { .. })
    }
}

/// Result alias for library operations.
pub type SegResult<T> = std::result::Result<T, SegmentationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let errors: Vec<SegmentationError> = vec![
            SegmentationError::insufficient_population(Axis::PurchaseFrequency, 100, 12),
            SegmentationError::corrupt_history("c-1", "item references unknown order o-9"),
            SegmentationError::invalid_parameter("k_min must be >= 1"),
            SegmentationError::SnapshotConflict {
                key: "c-1/2024-01-01/daily".to_string(),
            },
            SegmentationError::Cancelled,
        ];

        let expected_substrings = [
            "required 100, actual 12",
            "unknown order o-9",
            "k_min",
            "c-1/2024-01-01/daily",
            "cancelled",
        ];

        for (err, expected) in errors.iter().zip(expected_substrings.iter()) {
            let display = err.to_string();
            assert!(
                display.contains(expected),
                "Display for {:?} should contain '{}', got: {}",
                err,
                expected,
                display
            );
        }
    }

    #[test]
    fn test_only_scaler_mismatch_is_invariant_violation() {
        let mismatch = SegmentationError::StaleScalerMismatch {
            axis: Axis::SpendingLevel,
            expected: vec!["a".into()],
            actual: vec!["b".into()],
        };
        assert!(mismatch.is_invariant_violation());
        assert!(!SegmentationError::corrupt_history("c", "x").is_invariant_violation());
    }
}
