//! Custom error types for the multi-pass decoder.
//!
//! This module provides a centralized error handling system using the `thiserror` crate
//! to define structured, typed errors with clear messages and proper error conversion.
//! The search-level variants distinguish errors that only abort the current utterance
//! from those that leave the decoder unusable.

use std::collections::TryReserveError;
use std::io;
use thiserror::Error;

/// Primary error type for the decoder, covering all possible error cases.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// No HMM survived the beam in a frame.
    #[error("{pass} pass: no active states survived pruning at frame {frame}")]
    PruningExhausted {
        /// Name of the pass that failed.
        pass: &'static str,
        /// Frame being searched.
        frame: usize,
    },

    /// The best path score fell out of the representable log domain.
    #[error("{pass} pass: best score {best} underflowed the log domain at frame {frame}")]
    NumericUnderflow {
        /// Name of the pass that failed.
        pass: &'static str,
        /// Frame being searched.
        frame: usize,
        /// The degenerate best score.
        best: i32,
    },

    /// Growing a table or per-frame array failed.
    #[error("failed to grow {what} to {requested} entries")]
    CapacityGrowthFailure {
        /// Which structure was being grown.
        what: &'static str,
        /// Requested number of entries.
        requested: usize,
    },

    /// Append to a buffer after its writer finalized it.
    #[error("append to finalized buffer '{buffer}'")]
    BufferFinalizedWriteAttempt {
        /// Buffer name.
        buffer: String,
    },

    /// Second finalization of a buffer.
    #[error("buffer '{buffer}' is already finalized")]
    AlreadyFinalized {
        /// Buffer name.
        buffer: String,
    },

    /// Read below the garbage-collected base of a buffer.
    #[error("stale read of index {index} below buffer base {base}")]
    StaleIndexRead {
        /// Requested index.
        index: usize,
        /// Current base index.
        base: usize,
    },

    /// A sync array cannot track more readers.
    #[error("buffer '{buffer}' cannot take more than {max} readers")]
    TooManyReaders {
        /// Buffer name.
        buffer: String,
        /// Maximum reader count.
        max: usize,
    },

    /// Operation not valid in the decoder's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Errors from invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Errors from invalid input data or parameters.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Inconsistent acoustic model, dictionary or language model.
    #[error("Model error: {0}")]
    Model(String),

    /// A search pass thread panicked.
    #[error("{pass} pass panicked: {message}")]
    PassPanicked {
        /// Name of the pass.
        pass: &'static str,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DecoderError {
    /// Whether the error aborts only the current utterance.
    pub fn is_utterance_fatal(&self) -> bool {
        matches!(
            self,
            DecoderError::PruningExhausted { .. } | DecoderError::NumericUnderflow { .. }
        )
    }

    /// Whether the error leaves the decoder unusable.
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, DecoderError::CapacityGrowthFailure { .. })
    }

    /// Build a growth failure from a failed reservation.
    pub fn growth(what: &'static str, requested: usize, _source: TryReserveError) -> Self {
        DecoderError::CapacityGrowthFailure { what, requested }
    }
}

/// Convenience type alias for Results with DecoderError.
pub type Result<T> = std::result::Result<T, DecoderError>;

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to the error.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DecoderError::Model(format!("{}: {}", f(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = DecoderError::PruningExhausted {
            pass: "fwdtree",
            frame: 12,
        };
        assert!(err.is_utterance_fatal());
        assert!(!err.is_process_fatal());
        assert_eq!(
            err.to_string(),
            "fwdtree pass: no active states survived pruning at frame 12"
        );

        let err = DecoderError::CapacityGrowthFailure {
            what: "backpointer table",
            requested: 1 << 40,
        };
        assert!(err.is_process_fatal());
        assert!(!err.is_utterance_fatal());

        let err = DecoderError::StaleIndexRead { index: 3, base: 10 };
        assert!(!err.is_utterance_fatal());
        assert!(!err.is_process_fatal());
    }

    #[test]
    fn test_error_context() {
        let parsed: std::result::Result<i32, std::num::ParseIntError> = "x".parse::<i32>();
        let err = parsed.with_context(|| "parsing frame count".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Model error: parsing frame count: invalid digit found in string");
    }
}
