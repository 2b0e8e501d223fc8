//! Strong typing with newtypes for domain concepts.
//!
//! This module provides type-safe wrappers around the integer identifiers that flow
//! through the search, so that a word id can never be confused with a phone or a
//! backpointer index.

use serde::{Deserialize, Serialize};

use crate::error::DecoderError;

/// Dictionary word identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WordId(pub u32);

impl WordId {
    /// Create a new word id.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the id as an index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for WordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "word_{}", self.0)
    }
}

/// Context-independent phone identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhoneId(pub u16);

impl PhoneId {
    /// Get the id as an index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PhoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "phone_{}", self.0)
    }
}

/// Tied output distribution identifier.
pub type SenoneId = u32;

/// Senone sequence identifier: one senone per emitting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SenoneSeqId(pub u32);

impl SenoneSeqId {
    /// Get the id as an index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Transition matrix identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TmatId(pub u16);

impl TmatId {
    /// Get the id as an index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into a backpointer table. Stays valid across table growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BpIdx(pub u32);

impl BpIdx {
    /// Get the index as usize.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BpIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bp_{}", self.0)
    }
}

/// A pruning beam expressed as a probability in (0, 1].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Beam(pub f64);

impl Beam {
    /// Keep everything that is not impossible.
    pub const WIDEST: Self = Self(f64::MIN_POSITIVE);

    /// Create a new beam with validation.
    pub fn new(prob: f64) -> Result<Self, DecoderError> {
        if !(prob > 0.0 && prob <= 1.0) {
            return Err(DecoderError::Configuration(format!(
                "beam {} must be in (0, 1]",
                prob
            )));
        }
        Ok(Self(prob))
    }

    /// Get the probability.
    pub fn value(self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for Beam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:e}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beam_validation() {
        assert!(Beam::new(1e-48).is_ok());
        assert!(Beam::new(1.0).is_ok());
        assert!(Beam::new(0.0).is_err());
        assert!(Beam::new(1.5).is_err());
        assert!(Beam::new(f64::NAN).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(WordId(7).to_string(), "word_7");
        assert_eq!(BpIdx(3).to_string(), "bp_3");
        assert_eq!(PhoneId(2).to_string(), "phone_2");
    }
}
