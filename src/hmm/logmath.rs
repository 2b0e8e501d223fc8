//! Integer log-domain arithmetic.
//!
//! All search scores are integers `round(ln(p) / ln(base))`. `WORST_SCORE` is the
//! domain's minus infinity: probabilities of zero map onto it and nothing is ever
//! added to it.

use crate::constants::score::WORST_SCORE;
use crate::error::{DecoderError, Result};

/// Conversion between probabilities and integer log scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogMath {
    base: f64,
    ln_base: f64,
}

impl LogMath {
    /// Create a log domain with the given base (must exceed 1).
    pub fn new(base: f64) -> Result<Self> {
        if !(base > 1.0) || !base.is_finite() {
            return Err(DecoderError::Configuration(format!(
                "log base {} must be a finite value greater than 1",
                base
            )));
        }
        Ok(Self {
            base,
            ln_base: base.ln(),
        })
    }

    /// The logarithm base.
    pub fn base(&self) -> f64 {
        self.base
    }

    /// Log score of a probability. Zero and negative inputs map to `WORST_SCORE`.
    pub fn log(&self, prob: f64) -> i32 {
        if !(prob > 0.0) {
            return WORST_SCORE;
        }
        self.from_ln(prob.ln())
    }

    /// Log score of a natural logarithm.
    pub fn from_ln(&self, ln: f64) -> i32 {
        let scaled = (ln / self.ln_base).round();
        if scaled <= WORST_SCORE as f64 {
            WORST_SCORE
        } else if scaled >= i32::MAX as f64 {
            i32::MAX
        } else {
            scaled as i32
        }
    }

    /// Natural logarithm of a log score.
    pub fn to_ln(&self, score: i32) -> f64 {
        score as f64 * self.ln_base
    }

    /// Log score of a base-10 logarithm, as found in n-gram files.
    pub fn from_log10(&self, log10: f64) -> i32 {
        self.from_ln(log10 * std::f64::consts::LN_10)
    }

    /// Probability of a log score.
    pub fn exp(&self, score: i32) -> f64 {
        if score <= WORST_SCORE {
            return 0.0;
        }
        (score as f64 * self.ln_base).exp()
    }

    /// Log of the sum of two probabilities given as log scores.
    pub fn add(&self, a: i32, b: i32) -> i32 {
        if a <= WORST_SCORE {
            return b;
        }
        if b <= WORST_SCORE {
            return a;
        }
        let (hi, lo) = if a > b { (a, b) } else { (b, a) };
        let diff = (lo - hi) as f64 * self.ln_base;
        let inc = (diff.exp().ln_1p() / self.ln_base).round() as i32;
        hi.saturating_add(inc)
    }

    /// Scale a log score by a floating point weight, keeping `WORST_SCORE` sticky.
    pub fn weight(&self, score: i32, weight: f32) -> i32 {
        if score <= WORST_SCORE {
            return WORST_SCORE;
        }
        let scaled = (score as f64 * weight as f64).round();
        if scaled <= WORST_SCORE as f64 {
            WORST_SCORE
        } else {
            scaled as i32
        }
    }
}

/// Log of a probability product: `a + b`, with `WORST_SCORE` absorbing.
#[inline]
pub fn log_mul(a: i32, b: i32) -> i32 {
    if a <= WORST_SCORE || b <= WORST_SCORE {
        return WORST_SCORE;
    }
    a.saturating_add(b).max(WORST_SCORE)
}

impl Default for LogMath {
    fn default() -> Self {
        let base = crate::constants::score::DEFAULT_LOG_BASE;
        Self {
            base,
            ln_base: base.ln(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_exp() {
        let lm = LogMath::default();
        assert_eq!(lm.log(1.0), 0);
        assert_eq!(lm.log(0.0), WORST_SCORE);
        assert!(lm.log(0.5) < 0);
        let back = lm.exp(lm.log(0.25));
        assert!((back - 0.25).abs() < 1e-3);
    }

    #[test]
    fn test_add() {
        let lm = LogMath::default();
        let half = lm.log(0.5);
        let one = lm.add(half, half);
        assert!(one.abs() <= 1, "log(0.5 + 0.5) = {}", one);
        assert_eq!(lm.add(WORST_SCORE, half), half);
        assert_eq!(lm.add(half, WORST_SCORE), half);
    }

    #[test]
    fn test_invalid_base() {
        assert!(LogMath::new(1.0).is_err());
        assert!(LogMath::new(0.5).is_err());
        assert!(LogMath::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_log_mul() {
        assert_eq!(log_mul(-10, -20), -30);
        assert_eq!(log_mul(WORST_SCORE, 5), WORST_SCORE);
        assert_eq!(log_mul(WORST_SCORE + 1, WORST_SCORE + 1), WORST_SCORE);
    }

    #[test]
    fn test_weight_keeps_worst() {
        let lm = LogMath::default();
        assert_eq!(lm.weight(WORST_SCORE, 9.5), WORST_SCORE);
        assert_eq!(lm.weight(-100, 2.0), -200);
    }
}
