//! Language model seam and an in-memory back-off n-gram model.
//!
//! Scores are unweighted log-domain values; the search applies its own
//! language weight.

use std::collections::HashMap;

use crate::constants::score::WORST_SCORE;
use crate::hmm::logmath::{log_mul, LogMath};
use crate::types::WordId;

/// An n-gram probability and the length of the n-gram that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NgramScore {
    /// Log-domain probability.
    pub score: i32,
    /// Order of the n-gram actually used (1 after backing off to unigrams).
    pub n_used: u8,
}

/// Word sequence probabilities.
pub trait LanguageModel: Send + Sync {
    /// Highest n-gram order.
    fn order(&self) -> usize;

    /// Whether the word is in the model's vocabulary.
    fn contains(&self, word: WordId) -> bool;

    /// P(word).
    fn unigram_score(&self, word: WordId) -> i32;

    /// P(word | prev).
    fn bigram_score(&self, word: WordId, prev: WordId) -> NgramScore;

    /// P(word | prev2 prev). Without `prev2` this is the bigram score.
    fn trigram_score(&self, word: WordId, prev: WordId, prev2: Option<WordId>) -> NgramScore;
}

#[derive(Debug, Clone, Copy)]
struct Gram {
    prob: i32,
    backoff: i32,
}

/// Back-off n-gram model up to trigrams, stored in hash maps.
#[derive(Debug, Clone)]
pub struct BackoffNgramModel {
    logmath: LogMath,
    unigrams: HashMap<WordId, Gram>,
    bigrams: HashMap<(WordId, WordId), Gram>,
    trigrams: HashMap<(WordId, WordId, WordId), i32>,
}

impl BackoffNgramModel {
    /// Create an empty model in the given log domain.
    pub fn new(logmath: LogMath) -> Self {
        Self {
            logmath,
            unigrams: HashMap::new(),
            bigrams: HashMap::new(),
            trigrams: HashMap::new(),
        }
    }

    /// Add a unigram with base-10 log probability and back-off weight.
    pub fn add_unigram(&mut self, word: WordId, log10_prob: f64, log10_backoff: f64) {
        self.unigrams.insert(
            word,
            Gram {
                prob: self.logmath.from_log10(log10_prob),
                backoff: self.logmath.from_log10(log10_backoff),
            },
        );
    }

    /// Add a bigram `w1 w2`.
    pub fn add_bigram(&mut self, w1: WordId, w2: WordId, log10_prob: f64, log10_backoff: f64) {
        self.bigrams.insert(
            (w1, w2),
            Gram {
                prob: self.logmath.from_log10(log10_prob),
                backoff: self.logmath.from_log10(log10_backoff),
            },
        );
    }

    /// Add a trigram `w1 w2 w3`.
    pub fn add_trigram(&mut self, w1: WordId, w2: WordId, w3: WordId, log10_prob: f64) {
        self.trigrams
            .insert((w1, w2, w3), self.logmath.from_log10(log10_prob));
    }
}

impl LanguageModel for BackoffNgramModel {
    fn order(&self) -> usize {
        if !self.trigrams.is_empty() {
            3
        } else if !self.bigrams.is_empty() {
            2
        } else {
            1
        }
    }

    fn contains(&self, word: WordId) -> bool {
        self.unigrams.contains_key(&word)
    }

    fn unigram_score(&self, word: WordId) -> i32 {
        self.unigrams.get(&word).map_or(WORST_SCORE, |g| g.prob)
    }

    fn bigram_score(&self, word: WordId, prev: WordId) -> NgramScore {
        if let Some(g) = self.bigrams.get(&(prev, word)) {
            return NgramScore {
                score: g.prob,
                n_used: 2,
            };
        }
        let backoff = self.unigrams.get(&prev).map_or(0, |g| g.backoff);
        NgramScore {
            score: log_mul(backoff, self.unigram_score(word)),
            n_used: 1,
        }
    }

    fn trigram_score(&self, word: WordId, prev: WordId, prev2: Option<WordId>) -> NgramScore {
        let Some(prev2) = prev2 else {
            return self.bigram_score(word, prev);
        };
        if let Some(&prob) = self.trigrams.get(&(prev2, prev, word)) {
            return NgramScore {
                score: prob,
                n_used: 3,
            };
        }
        let backoff = self.bigrams.get(&(prev2, prev)).map_or(0, |g| g.backoff);
        let lower = self.bigram_score(word, prev);
        NgramScore {
            score: log_mul(backoff, lower.score),
            n_used: lower.n_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> BackoffNgramModel {
        let mut lm = BackoffNgramModel::new(LogMath::default());
        lm.add_unigram(WordId(0), -1.0, -0.5);
        lm.add_unigram(WordId(1), -0.5, -0.3);
        lm.add_unigram(WordId(2), -0.7, 0.0);
        lm.add_bigram(WordId(0), WordId(1), -0.1, -0.2);
        lm.add_trigram(WordId(0), WordId(1), WordId(2), -0.05);
        lm
    }

    #[test]
    fn test_ngram_hit_orders() {
        let lm = model();
        let lmath = LogMath::default();
        assert_eq!(lm.order(), 3);
        assert_eq!(
            lm.bigram_score(WordId(1), WordId(0)),
            NgramScore {
                score: lmath.from_log10(-0.1),
                n_used: 2
            }
        );
        let tg = lm.trigram_score(WordId(2), WordId(1), Some(WordId(0)));
        assert_eq!(tg.n_used, 3);
        assert_eq!(tg.score, lmath.from_log10(-0.05));
    }

    #[test]
    fn test_backoff() {
        let lm = model();
        let lmath = LogMath::default();
        // P(2 | 1) backs off to bo(1) * P(2).
        let bg = lm.bigram_score(WordId(2), WordId(1));
        assert_eq!(bg.n_used, 1);
        assert_eq!(bg.score, lmath.from_log10(-0.3) + lmath.from_log10(-0.7));
        // P(0 | 0 1) backs off through bo(0 1).
        let tg = lm.trigram_score(WordId(0), WordId(1), Some(WordId(0)));
        assert_eq!(tg.n_used, 1);
        assert_eq!(
            tg.score,
            lmath.from_log10(-0.2) + lmath.from_log10(-0.3) + lmath.from_log10(-1.0)
        );
    }

    #[test]
    fn test_unknown_word() {
        let lm = model();
        assert!(!lm.contains(WordId(9)));
        assert_eq!(lm.unigram_score(WordId(9)), WORST_SCORE);
        assert_eq!(lm.bigram_score(WordId(9), WordId(0)).score, WORST_SCORE);
    }
}
