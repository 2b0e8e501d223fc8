//! Hidden Markov model primitives shared by the search passes.
//!
//! - [`logmath`]: integer log-domain arithmetic
//! - [`context`]: transition matrices, senone sequences and the per-pass score vector
//! - [`evaluator`]: single-frame Viterbi evaluation
//! - [`arena`]: generation-checked storage for dynamically allocated HMM chains

pub mod arena;
pub mod context;
pub mod evaluator;
pub mod logmath;

pub use arena::{Arena, Handle};
pub use context::{HmmContext, SenoneSet, TransitionMatrix};
pub use evaluator::{Hmm, HmmIdentity};
pub use logmath::{log_mul, LogMath};
