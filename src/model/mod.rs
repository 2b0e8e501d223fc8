//! External collaborators of the search and their in-memory implementations.

pub mod acoustic;
pub mod dictionary;
pub mod lexicon;
pub mod lm;

pub use acoustic::{AcousticModel, AcousticModelBuilder, AcousticScorer, PrecomputedScorer};
pub use dictionary::{Dictionary, PronouncingDictionary};
pub use lexicon::{Lexicon, RcFanout};
pub use lm::{BackoffNgramModel, LanguageModel, NgramScore};
