//! The `amira_multipass_decoder` core library.
//!
//! A real-time HMM speech decoder running three search passes over each
//! utterance: a lexical-tree pass with bigram scores, a flat-lexicon pass with
//! the full language model restricted to the tree pass's words, and a bestpath
//! search over the resulting word lattice. Passes run on their own threads and
//! stream word arcs to each other as soon as they are final.

pub mod config;
pub mod constants;
pub mod decoder;
pub mod error;
pub mod hmm;
pub mod metrics;
pub mod model;
pub mod search;
pub mod sync;
pub mod task;
pub mod telemetry;
pub mod types;

pub use config::DecoderConfig;
pub use decoder::{Decoder, UtteranceResult};
pub use error::{DecoderError, Result};
pub use search::{Hypothesis, LatticeExport, PhoneConstraint, Segment};
pub use task::Task;
