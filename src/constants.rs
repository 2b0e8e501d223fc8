//! Domain constants for the decoder.
//!
//! This module contains compile-time constants used throughout the search.
//! These are separated from runtime configuration to provide clear distinction
//! between values that never change and those that can be configured.

/// Log-domain score constants.
pub mod score {
    /// Log-domain "minus infinity". Never added to a live score.
    pub const WORST_SCORE: i32 = -0x2000_0000;

    /// Best scores below this are renormalized before the next frame.
    pub const RENORM_THRESHOLD: i32 = WORST_SCORE / 2;

    /// Default logarithm base of the integer score domain.
    pub const DEFAULT_LOG_BASE: f64 = 1.0001;
}

/// HMM topology constants.
pub mod hmm {
    /// Upper bound on emitting states per HMM.
    pub const MAX_EMIT_STATES: usize = 16;

    /// Emitting state count of the classic three-state Bakis topology.
    pub const BAKIS_3: usize = 3;

    /// Emitting state count of the five-state Bakis topology.
    pub const BAKIS_5: usize = 5;
}

/// Initial sizes for growable search tables.
pub mod tables {
    /// Initial backpointer table entries.
    pub const BP_TABLE_INITIAL: usize = 1024;

    /// Initial score stack entries.
    pub const SCORE_STACK_INITIAL: usize = 4096;

    /// Initial per-frame active array slots.
    pub const ACTIVE_INITIAL: usize = 256;

    /// Initial sync array capacity.
    pub const SYNC_ARRAY_INITIAL: usize = 128;
}

/// Cross-thread streaming constants.
pub mod streaming {
    use std::time::Duration;

    /// Bounded wait used by readers polling a sync array.
    pub const WAIT_SLICE: Duration = Duration::from_millis(50);

    /// Largest number of readers a sync array can track.
    pub const MAX_READERS: usize = 254;
}

/// Dictionary conventions.
pub mod words {
    /// Utterance start marker.
    pub const START_WORD: &str = "<s>";

    /// Utterance end marker.
    pub const FINISH_WORD: &str = "</s>";

    /// Silence word.
    pub const SILENCE_WORD: &str = "<sil>";

    /// Silence phone name.
    pub const SILENCE_PHONE: &str = "SIL";
}

/// Lattice file conventions.
pub mod lattice {
    /// Frames per second assumed when none is configured.
    pub const DEFAULT_FRAME_RATE: u32 = 100;

    /// HTK spelling of the utterance start marker.
    pub const HTK_SENT_START: &str = "!SENT_START";

    /// HTK spelling of the utterance end marker.
    pub const HTK_SENT_END: &str = "!SENT_END";
}
