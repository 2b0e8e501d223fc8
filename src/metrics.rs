//! Search metrics.
//!
//! Recording goes through the `metrics` facade; without an installed recorder
//! every call is a no-op, so the search code records unconditionally.

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use tracing::debug;

/// Register all metrics with their descriptions.
pub fn register_metrics() {
    describe_counter!(
        "decoder_utterances_total",
        "Total number of utterances started"
    );
    describe_counter!(
        "decoder_utterances_failed_total",
        "Total number of utterances aborted by a search error"
    );
    describe_counter!(
        "decoder_frames_total",
        "Total number of frames searched, per pass"
    );
    describe_gauge!(
        "decoder_active_hmms",
        "Number of HMMs that survived pruning in the last frame, per pass"
    );
    describe_counter!(
        "decoder_backpointers_total",
        "Total number of backpointer entries created, per pass"
    );
    describe_counter!(
        "decoder_arcs_total",
        "Total number of word arcs emitted, per pass"
    );
    describe_counter!(
        "decoder_renormalizations_total",
        "Total number of score renormalizations, per pass"
    );
    describe_histogram!(
        "decoder_pass_duration_seconds",
        "Wall time of a search pass over one utterance"
    );
}

/// Timer for measuring pass durations.
pub struct PassTimer {
    pass: &'static str,
    start: Instant,
}

impl PassTimer {
    /// Start timing a pass.
    pub fn new(pass: &'static str) -> Self {
        Self {
            pass,
            start: Instant::now(),
        }
    }
}

impl Drop for PassTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        histogram!("decoder_pass_duration_seconds", "pass" => self.pass).record(duration.as_secs_f64());
        debug!(pass = self.pass, "Pass finished in {:.3}ms", duration.as_secs_f64() * 1000.0);
    }
}

/// Record the start of an utterance.
pub fn record_utterance_start() {
    counter!("decoder_utterances_total").increment(1);
}

/// Record an aborted utterance.
pub fn record_utterance_failure(error_type: &'static str) {
    counter!("decoder_utterances_failed_total", "error" => error_type).increment(1);
}

/// Record one searched frame.
pub fn record_frame(pass: &'static str, active: usize) {
    counter!("decoder_frames_total", "pass" => pass).increment(1);
    gauge!("decoder_active_hmms", "pass" => pass).set(active as f64);
}

/// Record new backpointer entries.
pub fn record_backpointers(pass: &'static str, count: usize) {
    counter!("decoder_backpointers_total", "pass" => pass).increment(count as u64);
}

/// Record emitted arcs.
pub fn record_arcs(pass: &'static str, count: usize) {
    counter!("decoder_arcs_total", "pass" => pass).increment(count as u64);
}

/// Record a score renormalization.
pub fn record_renormalization(pass: &'static str) {
    counter!("decoder_renormalizations_total", "pass" => pass).increment(1);
}
