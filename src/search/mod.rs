//! Search passes and the structures they share.
//!
//! Every pass follows the same frame loop: apply pending entries, score the
//! senones of active HMMs, evaluate, prune against the frame's best score, and
//! turn HMM exits into phone transitions or backpointer entries. Word exits
//! that can no longer change are swept into the pass's output arc buffer.

pub mod active;
pub mod bptbl;
pub mod fwdflat;
pub mod fwdtree;
pub mod latgen;
pub mod lattice;
pub mod lextree;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::score::WORST_SCORE;
use crate::error::{DecoderError, Result};
use crate::hmm::logmath::{log_mul, LogMath};
use crate::metrics;
use crate::model::lexicon::Lexicon;
use crate::model::lm::LanguageModel;
use crate::sync::arc_buffer::{ArcBuffer, WordArc};
use crate::types::{Beam, BpIdx, PhoneId, WordId};

pub use bptbl::{BackpointerTable, BpEntry};
pub use lattice::{Lattice, LatticeExport};

/// One search pass running on its own thread.
pub trait SearchPass: Send {
    /// Pass name used in logs, metrics and errors.
    fn name(&self) -> &'static str;

    /// Run the pass to the end of its input.
    fn run(&mut self) -> Result<PassOutcome>;
}

/// What a pass leaves behind once its input ends.
#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    /// Best hypothesis, if any word exit was reached.
    pub hypothesis: Option<Hypothesis>,
    /// Frames searched.
    pub frames: usize,
    /// Word lattice, for the lattice pass.
    pub lattice: Option<LatticeExport>,
}

/// Decoded word sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Words joined by spaces.
    pub text: String,
    /// Words without fillers or sentence markers.
    pub words: Vec<String>,
    /// Total path score in the log domain.
    pub score: i64,
    /// Every word on the path, fillers included.
    pub segments: Vec<Segment>,
}

/// One word of a hypothesis with its time span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Word spelling.
    pub word: String,
    /// Word id.
    pub word_id: WordId,
    /// First frame.
    pub start_frame: usize,
    /// Last frame (inclusive).
    pub end_frame: usize,
    /// Acoustic score.
    pub ascr: i32,
    /// Weighted language score, penalties included.
    pub lscr: i32,
}

/// Pruning beams in the log domain.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Beams {
    pub beam: i32,
    pub pbeam: i32,
    pub wbeam: i32,
}

impl Beams {
    pub(crate) fn new(logmath: &LogMath, beam: Beam, pbeam: Beam, wbeam: Beam) -> Self {
        Self {
            beam: logmath.log(beam.value()),
            pbeam: logmath.log(pbeam.value()),
            wbeam: logmath.log(wbeam.value()),
        }
    }
}

/// Pruning threshold `best * beam`, clamped to the log domain.
pub(crate) fn threshold(best: i32, beam: i32) -> i32 {
    if best <= WORST_SCORE {
        return WORST_SCORE;
    }
    best.saturating_add(beam).max(WORST_SCORE)
}

/// Language weight plus word insertion and filler penalties.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Penalties {
    pub lw: f32,
    pub wip: i32,
    pub silpen: i32,
    pub fillpen: i32,
}

impl Penalties {
    pub(crate) fn new(logmath: &LogMath, lw: f32, wip: f64, silprob: f64, fillprob: f64) -> Self {
        Self {
            lw,
            wip: logmath.weight(logmath.log(wip), lw),
            silpen: logmath.weight(logmath.log(silprob), lw),
            fillpen: logmath.weight(logmath.log(fillprob), lw),
        }
    }

    /// Penalty for entering a filler word.
    pub(crate) fn filler(&self, lexicon: &Lexicon, word: WordId) -> i32 {
        if word == lexicon.dictionary().silence_word() {
            self.silpen
        } else {
            self.fillpen
        }
    }
}

/// Language scoring of word entries, shared by a pass and its arc producer.
#[derive(Clone)]
pub(crate) struct WordScorer {
    lexicon: Arc<Lexicon>,
    lm: Arc<dyn LanguageModel>,
    logmath: LogMath,
    penalties: Penalties,
    trigram: bool,
}

impl WordScorer {
    pub(crate) fn new(
        lexicon: Arc<Lexicon>,
        lm: Arc<dyn LanguageModel>,
        penalties: Penalties,
        trigram: bool,
    ) -> Self {
        let logmath = *lexicon.acoustic_model().logmath();
        Self {
            lexicon,
            lm,
            logmath,
            penalties,
            trigram,
        }
    }

    pub(crate) fn penalties(&self) -> &Penalties {
        &self.penalties
    }

    /// Weighted language score of `word` after `prev` (and `prev2`), without
    /// the insertion penalty.
    pub(crate) fn lm_only(&self, word: WordId, prev: WordId, prev2: Option<WordId>) -> i32 {
        let score = if self.trigram {
            self.lm.trigram_score(word, prev, prev2).score
        } else {
            self.lm.bigram_score(word, prev).score
        };
        self.logmath.weight(score, self.penalties.lw)
    }

    /// Full cost of entering `word`: filler penalty, or language score plus
    /// insertion penalty.
    pub(crate) fn entry(&self, word: WordId, prev: WordId, prev2: Option<WordId>) -> i32 {
        if self.lexicon.is_filler(word) {
            return self.penalties.filler(&self.lexicon, word);
        }
        log_mul(self.lm_only(word, prev, prev2), self.penalties.wip)
    }

    /// Language part of a backpointer entry's path score.
    pub(crate) fn language_score(&self, bptbl: &BackpointerTable, e: &BpEntry) -> i32 {
        let dict = self.lexicon.dictionary();
        let Some(prev) = e.prev.and_then(|p| bptbl.get(p)) else {
            return if e.word == dict.start_word() {
                0
            } else {
                self.entry(e.word, dict.start_word(), None)
            };
        };
        self.entry(e.word, prev.real_word, prev.prev_real_word)
    }
}

/// A required phone over an inclusive frame window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneWindow {
    /// First frame.
    pub start: usize,
    /// Last frame (inclusive).
    pub end: usize,
    /// Phone that must be active.
    pub phone: PhoneId,
}

/// External phone segmentation restricting the first pass.
///
/// The constraint is soft: it never empties the active set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhoneConstraint {
    windows: Vec<PhoneWindow>,
}

impl PhoneConstraint {
    /// No restrictions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `phone` in frames `start..=end`.
    pub fn require(mut self, start: usize, end: usize, phone: PhoneId) -> Self {
        self.windows.push(PhoneWindow { start, end, phone });
        self.windows.sort_by_key(|w| w.start);
        self
    }

    /// Phone required in `frame`, if any.
    pub fn required(&self, frame: usize) -> Option<PhoneId> {
        self.windows
            .iter()
            .find(|w| w.start <= frame && frame <= w.end)
            .map(|w| w.phone)
    }

    /// Whether no window is set.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Reserve room for `additional` elements, doubling the capacity.
pub(crate) fn grow_for<T>(v: &mut Vec<T>, additional: usize, what: &'static str) -> Result<()> {
    let needed = v.len() + additional;
    if needed <= v.capacity() {
        return Ok(());
    }
    let target = needed.max(v.capacity() * 2);
    v.try_reserve_exact(target - v.len())
        .map_err(|e| DecoderError::growth(what, target, e))
}

/// Oldest start frame a future word exit can have.
pub(crate) fn history_start(bptbl: &BackpointerTable, history: Option<BpIdx>) -> usize {
    history
        .and_then(|h| bptbl.get(h))
        .map_or(0, |e| e.frame + 1)
}

/// Streams final backpointer entries of a pass into its output buffer.
///
/// Entries become final once their frame is complete. They are emitted in
/// start-frame order once no active path can still produce an exit starting
/// earlier, and each start frame is committed behind them.
pub(crate) struct ArcProducer {
    pass: &'static str,
    output: Arc<ArcBuffer>,
    scanned: usize,
    pending: Vec<BpIdx>,
    committed: usize,
    emitted: usize,
}

impl ArcProducer {
    pub(crate) fn new(pass: &'static str, output: Arc<ArcBuffer>) -> Self {
        Self {
            pass,
            output,
            scanned: 0,
            pending: Vec::new(),
            committed: 0,
            emitted: 0,
        }
    }

    pub(crate) fn output(&self) -> &Arc<ArcBuffer> {
        &self.output
    }

    pub(crate) fn emitted(&self) -> usize {
        self.emitted
    }

    /// Sweep entries of frames before `complete` that start before `frontier`.
    pub(crate) fn sweep<F>(
        &mut self,
        bptbl: &BackpointerTable,
        complete: usize,
        frontier: usize,
        lscr: F,
    ) -> Result<()>
    where
        F: Fn(&BackpointerTable, &BpEntry) -> i32,
    {
        let entries = bptbl.entries();
        while self.scanned < entries.len() && entries[self.scanned].frame < complete {
            grow_for(&mut self.pending, 1, "arc staging")?;
            self.pending.push(BpIdx(self.scanned as u32));
            self.scanned += 1;
        }

        let frontier = frontier.max(self.committed);
        self.pending
            .sort_by_key(|&i| (entries[i.index()].start_frame, i));
        let split = self
            .pending
            .partition_point(|&i| entries[i.index()].start_frame < frontier);
        let before = self.emitted;
        for idx in self.pending.drain(..split) {
            let e = &entries[idx.index()];
            if e.start_frame < self.committed {
                warn!(pass = self.pass, word = %e.word, start = e.start_frame, committed = self.committed, "Dropping arc behind committed frame");
                continue;
            }
            while self.committed < e.start_frame {
                self.output.commit_frame()?;
                self.committed += 1;
            }
            let prev = e.prev.map_or(0, |p| bptbl.absolute_score(p));
            let ascr = bptbl.absolute_score(idx) - prev - lscr(bptbl, e) as i64;
            self.output.push(WordArc {
                src_frame: e.start_frame,
                dest_frame: e.frame,
                word: e.word,
                score: ascr.clamp(WORST_SCORE as i64, i32::MAX as i64) as i32,
            })?;
            self.emitted += 1;
        }
        while self.committed < frontier {
            self.output.commit_frame()?;
            self.committed += 1;
        }
        if self.emitted > before {
            metrics::record_arcs(self.pass, self.emitted - before);
        }
        Ok(())
    }

    /// Emit everything left, commit all `n_frames` start frames and finalize.
    pub(crate) fn finish<F>(&mut self, bptbl: &BackpointerTable, n_frames: usize, lscr: F) -> Result<()>
    where
        F: Fn(&BackpointerTable, &BpEntry) -> i32,
    {
        self.sweep(bptbl, usize::MAX, n_frames, lscr)?;
        self.output.finalize()
    }
}

/// Finalizes a pass's output if the pass leaves without doing so, so that
/// downstream passes see the end of the stream instead of waiting forever.
pub(crate) struct OutputGuard(pub Arc<ArcBuffer>);

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if !self.0.is_finalized() {
            let _ = self.0.finalize();
        }
    }
}

/// Build a hypothesis from the backpointer path ending at `idx`.
pub(crate) fn hypothesis_from_bp<F>(
    lexicon: &Lexicon,
    bptbl: &BackpointerTable,
    idx: BpIdx,
    lscr: F,
) -> Hypothesis
where
    F: Fn(&BackpointerTable, &BpEntry) -> i32,
{
    let dict = lexicon.dictionary();
    let spell = |w: WordId| dict.word_str(w).unwrap_or("<unk>").to_string();
    let words: Vec<String> = bptbl
        .reconstruct_hypothesis(idx)
        .into_iter()
        .map(spell)
        .collect();
    let segments = bptbl
        .backtrace(idx)
        .into_iter()
        .filter_map(|i| {
            let e = bptbl.get(i)?;
            let prev = e.prev.map_or(0, |p| bptbl.absolute_score(p));
            let lscr = lscr(bptbl, e);
            let ascr = bptbl.absolute_score(i) - prev - lscr as i64;
            Some(Segment {
                word: spell(e.word),
                word_id: e.word,
                start_frame: e.start_frame,
                end_frame: e.frame,
                ascr: ascr.clamp(WORST_SCORE as i64, i32::MAX as i64) as i32,
                lscr,
            })
        })
        .collect();
    Hypothesis {
        text: words.join(" "),
        words,
        score: bptbl.absolute_score(idx),
        segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lexicon::tests::toy_lexicon;

    #[test]
    fn test_threshold_clamps() {
        assert_eq!(threshold(-100, -50), -150);
        assert_eq!(threshold(WORST_SCORE + 10, -1000), WORST_SCORE);
        assert_eq!(threshold(WORST_SCORE, -1), WORST_SCORE);
        assert_eq!(threshold(0, 0), 0);
    }

    #[test]
    fn test_phone_constraint_windows() {
        let c = PhoneConstraint::new()
            .require(10, 14, PhoneId(3))
            .require(0, 4, PhoneId(1));
        assert_eq!(c.required(0), Some(PhoneId(1)));
        assert_eq!(c.required(4), Some(PhoneId(1)));
        assert_eq!(c.required(7), None);
        assert_eq!(c.required(14), Some(PhoneId(3)));
        assert!(!c.is_empty());
    }

    #[test]
    fn test_grow_for_doubles() {
        let mut v: Vec<u32> = Vec::with_capacity(4);
        v.extend([1, 2, 3, 4]);
        grow_for(&mut v, 1, "test").unwrap();
        assert!(v.capacity() >= 8);
        assert_eq!(v, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_producer_orders_and_commits() {
        let lex = Arc::new(toy_lexicon());
        let dict = lex.dictionary().clone();
        let cat = dict.word_id("cat").unwrap();
        let a = dict.word_id("a").unwrap();
        let mut bp = BackpointerTable::new(Arc::clone(&lex), 8).unwrap();

        bp.begin_frame(0).unwrap();
        let s = bp.save_entry(dict.start_word(), -10, None, 0).unwrap();
        bp.begin_frame(1).unwrap();
        bp.begin_frame(2).unwrap();
        bp.save_entry(a, -40, Some(s), 0).unwrap();
        bp.begin_frame(3).unwrap();
        bp.save_entry(cat, -60, Some(s), 0).unwrap();

        let buffer = ArcBuffer::new("producer", None, true);
        let mut reader = buffer.reader().unwrap();
        let mut producer = ArcProducer::new("test", Arc::clone(&buffer));

        // Paths starting at frame 1 are still alive: only frame 0 is final.
        producer.sweep(&bp, 4, 1, |_, _| 0).unwrap();
        assert_eq!(buffer.committed_frames(), 1);
        assert_eq!(producer.emitted(), 1);

        producer.finish(&bp, 4, |_, _| 0).unwrap();
        let f0 = reader.frame_arcs(0).unwrap().unwrap();
        assert_eq!(f0.len(), 1);
        assert_eq!(f0[0].score, -10);
        let f1 = reader.frame_arcs(1).unwrap().unwrap();
        // Sorted by entry index within a start frame.
        assert_eq!(f1.iter().map(|a| a.word).collect::<Vec<_>>(), vec![a, cat]);
        assert_eq!(f1[0].score, -30);
        assert_eq!(f1[1].dest_frame, 3);
        assert_eq!(reader.frame_arcs(4).unwrap(), None);
    }

    #[test]
    fn test_hypothesis_segments() {
        let lex = Arc::new(toy_lexicon());
        let dict = lex.dictionary().clone();
        let cat = dict.word_id("cat").unwrap();
        let mut bp = BackpointerTable::new(Arc::clone(&lex), 8).unwrap();
        bp.begin_frame(0).unwrap();
        let s = bp.save_entry(dict.start_word(), -5, None, 0).unwrap();
        bp.begin_frame(1).unwrap();
        let c = bp.save_entry(cat, -25, Some(s), 0).unwrap();
        bp.begin_frame(2).unwrap();
        let f = bp.save_entry(dict.finish_word(), -30, Some(c), 0).unwrap();

        let hyp = hypothesis_from_bp(&lex, &bp, f, |_, e| if e.word == cat { -4 } else { 0 });
        assert_eq!(hyp.text, "cat");
        assert_eq!(hyp.score, -30);
        assert_eq!(hyp.segments.len(), 3);
        assert_eq!(hyp.segments[1].ascr, -16);
        assert_eq!(hyp.segments[1].lscr, -4);
        assert_eq!(hyp.segments[1].start_frame, 1);
        assert_eq!(hyp.segments[2].word, "</s>");
    }
}
