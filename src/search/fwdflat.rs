//! Second pass: flat-lexicon search restricted by the first pass.
//!
//! Every candidate word gets its own HMM chain, so each word entry sees its
//! true predecessor and the full language model. A word is a candidate at
//! frame `t` when the first pass produced an arc for it starting within
//! `max_sf_win` frames of `t`; fillers are always candidates. Chains live in an
//! arena and are released once their word leaves the window and goes idle.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::DecoderConfig;
use crate::constants::score::{RENORM_THRESHOLD, WORST_SCORE};
use crate::error::{DecoderError, Result};
use crate::hmm::arena::{Arena, Handle};
use crate::hmm::context::{HmmContext, SenoneSet};
use crate::hmm::evaluator::Hmm;
use crate::hmm::logmath::log_mul;
use crate::metrics::{self, PassTimer};
use crate::model::acoustic::AcousticScorer;
use crate::model::lexicon::Lexicon;
use crate::model::lm::LanguageModel;
use crate::search::active::{ActiveSet, PendingEntry};
use crate::search::bptbl::BackpointerTable;
use crate::search::{
    history_start, hypothesis_from_bp, threshold, ArcProducer, Beams, Hypothesis, OutputGuard,
    PassOutcome, Penalties, SearchPass, WordScorer,
};
use crate::sync::arc_buffer::{ArcBuffer, ArcReader};
use crate::sync::sync_array::SyncReader;
use crate::telemetry::span_utils;
use crate::types::{BpIdx, WordId};

const PASS: &str = "fwdflat";

/// HMM chain of one word.
#[derive(Debug)]
pub(crate) struct WordChain {
    /// All phones but the last; the first is multiplexed over left contexts.
    phones: Vec<Hmm>,
    /// Last phone, one channel per right-context class. Single-phone words
    /// and fillers have just this one HMM.
    last: Vec<Hmm>,
}

impl WordChain {
    fn new(lexicon: &Lexicon, word: WordId) -> Self {
        let n = lexicon.acoustic_model().n_emit_state();
        let pron = lexicon.pronunciation(word);
        if lexicon.is_filler(word) || pron.len() == 1 {
            return Self {
                phones: Vec::new(),
                last: vec![Hmm::new(n, lexicon.single_ssid(word), lexicon.tmat(pron[0]))],
            };
        }
        let last = pron.len() - 1;
        let mut phones = Vec::with_capacity(last);
        phones.push(Hmm::new_multiplexed(
            n,
            lexicon.first_ssid(pron[0], lexicon.silence_phone(), pron[1]),
            lexicon.tmat(pron[0]),
        ));
        for d in 1..last {
            phones.push(Hmm::new(
                n,
                lexicon.internal_ssid(pron[d - 1], pron[d], pron[d + 1]),
                lexicon.tmat(pron[d]),
            ));
        }
        let last = (0..lexicon.n_rc(word))
            .map(|rc| {
                Hmm::new(
                    n,
                    lexicon.last_phone_ssid(word, rc),
                    lexicon.tmat(pron[last]),
                )
            })
            .collect();
        Self { phones, last }
    }

    fn hmms(&self) -> impl Iterator<Item = &Hmm> {
        self.phones.iter().chain(self.last.iter())
    }

    fn hmms_mut(&mut self) -> impl Iterator<Item = &mut Hmm> {
        self.phones.iter_mut().chain(self.last.iter_mut())
    }

    fn entry_hmm(&mut self) -> &mut Hmm {
        match self.phones.first_mut() {
            Some(first) => first,
            None => &mut self.last[0],
        }
    }
}

fn enter_if_better(hmm: &mut Hmm, score: i32, history: Option<BpIdx>, frame: usize) {
    if score > hmm.in_score() {
        hmm.enter(score, history, frame);
    }
}

/// Words of first-pass arcs whose start frame is near the current frame.
#[derive(Debug)]
struct StartWindow {
    half: usize,
    starts: VecDeque<Vec<WordId>>,
    base: usize,
    read: usize,
    done: bool,
    count: Vec<u32>,
}

impl StartWindow {
    fn new(half: usize, n_words: usize) -> Self {
        Self {
            half,
            starts: VecDeque::new(),
            base: 0,
            read: 0,
            done: false,
            count: vec![0; n_words],
        }
    }

    /// Slide the window to `[centre - half, centre + half]`, blocking until the
    /// first pass has committed the upper edge.
    fn advance(&mut self, input: &mut ArcReader, centre: usize) -> Result<()> {
        let hi = centre + self.half;
        while !self.done && self.read <= hi {
            match input.frame_arcs(self.read)? {
                Some(arcs) => {
                    let mut words: Vec<WordId> = arcs.iter().map(|a| a.word).collect();
                    words.sort_unstable();
                    words.dedup();
                    for w in &words {
                        if let Some(c) = self.count.get_mut(w.index()) {
                            *c += 1;
                        }
                    }
                    self.starts.push_back(words);
                    self.read += 1;
                    input.release_before(self.read)?;
                }
                None => self.done = true,
            }
        }
        let lo = centre.saturating_sub(self.half);
        while self.base < lo {
            match self.starts.pop_front() {
                Some(words) => {
                    for w in words {
                        if let Some(c) = self.count.get_mut(w.index()) {
                            *c -= 1;
                        }
                    }
                    self.base += 1;
                }
                None => {
                    self.base = lo;
                    break;
                }
            }
        }
        Ok(())
    }

    fn contains(&self, word: WordId) -> bool {
        self.count.get(word.index()).map_or(false, |&c| c > 0)
    }

    fn candidates(&self, out: &mut Vec<WordId>) {
        out.clear();
        for words in &self.starts {
            out.extend_from_slice(words);
        }
        out.sort_unstable();
        out.dedup();
    }
}

/// Flat-lexicon search over one utterance.
pub struct FlatSearch {
    lexicon: Arc<Lexicon>,
    scorer: Arc<dyn AcousticScorer>,
    ctx: HmmContext,
    bptbl: BackpointerTable,
    chains: Arena<WordChain>,
    chain_of: Vec<Option<Handle<WordChain>>>,
    allocated: Vec<WordId>,
    active: ActiveSet,
    next: ActiveSet,
    senones: SenoneSet,
    feed: SyncReader<Arc<[f32]>>,
    input: ArcReader,
    window: StartWindow,
    producer: ArcProducer,
    words: WordScorer,
    beams: Beams,
    fillers: Vec<WordId>,
    candidates: Vec<WordId>,
    scratch: Vec<u32>,
    best: i32,
    n_frames: usize,
}

impl FlatSearch {
    /// Set up a flat pass over the arcs of `input`, reading frames from `feed`.
    pub fn new(
        config: &DecoderConfig,
        lexicon: Arc<Lexicon>,
        lm: Arc<dyn LanguageModel>,
        scorer: Arc<dyn AcousticScorer>,
        feed: SyncReader<Arc<[f32]>>,
        input: ArcReader,
        output: Arc<ArcBuffer>,
    ) -> Result<Self> {
        let am = lexicon.acoustic_model();
        let logmath = *am.logmath();
        let ctx = am.hmm_context()?;
        let n_words = lexicon.n_words();
        let penalties = Penalties::new(
            &logmath,
            config.fwdflat_lw,
            config.wip,
            config.silprob,
            config.fillprob,
        );
        let fillers = (0..n_words as u32)
            .map(WordId)
            .filter(|&w| lexicon.is_filler(w))
            .collect();

        Ok(Self {
            bptbl: BackpointerTable::new(Arc::clone(&lexicon), config.bp_table_initial)?,
            chains: Arena::new(),
            chain_of: vec![None; n_words],
            allocated: Vec::new(),
            active: ActiveSet::new(n_words, config.active_initial)?,
            next: ActiveSet::new(n_words, config.active_initial)?,
            senones: SenoneSet::new(am.n_senone()),
            window: StartWindow::new(config.max_sf_win, n_words),
            producer: ArcProducer::new(PASS, output),
            words: WordScorer::new(Arc::clone(&lexicon), lm, penalties, true),
            beams: Beams::new(
                &logmath,
                config.fwdflat_beam,
                config.fwdflat_beam,
                config.fwdflat_wbeam,
            ),
            fillers,
            candidates: Vec::new(),
            scratch: Vec::new(),
            lexicon,
            scorer,
            ctx,
            feed,
            input,
            best: 0,
            n_frames: 0,
        })
    }

    /// The backpointer table built so far.
    pub fn backpointers(&self) -> &BackpointerTable {
        &self.bptbl
    }

    /// Number of word chains currently allocated.
    pub fn allocated_chains(&self) -> usize {
        self.chains.len()
    }

    fn chain_handle(&mut self, word: WordId) -> Handle<WordChain> {
        if let Some(h) = self.chain_of[word.index()] {
            return h;
        }
        let h = self.chains.insert(WordChain::new(&self.lexicon, word));
        self.chain_of[word.index()] = Some(h);
        self.allocated.push(word);
        h
    }

    fn chain_mut(&mut self, word: u32) -> Result<&mut WordChain> {
        self.chain_of
            .get(word as usize)
            .copied()
            .flatten()
            .and_then(|h| self.chains.get_mut(h))
            .ok_or_else(|| DecoderError::InvalidState(format!("word_{} has no chain", word)))
    }

    fn start(&mut self) -> Result<()> {
        let start = self.lexicon.dictionary().start_word();
        self.chain_handle(start);
        self.next.offer(start.0, PendingEntry::new(0, None))?;
        Ok(())
    }

    fn step(&mut self, t: usize, features: &[f32]) -> Result<()> {
        self.bptbl.begin_frame(t)?;
        std::mem::swap(&mut self.active, &mut self.next);
        self.next.clear();
        if self.active.is_empty() {
            return Err(DecoderError::PruningExhausted { pass: PASS, frame: t });
        }

        let mut nodes = std::mem::take(&mut self.scratch);
        nodes.clear();
        nodes.extend_from_slice(self.active.nodes());

        for (slot, &w) in nodes.iter().enumerate() {
            let entry = self.active.entry(slot);
            let chain = self.chain_mut(w)?;
            if entry.score > WORST_SCORE {
                let hmm = chain.entry_hmm();
                match entry.identity {
                    Some((ssid, tmat)) => {
                        hmm.enter_multiplexed(entry.score, entry.history, t, ssid, tmat)
                    }
                    None => hmm.enter(entry.score, entry.history, t),
                }
            }
        }

        if self.best < RENORM_THRESHOLD {
            let norm = self.best;
            for &w in &nodes {
                for hmm in self.chain_mut(w)?.hmms_mut().filter(|h| h.is_active()) {
                    hmm.normalize(norm);
                }
            }
            self.bptbl.record_rescale(t, norm);
            metrics::record_renormalization(PASS);
            debug!(frame = t, norm, "Renormalized flat scores");
        }

        self.senones.clear();
        for &w in &nodes {
            let Some(chain) = self.chain_of[w as usize].and_then(|h| self.chains.get(h)) else {
                continue;
            };
            for hmm in chain.hmms().filter(|h| h.is_active()) {
                hmm.collect_senones(&self.ctx, &mut self.senones);
            }
        }
        self.scorer
            .score(t, features, self.senones.as_slice(), self.ctx.scores_mut())?;

        let mut best = WORST_SCORE;
        let mut n_active = 0;
        for &w in &nodes {
            let Some(chain) = self.chain_of[w as usize].and_then(|h| self.chains.get_mut(h)) else {
                continue;
            };
            for hmm in chain.hmms_mut().filter(|h| h.is_active()) {
                best = best.max(hmm.vit_eval(&self.ctx));
                n_active += 1;
            }
        }
        if best <= WORST_SCORE {
            self.scratch = nodes;
            return Err(DecoderError::NumericUnderflow {
                pass: PASS,
                frame: t,
                best,
            });
        }
        metrics::record_frame(PASS, n_active);

        let result = self.prune_and_transition(t, best, &nodes);
        self.scratch = nodes;
        result?;

        self.window.advance(&mut self.input, t + 1)?;
        self.word_transitions(t, best)?;
        self.release_idle_chains();
        if self.next.is_empty() {
            return Err(DecoderError::PruningExhausted { pass: PASS, frame: t });
        }

        let frontier = self.frontier(t);
        let words = &self.words;
        self.producer
            .sweep(&self.bptbl, t + 1, frontier, |b, e| words.language_score(b, e))?;

        self.best = best;
        self.n_frames = t + 1;
        Ok(())
    }

    /// Prune each chain back to front, so an HMM entered from its
    /// predecessor this frame is never pruned afterwards.
    fn prune_and_transition(&mut self, t: usize, best: i32, nodes: &[u32]) -> Result<()> {
        let th = threshold(best, self.beams.beam);
        let pth = threshold(best, self.beams.pbeam);
        let wth = threshold(best, self.beams.wbeam);

        for &w in nodes {
            let word = WordId(w);
            let Some(handle) = self.chain_of[w as usize] else {
                continue;
            };
            let Some(chain) = self.chains.get_mut(handle) else {
                continue;
            };
            let mut alive = false;

            for (rc, hmm) in chain.last.iter_mut().enumerate() {
                if !hmm.is_active() {
                    continue;
                }
                let (out, history) = (hmm.out_score(), hmm.out_history());
                if hmm.best_score() >= th {
                    alive = true;
                } else {
                    hmm.clear();
                }
                if out > WORST_SCORE && out >= wth {
                    self.bptbl.save_entry(word, out, history, rc)?;
                }
            }

            for i in (0..chain.phones.len()).rev() {
                let hmm = &mut chain.phones[i];
                if !hmm.is_active() {
                    continue;
                }
                let (out, history) = (hmm.out_score(), hmm.out_history());
                if hmm.best_score() >= th {
                    alive = true;
                } else {
                    hmm.clear();
                }
                if out <= WORST_SCORE || out < pth {
                    continue;
                }
                alive = true;
                if i + 1 < chain.phones.len() {
                    enter_if_better(&mut chain.phones[i + 1], out, history, t + 1);
                } else {
                    for last in chain.last.iter_mut() {
                        enter_if_better(last, out, history, t + 1);
                    }
                }
            }

            if alive {
                self.next.activate(w)?;
            }
        }
        Ok(())
    }

    /// Enter candidate words from this frame's exits with full language scores.
    fn word_transitions(&mut self, t: usize, best: i32) -> Result<()> {
        let range = self.bptbl.frame_entries(t);
        if range.is_empty() {
            return Ok(());
        }
        let th = threshold(best, self.beams.beam);
        let dict = Arc::clone(self.lexicon.dictionary());
        let (start, finish) = (dict.start_word(), dict.finish_word());

        let mut candidates = std::mem::take(&mut self.candidates);
        self.window.candidates(&mut candidates);
        candidates.extend_from_slice(&self.fillers);
        candidates.sort_unstable();
        candidates.dedup();

        for &word in &candidates {
            if word == start {
                continue;
            }
            let pron = self.lexicon.pronunciation(word);
            let first = pron[0];
            let second = pron.get(1).copied();
            let mut best_entry: Option<(BpIdx, i32)> = None;
            for i in range.clone() {
                let e = &self.bptbl.entries()[i];
                if e.word == finish {
                    continue;
                }
                let idx = BpIdx(i as u32);
                let exit = self.bptbl.rc_score(idx, self.lexicon.rc_class(e.word, first));
                let score = log_mul(exit, self.words.entry(word, e.real_word, e.prev_real_word));
                if score > best_entry.map_or(WORST_SCORE, |b| b.1) {
                    best_entry = Some((idx, score));
                }
            }
            let Some((bp, score)) = best_entry else {
                continue;
            };
            if score < th {
                continue;
            }
            let mut entry = PendingEntry::new(score, Some(bp));
            if let Some(second) = second.filter(|_| !self.lexicon.is_filler(word)) {
                let lc = self
                    .bptbl
                    .get(bp)
                    .map_or(self.lexicon.silence_phone(), |e| self.lexicon.left_context(e.word));
                entry = entry.with_identity(
                    self.lexicon.first_ssid(first, lc, second),
                    self.lexicon.tmat(first),
                );
            }
            self.chain_handle(word);
            self.next.offer(word.0, entry)?;
        }
        self.candidates = candidates;
        Ok(())
    }

    /// Free chains of words that are idle and out of the window.
    fn release_idle_chains(&mut self) {
        let mut i = 0;
        while i < self.allocated.len() {
            let w = self.allocated[i];
            if self.next.is_active(w.0) || self.window.contains(w) || self.lexicon.is_filler(w) {
                i += 1;
                continue;
            }
            if let Some(h) = self.chain_of[w.index()].take() {
                self.chains.remove(h);
            }
            self.allocated.swap_remove(i);
        }
    }

    fn frontier(&self, t: usize) -> usize {
        let mut frontier = t + 1;
        for (w, entry) in self.next.iter() {
            if entry.score > WORST_SCORE {
                frontier = frontier.min(history_start(&self.bptbl, entry.history));
            }
            let Some(chain) = self.chain_of[w as usize].and_then(|h| self.chains.get(h)) else {
                continue;
            };
            for hmm in chain.hmms().filter(|h| h.is_active()) {
                for s in 0..hmm.n_emit_state() {
                    if hmm.score(s) > WORST_SCORE {
                        frontier = frontier.min(history_start(&self.bptbl, hmm.history(s)));
                    }
                }
                if hmm.in_score() > WORST_SCORE {
                    frontier = frontier.min(history_start(&self.bptbl, hmm.in_history()));
                }
            }
        }
        frontier
    }

    fn finish(&mut self) -> Result<PassOutcome> {
        let n = self.n_frames;
        let finish = self.lexicon.dictionary().finish_word();
        let words = &self.words;
        let hypothesis: Option<Hypothesis> = n
            .checked_sub(1)
            .and_then(|last| self.bptbl.find_best_exit(last, Some(finish)))
            .map(|idx| {
                hypothesis_from_bp(&self.lexicon, &self.bptbl, idx, |b, e| {
                    words.language_score(b, e)
                })
            });
        self.producer
            .finish(&self.bptbl, n, |b, e| words.language_score(b, e))?;

        metrics::record_backpointers(PASS, self.bptbl.len());
        span_utils::add_frames(n);
        span_utils::add_arcs(self.producer.emitted());
        info!(
            frames = n,
            backpointers = self.bptbl.len(),
            arcs = self.producer.emitted(),
            chains = self.chains.len(),
            hypothesis = hypothesis.as_ref().map_or("", |h| h.text.as_str()),
            "Flat pass finished"
        );
        Ok(PassOutcome {
            hypothesis,
            frames: n,
            lattice: None,
        })
    }
}

impl SearchPass for FlatSearch {
    fn name(&self) -> &'static str {
        PASS
    }

    fn run(&mut self) -> Result<PassOutcome> {
        let _timer = PassTimer::new(PASS);
        let _guard = OutputGuard(Arc::clone(self.producer.output()));
        self.start()?;
        let mut t = 0;
        while let Some(features) = self.feed.array().wait_get(t)? {
            self.step(t, &features)?;
            self.feed.release_to(t + 1)?;
            t += 1;
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::acoustic::PrecomputedScorer;
    use crate::model::lexicon::tests::toy_lexicon;
    use crate::search::fwdtree::tests::{cat_frames, toy_lm};
    use crate::search::fwdtree::TreeSearch;
    use crate::sync::arc_buffer::WordArc;
    use crate::sync::sync_array::SyncArray;
    use parking_lot::RwLock;
    use std::thread;

    #[test]
    fn test_start_window_slides() {
        let buffer = ArcBuffer::new("tree", None, true);
        let mut reader = buffer.reader().unwrap();
        let arc = |sf: usize, w: u32| WordArc {
            src_frame: sf,
            dest_frame: sf + 3,
            word: WordId(w),
            score: 0,
        };
        for sf in 0..10 {
            buffer.push(arc(sf, (sf % 3) as u32)).unwrap();
            if sf == 4 {
                buffer.push(arc(sf, 7)).unwrap();
            }
            buffer.commit_frame().unwrap();
        }
        buffer.finalize().unwrap();

        let mut window = StartWindow::new(2, 8);
        window.advance(&mut reader, 0).unwrap();
        assert!(window.contains(WordId(0)));
        assert!(!window.contains(WordId(7)));
        window.advance(&mut reader, 6).unwrap();
        assert!(window.contains(WordId(7)));
        window.advance(&mut reader, 7).unwrap();
        assert!(!window.contains(WordId(7)));
        let mut c = Vec::new();
        window.candidates(&mut c);
        assert_eq!(c, vec![WordId(0), WordId(1), WordId(2)]);
        // Past the end of the stream the window simply drains.
        window.advance(&mut reader, 40).unwrap();
        assert!(!window.contains(WordId(0)));
    }

    #[test]
    fn test_flat_pass_follows_tree_pass() {
        let lex = Arc::new(toy_lexicon());
        let lm: Arc<dyn LanguageModel> = Arc::new(toy_lm(&lex));
        let scorer: Arc<dyn AcousticScorer> = Arc::new(PrecomputedScorer::new(21));
        let config = DecoderConfig::default();

        let feed = SyncArray::<Arc<[f32]>>::new("features");
        let tree_out = ArcBuffer::new("fwdtree", Some(Arc::clone(&lm)), true);
        let flat_out = ArcBuffer::new("fwdflat", Some(Arc::clone(&lm)), true);
        let mut tree = TreeSearch::new(
            &config,
            Arc::clone(&lex),
            Arc::clone(&lm),
            Arc::clone(&scorer),
            feed.retain().unwrap(),
            Arc::clone(&tree_out),
            Arc::new(RwLock::new(None)),
        )
        .unwrap();
        let mut flat = FlatSearch::new(
            &config,
            lex,
            lm,
            scorer,
            feed.retain().unwrap(),
            tree_out.reader().unwrap(),
            Arc::clone(&flat_out),
        )
        .unwrap();

        let tree_thread = thread::spawn(move || tree.run());
        let flat_thread = thread::spawn(move || flat.run());
        for f in cat_frames() {
            feed.append(Arc::from(f)).unwrap();
        }
        feed.finalize().unwrap();

        let tree_hyp = tree_thread.join().unwrap().unwrap().hypothesis.unwrap();
        let flat_outcome = flat_thread.join().unwrap().unwrap();
        let flat_hyp = flat_outcome.hypothesis.unwrap();
        assert_eq!(flat_outcome.frames, 15);
        assert_eq!(tree_hyp.text, "cat");
        assert_eq!(flat_hyp.text, "cat");
        let cat = flat_hyp.segments.iter().find(|s| s.word == "cat").unwrap();
        assert_eq!((cat.start_frame, cat.end_frame), (3, 11));
        assert!(flat_out.is_finalized());
        assert!(flat_out.n_arcs() >= 3);
    }
}
