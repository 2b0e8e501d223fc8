//! First pass: time-synchronous search over the lexical tree.
//!
//! Only bigram scores are available inside the tree, applied when a word's
//! last phone is entered. Word exits are streamed to the next pass as soon as
//! no live path can still exit a word starting earlier.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::DecoderConfig;
use crate::constants::score::{RENORM_THRESHOLD, WORST_SCORE};
use crate::error::{DecoderError, Result};
use crate::hmm::context::{HmmContext, SenoneSet};
use crate::hmm::logmath::log_mul;
use crate::metrics::{self, PassTimer};
use crate::model::acoustic::AcousticScorer;
use crate::model::lexicon::Lexicon;
use crate::model::lm::LanguageModel;
use crate::search::active::{ActiveSet, PendingEntry};
use crate::search::bptbl::BackpointerTable;
use crate::search::lextree::{LexTree, NodeId, NodeKind};
use crate::search::{
    history_start, hypothesis_from_bp, threshold, ArcProducer, Beams, Hypothesis, OutputGuard,
    PassOutcome, Penalties, PhoneConstraint, SearchPass, WordScorer,
};
use crate::sync::arc_buffer::ArcBuffer;
use crate::sync::sync_array::SyncReader;
use crate::telemetry::span_utils;
use crate::types::{BpIdx, PhoneId};

const PASS: &str = "fwdtree";

/// Lexical-tree search over one utterance.
pub struct TreeSearch {
    lexicon: Arc<Lexicon>,
    scorer: Arc<dyn AcousticScorer>,
    ctx: HmmContext,
    tree: LexTree,
    bptbl: BackpointerTable,
    active: ActiveSet,
    next: ActiveSet,
    senones: SenoneSet,
    feed: SyncReader<Arc<[f32]>>,
    producer: ArcProducer,
    words: WordScorer,
    beams: Beams,
    constraint: Option<PhoneConstraint>,
    partial: Arc<RwLock<Option<Hypothesis>>>,
    partial_interval: usize,
    best_for_phone: Vec<Option<(BpIdx, i32)>>,
    scratch: Vec<NodeId>,
    best: i32,
    n_frames: usize,
}

impl TreeSearch {
    /// Set up a tree pass reading frames from `feed` and writing word arcs to `output`.
    pub fn new(
        config: &DecoderConfig,
        lexicon: Arc<Lexicon>,
        lm: Arc<dyn LanguageModel>,
        scorer: Arc<dyn AcousticScorer>,
        feed: SyncReader<Arc<[f32]>>,
        output: Arc<ArcBuffer>,
        partial: Arc<RwLock<Option<Hypothesis>>>,
    ) -> Result<Self> {
        let am = lexicon.acoustic_model();
        let logmath = *am.logmath();
        let ctx = am.hmm_context()?;
        let tree = LexTree::build(&lexicon, lm.as_ref())?;
        let n_phone = am.n_phone();
        let n_senone = am.n_senone();
        let penalties = Penalties::new(&logmath, config.lw, config.wip, config.silprob, config.fillprob);

        Ok(Self {
            bptbl: BackpointerTable::new(Arc::clone(&lexicon), config.bp_table_initial)?,
            active: ActiveSet::new(tree.len(), config.active_initial)?,
            next: ActiveSet::new(tree.len(), config.active_initial)?,
            senones: SenoneSet::new(n_senone),
            words: WordScorer::new(Arc::clone(&lexicon), lm, penalties, false),
            beams: Beams::new(&logmath, config.beam, config.pbeam, config.wbeam),
            producer: ArcProducer::new(PASS, output),
            best_for_phone: vec![None; n_phone],
            scratch: Vec::new(),
            constraint: None,
            partial_interval: config.partial_interval,
            partial,
            lexicon,
            scorer,
            ctx,
            tree,
            feed,
            best: 0,
            n_frames: 0,
        })
    }

    /// Restrict the search with an external phone segmentation.
    pub fn with_constraint(mut self, constraint: Option<PhoneConstraint>) -> Self {
        self.constraint = constraint.filter(|c| !c.is_empty());
        self
    }

    /// The backpointer table built so far.
    pub fn backpointers(&self) -> &BackpointerTable {
        &self.bptbl
    }

    fn start(&mut self) -> Result<()> {
        self.tree.clear();
        self.active.clear();
        self.next.clear();
        self.next
            .offer(self.tree.start_node(), PendingEntry::new(0, None))?;
        self.best = 0;
        self.n_frames = 0;
        Ok(())
    }

    /// Search one frame.
    fn step(&mut self, t: usize, features: &[f32]) -> Result<()> {
        let best = self.evaluate(t, features)?;
        self.advance(t, best)
    }

    /// Enter pending HMMs, score the frame and return the best score.
    fn evaluate(&mut self, t: usize, features: &[f32]) -> Result<i32> {
        self.bptbl.begin_frame(t)?;
        std::mem::swap(&mut self.active, &mut self.next);
        self.next.clear();
        if self.active.is_empty() {
            return Err(DecoderError::PruningExhausted { pass: PASS, frame: t });
        }

        for (node, entry) in self.active.iter() {
            if entry.score <= WORST_SCORE {
                continue;
            }
            let hmm = &mut self.tree.node_mut(node).hmm;
            match entry.identity {
                Some((ssid, tmat)) => hmm.enter_multiplexed(entry.score, entry.history, t, ssid, tmat),
                None => hmm.enter(entry.score, entry.history, t),
            }
        }

        if self.best < RENORM_THRESHOLD {
            let norm = self.best;
            for &node in self.active.nodes() {
                self.tree.node_mut(node).hmm.normalize(norm);
            }
            self.bptbl.record_rescale(t, norm);
            metrics::record_renormalization(PASS);
            debug!(frame = t, norm, "Renormalized tree scores");
        }

        self.senones.clear();
        for &node in self.active.nodes() {
            self.tree
                .node(node)
                .hmm
                .collect_senones(&self.ctx, &mut self.senones);
        }
        self.scorer
            .score(t, features, self.senones.as_slice(), self.ctx.scores_mut())?;

        let mut best = WORST_SCORE;
        for &node in self.active.nodes() {
            let score = self.tree.node_mut(node).hmm.vit_eval(&self.ctx);
            if score > best {
                best = score;
            }
        }
        if best <= WORST_SCORE {
            return Err(DecoderError::NumericUnderflow {
                pass: PASS,
                frame: t,
                best,
            });
        }
        metrics::record_frame(PASS, self.active.len());
        Ok(best)
    }

    /// Prune against `best`, start new words and stream finished arcs.
    fn advance(&mut self, t: usize, best: i32) -> Result<()> {
        self.prune_and_transition(t, best)?;
        self.word_transitions(t)?;
        if self.next.is_empty() {
            return Err(DecoderError::PruningExhausted { pass: PASS, frame: t });
        }

        let frontier = self.frontier(t);
        let words = &self.words;
        self.producer
            .sweep(&self.bptbl, t + 1, frontier, |b, e| words.language_score(b, e))?;

        self.best = best;
        self.n_frames = t + 1;
        if self.partial_interval > 0 && self.n_frames % self.partial_interval == 0 {
            *self.partial.write() = self.best_hypothesis(t, false);
        }
        Ok(())
    }

    /// Prune the frame's HMMs and hand exits on to successors or the
    /// backpointer table.
    fn prune_and_transition(&mut self, t: usize, best: i32) -> Result<()> {
        let th = threshold(best, self.beams.beam);
        let pth = threshold(best, self.beams.pbeam);
        let wth = threshold(best, self.beams.wbeam);

        let required = self.constraint.as_ref().and_then(|c| c.required(t));
        let phone = match required {
            Some(p) if self.any_survivor_with(p, th) => Some(p),
            Some(p) => {
                warn!(frame = t, phone = %p, "Phone constraint would empty the active set, ignoring it");
                None
            }
            None => None,
        };

        let mut nodes = std::mem::take(&mut self.scratch);
        nodes.clear();
        nodes.extend_from_slice(self.active.nodes());
        for &node in &nodes {
            let (keep, out, history, kind) = {
                let n = self.tree.node(node);
                let keep = n.hmm.best_score() >= th && phone.map_or(true, |p| n.phone == p);
                (keep, n.hmm.out_score(), n.hmm.out_history(), n.kind)
            };
            if keep {
                self.next.activate(node)?;
            }
            if out > WORST_SCORE {
                match kind {
                    NodeKind::Root { .. } | NodeKind::Internal => {
                        if out >= pth {
                            self.enter_successors(node, out, history, pth)?;
                        }
                    }
                    NodeKind::Last { word, rc } => {
                        if out >= wth {
                            self.bptbl.save_entry(word, out, history, rc as usize)?;
                        }
                    }
                    NodeKind::Single { word } => {
                        if out >= wth {
                            self.bptbl.save_entry(word, out, history, 0)?;
                        }
                    }
                }
            }
            if !keep {
                self.tree.node_mut(node).hmm.clear();
            }
        }
        self.scratch = nodes;
        Ok(())
    }

    fn any_survivor_with(&self, phone: PhoneId, th: i32) -> bool {
        self.active.nodes().iter().any(|&node| {
            let n = self.tree.node(node);
            n.phone == phone && n.hmm.best_score() >= th
        })
    }

    /// Enter internal children and last-phone channels below `node`.
    fn enter_successors(
        &mut self,
        node: NodeId,
        out: i32,
        history: Option<BpIdx>,
        pth: i32,
    ) -> Result<()> {
        let start = self.lexicon.dictionary().start_word();
        let prev = history
            .and_then(|h| self.bptbl.get(h))
            .map_or(start, |e| e.real_word);

        let n = self.tree.node(node);
        for &child in &n.children {
            self.next.offer(child, PendingEntry::new(out, history))?;
        }
        for channels in &n.words {
            let score = log_mul(out, self.words.lm_only(channels.word, prev, None));
            if score < pth {
                continue;
            }
            for rc in 0..channels.n_rc as NodeId {
                self.next
                    .offer(channels.first + rc, PendingEntry::new(score, history))?;
            }
        }
        Ok(())
    }

    /// Start new words from this frame's exits.
    fn word_transitions(&mut self, t: usize) -> Result<()> {
        let range = self.bptbl.frame_entries(t);
        if range.is_empty() {
            return Ok(());
        }
        let dict = self.lexicon.dictionary();
        let finish = dict.finish_word();
        let start = dict.start_word();

        // Best exit into each following phone, respecting right contexts.
        self.best_for_phone.fill(None);
        for i in range {
            let idx = BpIdx(i as u32);
            let word = self.bptbl.entries()[i].word;
            if word == finish {
                continue;
            }
            for (p, best) in self.best_for_phone.iter_mut().enumerate() {
                let rc = self.lexicon.rc_class(word, PhoneId(p as u16));
                let score = self.bptbl.rc_score(idx, rc);
                if score > best.map_or(WORST_SCORE, |b| b.1) {
                    *best = Some((idx, score));
                }
            }
        }

        let wip = self.words.penalties().wip;
        for (p, best) in self.best_for_phone.iter().enumerate() {
            let Some((bp, score)) = *best else { continue };
            let phone = PhoneId(p as u16);
            let Some(e) = self.bptbl.get(bp) else { continue };
            let lc = self.lexicon.left_context(e.word);
            let entry_score = log_mul(score, wip);
            for &root in self.tree.roots_for(phone) {
                let NodeKind::Root { second } = self.tree.node(root).kind else {
                    continue;
                };
                let entry = PendingEntry::new(entry_score, Some(bp))
                    .with_identity(self.lexicon.first_ssid(phone, lc, second), self.lexicon.tmat(phone));
                self.next.offer(root, entry)?;
            }
        }

        for &node in self.tree.singles() {
            let n = self.tree.node(node);
            let NodeKind::Single { word } = n.kind else {
                continue;
            };
            let Some((bp, score)) = self.best_for_phone[n.phone.index()] else {
                continue;
            };
            let prev = self.bptbl.get(bp).map_or(start, |e| e.real_word);
            let entry_score = log_mul(score, self.words.entry(word, prev, None));
            self.next
                .offer(node, PendingEntry::new(entry_score, Some(bp)))?;
        }
        Ok(())
    }

    /// Oldest start frame of any exit still to come.
    fn frontier(&self, t: usize) -> usize {
        let mut frontier = t + 1;
        for (node, entry) in self.next.iter() {
            if entry.score > WORST_SCORE {
                frontier = frontier.min(history_start(&self.bptbl, entry.history));
            }
            let hmm = &self.tree.node(node).hmm;
            for s in 0..hmm.n_emit_state() {
                if hmm.score(s) > WORST_SCORE {
                    frontier = frontier.min(history_start(&self.bptbl, hmm.history(s)));
                }
            }
        }
        frontier
    }

    fn best_hypothesis(&self, frame: usize, prefer_finish: bool) -> Option<Hypothesis> {
        let prefer = prefer_finish.then(|| self.lexicon.dictionary().finish_word());
        let idx = self.bptbl.find_best_exit(frame, prefer)?;
        let words = &self.words;
        Some(hypothesis_from_bp(&self.lexicon, &self.bptbl, idx, |b, e| {
            words.language_score(b, e)
        }))
    }

    fn finish(&mut self) -> Result<PassOutcome> {
        let n = self.n_frames;
        let hypothesis = n
            .checked_sub(1)
            .and_then(|last| self.best_hypothesis(last, true));
        let words = &self.words;
        self.producer
            .finish(&self.bptbl, n, |b, e| words.language_score(b, e))?;
        *self.partial.write() = hypothesis.clone();

        metrics::record_backpointers(PASS, self.bptbl.len());
        span_utils::add_frames(n);
        span_utils::add_arcs(self.producer.emitted());
        info!(
            frames = n,
            backpointers = self.bptbl.len(),
            arcs = self.producer.emitted(),
            hypothesis = hypothesis.as_ref().map_or("", |h| h.text.as_str()),
            "Tree pass finished"
        );
        Ok(PassOutcome {
            hypothesis,
            frames: n,
            lattice: None,
        })
    }
}

impl SearchPass for TreeSearch {
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
