//! Word lattice built from a stream of word arcs.
//!
//! Nodes are keyed by (frame, language-model state). An arc spanning
//! `[sf, ef]` links every node at `sf` to the incomplete node at `ef + 1`;
//! once arcs starting at a frame arrive, every link into that frame is known
//! and its incomplete node is split into concrete language-model states.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::lattice::{HTK_SENT_END, HTK_SENT_START};
use crate::constants::score::WORST_SCORE;
use crate::constants::words::{FINISH_WORD, START_WORD};
use crate::error::{DecoderError, Result};
use crate::hmm::logmath::{log_mul, LogMath};
use crate::model::lexicon::Lexicon;
use crate::model::lm::LanguageModel;
use crate::search::{Hypothesis, Penalties, Segment};
use crate::sync::arc_buffer::WordArc;
use crate::types::WordId;

/// Interned language-model context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LmStateId(pub u32);

impl LmStateId {
    /// Context not yet known.
    pub const INCOMPLETE: Self = Self(0);
    /// Empty context, at the utterance start.
    pub const EMPTY: Self = Self(1);
}

/// Index of a lattice node.
pub type NodeId = u32;

/// Index of a lattice link.
pub type LinkId = u32;

/// A lattice node.
#[derive(Debug, Clone)]
pub struct LatNode {
    /// Frame at which outgoing words start.
    pub frame: usize,
    /// Language-model context of paths reaching the node.
    pub state: LmStateId,
    in_links: Vec<LinkId>,
    out_links: Vec<LinkId>,
    alive: bool,
}

/// A scored word between two nodes.
#[derive(Debug, Clone, Copy)]
pub struct LatLink {
    /// Source node.
    pub from: NodeId,
    /// Destination node.
    pub to: NodeId,
    /// The word.
    pub word: WordId,
    /// Best acoustic score of the word over this span.
    pub ascr: i32,
    /// Unweighted language score given the source context.
    pub lscr: i32,
    alive: bool,
}

/// Lowest-cost path through the lattice.
#[derive(Debug, Clone)]
pub struct BestPath {
    /// Links from the start node, in order.
    pub links: Vec<LinkId>,
    /// Final node.
    pub end: NodeId,
    /// Total path score.
    pub score: i64,
}

/// Serializable lattice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatticeExport {
    /// Number of frames covered.
    pub frames: usize,
    /// Start node.
    pub start: usize,
    /// End node of the best path, if any.
    pub end: Option<usize>,
    /// Nodes, renumbered densely.
    pub nodes: Vec<ExportNode>,
    /// Links between exported nodes.
    pub links: Vec<ExportLink>,
}

/// Exported node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportNode {
    /// Node id in the export.
    pub id: usize,
    /// Frame.
    pub frame: usize,
    /// Context words, oldest first.
    pub context: Vec<String>,
}

/// Exported link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportLink {
    /// Source node id.
    pub from: usize,
    /// Destination node id.
    pub to: usize,
    /// Word spelling.
    pub word: String,
    /// First frame of the word.
    pub start_frame: usize,
    /// Last frame of the word.
    pub end_frame: usize,
    /// Acoustic score.
    pub ascr: i32,
    /// Unweighted language score.
    pub lscr: i32,
    /// Link posterior probability.
    pub posterior: f64,
}

/// Word lattice for one utterance.
pub struct Lattice {
    lexicon: Arc<Lexicon>,
    lm: Arc<dyn LanguageModel>,
    logmath: LogMath,
    penalties: Penalties,
    contexts: Vec<Box<[WordId]>>,
    context_ids: HashMap<Box<[WordId]>, LmStateId>,
    nodes: Vec<LatNode>,
    node_of: HashMap<(usize, LmStateId), NodeId>,
    by_frame: Vec<Vec<NodeId>>,
    links: Vec<LatLink>,
    link_of: HashMap<(NodeId, NodeId, WordId), LinkId>,
    start: NodeId,
    resolved: usize,
    last_src: usize,
    dropped: usize,
}

impl std::fmt::Debug for Lattice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lattice")
            .field("nodes", &self.nodes.len())
            .field("links", &self.links.len())
            .field("contexts", &self.contexts.len())
            .field("resolved", &self.resolved)
            .finish()
    }
}

impl Lattice {
    /// Empty lattice with its start node at frame 0.
    pub(crate) fn new(
        lexicon: Arc<Lexicon>,
        lm: Arc<dyn LanguageModel>,
        penalties: Penalties,
    ) -> Self {
        let logmath = *lexicon.acoustic_model().logmath();
        let empty: Box<[WordId]> = Box::new([]);
        let mut context_ids = HashMap::new();
        context_ids.insert(empty.clone(), LmStateId::EMPTY);
        let mut lattice = Self {
            lexicon,
            lm,
            logmath,
            penalties,
            contexts: vec![empty.clone(), empty],
            context_ids,
            nodes: Vec::new(),
            node_of: HashMap::new(),
            by_frame: Vec::new(),
            links: Vec::new(),
            link_of: HashMap::new(),
            start: 0,
            resolved: 0,
            last_src: 0,
            dropped: 0,
        };
        lattice.start = lattice.node_at(0, LmStateId::EMPTY);
        lattice
    }

    /// Start node.
    pub fn start(&self) -> NodeId {
        self.start
    }

    /// Live nodes with their ids.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &LatNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.alive)
            .map(|(i, n)| (i as NodeId, n))
    }

    /// Live links with their ids.
    pub fn links(&self) -> impl Iterator<Item = (LinkId, &LatLink)> {
        self.links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.alive)
            .map(|(i, l)| (i as LinkId, l))
    }

    /// Context words of a state, oldest first.
    pub fn context(&self, state: LmStateId) -> &[WordId] {
        self.contexts
            .get(state.0 as usize)
            .map_or(&[][..], |c| &c[..])
    }

    /// Frames spanned by the nodes so far.
    pub fn n_frames(&self) -> usize {
        self.by_frame.len().saturating_sub(1)
    }

    /// Arcs dropped because nothing reached their start frame.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn node_at(&mut self, frame: usize, state: LmStateId) -> NodeId {
        if let Some(&id) = self.node_of.get(&(frame, state)) {
            return id;
        }
        let id = self.nodes.len() as NodeId;
        self.nodes.push(LatNode {
            frame,
            state,
            in_links: Vec::new(),
            out_links: Vec::new(),
            alive: true,
        });
        self.node_of.insert((frame, state), id);
        if self.by_frame.len() <= frame {
            self.by_frame.resize_with(frame + 1, Vec::new);
        }
        self.by_frame[frame].push(id);
        id
    }

    fn intern(&mut self, words: &[WordId]) -> LmStateId {
        if let Some(&id) = self.context_ids.get(words) {
            return id;
        }
        let id = LmStateId(self.contexts.len() as u32);
        let boxed: Box<[WordId]> = words.into();
        self.contexts.push(boxed.clone());
        self.context_ids.insert(boxed, id);
        id
    }

    /// Context after `word` follows `state`.
    fn extend(&mut self, state: LmStateId, word: WordId) -> LmStateId {
        if self.lexicon.is_filler(word) {
            return state;
        }
        let keep = self.lm.order().saturating_sub(1);
        let mut words = self.context(state).to_vec();
        words.push(word);
        let skip = words.len().saturating_sub(keep);
        self.intern(&words[skip..])
    }

    fn lm_score(&self, state: LmStateId, word: WordId) -> i32 {
        if self.lexicon.is_filler(word) || word == self.lexicon.dictionary().start_word() {
            return 0;
        }
        match *self.context(state) {
            [] => self.lm.unigram_score(word),
            [prev] => self.lm.bigram_score(word, prev).score,
            [.., prev2, prev] => self.lm.trigram_score(word, prev, Some(prev2)).score,
        }
    }

    /// Fold an arc into the lattice. Arcs must arrive in start-frame order.
    /// Returns whether the arc was linked.
    pub fn add_arc(&mut self, arc: &WordArc) -> Result<bool> {
        if arc.dest_frame < arc.src_frame {
            return Err(DecoderError::InvalidInput(format!(
                "arc ends at frame {} before it starts at {}",
                arc.dest_frame, arc.src_frame
            )));
        }
        if arc.src_frame < self.last_src {
            return Err(DecoderError::InvalidState(format!(
                "arc starting at frame {} after frame {}",
                arc.src_frame, self.last_src
            )));
        }
        self.last_src = arc.src_frame;
        self.resolve_through(arc.src_frame);

        let sources: Vec<NodeId> = self
            .by_frame
            .get(arc.src_frame)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|&id| {
                        let n = &self.nodes[id as usize];
                        n.alive && n.state != LmStateId::INCOMPLETE
                    })
                    .collect()
            })
            .unwrap_or_default();
        if sources.is_empty() {
            self.dropped += 1;
            return Ok(false);
        }

        let dest = self.node_at(arc.dest_frame + 1, LmStateId::INCOMPLETE);
        for from in sources {
            let state = self.nodes[from as usize].state;
            let lscr = self.lm_score(state, arc.word);
            self.link(from, dest, arc.word, arc.score, lscr);
        }
        Ok(true)
    }

    /// Add a link or merge it into the existing one, keeping the better score.
    fn link(&mut self, from: NodeId, to: NodeId, word: WordId, ascr: i32, lscr: i32) -> LinkId {
        if let Some(&id) = self.link_of.get(&(from, to, word)) {
            let l = &mut self.links[id as usize];
            l.ascr = l.ascr.max(ascr);
            return id;
        }
        let id = self.links.len() as LinkId;
        self.links.push(LatLink {
            from,
            to,
            word,
            ascr,
            lscr,
            alive: true,
        });
        self.link_of.insert((from, to, word), id);
        self.nodes[from as usize].out_links.push(id);
        self.nodes[to as usize].in_links.push(id);
        id
    }

    fn resolve_through(&mut self, frame: usize) {
        while self.resolved <= frame {
            self.resolve_frame(self.resolved);
            self.resolved += 1;
        }
    }

    /// Split the incomplete node of a frame by the context of each in-link.
    fn resolve_frame(&mut self, frame: usize) {
        let Some(inc) = self.node_of.remove(&(frame, LmStateId::INCOMPLETE)) else {
            return;
        };
        let in_links = std::mem::take(&mut self.nodes[inc as usize].in_links);
        self.nodes[inc as usize].alive = false;
        for id in in_links {
            let LatLink {
                from,
                word,
                ascr,
                lscr,
                ..
            } = self.links[id as usize];
            self.link_of.remove(&(from, inc, word));
            self.links[id as usize].alive = false;
            let state = self.nodes[from as usize].state;
            let state = self.extend(state, word);
            let to = self.node_at(frame, state);
            self.link(from, to, word, ascr, lscr);
        }
    }

    /// Resolve every remaining frame.
    pub fn finish(&mut self) {
        let last = self.by_frame.len();
        if last > 0 {
            self.resolve_through(last - 1);
        }
        debug!(
            nodes = self.nodes().count(),
            links = self.links().count(),
            contexts = self.contexts.len() - 1,
            dropped = self.dropped,
            "Lattice finished"
        );
    }

    /// Unlink every node that is not both reachable from the start node and
    /// able to reach `end`. Returns the number of nodes removed.
    pub fn unlink_unreachable(&mut self, end: NodeId) -> usize {
        let order = self.ordered_nodes();
        let mut forward = vec![false; self.nodes.len()];
        let mut backward = vec![false; self.nodes.len()];
        forward[self.start as usize] = true;
        backward[end as usize] = true;
        for &u in &order {
            if !forward[u as usize] {
                continue;
            }
            for &id in &self.nodes[u as usize].out_links {
                let link = &self.links[id as usize];
                if link.alive {
                    forward[link.to as usize] = true;
                }
            }
        }
        for &u in order.iter().rev() {
            if !backward[u as usize] {
                continue;
            }
            for &id in &self.nodes[u as usize].in_links {
                let link = &self.links[id as usize];
                if link.alive {
                    backward[link.from as usize] = true;
                }
            }
        }

        let mut removed = 0;
        for u in order {
            if forward[u as usize] && backward[u as usize] {
                continue;
            }
            let node = &mut self.nodes[u as usize];
            node.alive = false;
            let (frame, state) = (node.frame, node.state);
            let dead: Vec<LinkId> = node.in_links.drain(..).chain(node.out_links.drain(..)).collect();
            self.node_of.remove(&(frame, state));
            for id in dead {
                let link = &mut self.links[id as usize];
                if !link.alive {
                    continue;
                }
                link.alive = false;
                let LatLink { from, to, word, .. } = *link;
                self.link_of.remove(&(from, to, word));
                self.nodes[from as usize].out_links.retain(|&l| l != id);
                self.nodes[to as usize].in_links.retain(|&l| l != id);
            }
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "Unlinked unreachable lattice nodes");
        }
        removed
    }

    /// Score of a link on a path: weighted language score plus penalties.
    fn path_score(&self, link: &LatLink) -> i32 {
        let word = link.word;
        if self.lexicon.is_filler(word) {
            return log_mul(link.ascr, self.penalties.filler(&self.lexicon, word));
        }
        if word == self.lexicon.dictionary().start_word() {
            return link.ascr;
        }
        let lscr = self.logmath.weight(link.lscr, self.penalties.lw);
        log_mul(log_mul(link.ascr, lscr), self.penalties.wip)
    }

    /// Live nodes in frame order, which is a topological order.
    fn ordered_nodes(&self) -> Vec<NodeId> {
        self.by_frame
            .iter()
            .flatten()
            .copied()
            .filter(|&id| self.nodes[id as usize].alive)
            .collect()
    }

    /// Best-scoring path from the start node. It ends at a node reached by
    /// `</s>` if any, else at the best node of the last frame reached.
    pub fn best_path(&self) -> Option<BestPath> {
        let order = self.ordered_nodes();
        let mut score: Vec<Option<i64>> = vec![None; self.nodes.len()];
        let mut back: Vec<Option<LinkId>> = vec![None; self.nodes.len()];
        score[self.start as usize] = Some(0);

        for &u in &order {
            let Some(su) = score[u as usize] else { continue };
            for &id in &self.nodes[u as usize].out_links {
                let link = &self.links[id as usize];
                if !link.alive {
                    continue;
                }
                let s = su + self.path_score(link) as i64;
                let to = link.to as usize;
                if score[to].map_or(true, |best| s > best) {
                    score[to] = Some(s);
                    back[to] = Some(id);
                }
            }
        }

        let finish = self.lexicon.dictionary().finish_word();
        let reached: Vec<NodeId> = order
            .iter()
            .copied()
            .filter(|&id| id != self.start && score[id as usize].is_some())
            .collect();
        let pick = |ids: &mut dyn Iterator<Item = NodeId>| {
            let mut best: Option<(NodeId, i64)> = None;
            for id in ids {
                let s = score[id as usize].unwrap_or(i64::MIN);
                if best.map_or(true, |(_, b)| s > b) {
                    best = Some((id, s));
                }
            }
            best
        };
        let mut finals = reached.iter().copied().filter(|&id| {
            self.context(self.nodes[id as usize].state).last() == Some(&finish)
        });
        let (end, total) = match pick(&mut finals) {
            Some(best) => best,
            None => {
                let last = reached
                    .iter()
                    .map(|&id| self.nodes[id as usize].frame)
                    .max()?;
                let mut at_last = reached
                    .iter()
                    .copied()
                    .filter(|&id| self.nodes[id as usize].frame == last);
                pick(&mut at_last)?
            }
        };

        let mut links = Vec::new();
        let mut node = end;
        while let Some(id) = back[node as usize] {
            links.push(id);
            node = self.links[id as usize].from;
        }
        links.reverse();
        Some(BestPath {
            links,
            end,
            score: total,
        })
    }

    /// Hypothesis along a path.
    pub fn hypothesis(&self, path: &BestPath) -> Hypothesis {
        let dict = self.lexicon.dictionary();
        let spell = |w: WordId| dict.word_str(w).unwrap_or("<unk>").to_string();
        let (start, finish) = (dict.start_word(), dict.finish_word());
        let mut words = Vec::new();
        let mut segments = Vec::with_capacity(path.links.len());
        for &id in &path.links {
            let link = &self.links[id as usize];
            let from = &self.nodes[link.from as usize];
            let to = &self.nodes[link.to as usize];
            if link.word != start && link.word != finish && !self.lexicon.is_filler(link.word) {
                words.push(spell(link.word));
            }
            segments.push(Segment {
                word: spell(link.word),
                word_id: link.word,
                start_frame: from.frame,
                end_frame: to.frame.saturating_sub(1),
                ascr: link.ascr,
                lscr: self.path_score(link).saturating_sub(link.ascr),
            });
        }
        Hypothesis {
            text: words.join(" "),
            words,
            score: path.score,
            segments,
        }
    }

    /// Link posteriors by forward-backward, relative to paths ending at `end`.
    pub fn posteriors(&self, end: NodeId) -> Vec<i32> {
        let order = self.ordered_nodes();
        let mut alpha = vec![WORST_SCORE; self.nodes.len()];
        let mut beta = vec![WORST_SCORE; self.nodes.len()];
        alpha[self.start as usize] = 0;
        beta[end as usize] = 0;

        for &u in &order {
            let a = alpha[u as usize];
            if a <= WORST_SCORE {
                continue;
            }
            for &id in &self.nodes[u as usize].out_links {
                let link = &self.links[id as usize];
                if link.alive {
                    let to = link.to as usize;
                    alpha[to] = self.logmath.add(alpha[to], log_mul(a, self.path_score(link)));
                }
            }
        }
        for &u in order.iter().rev() {
            for &id in &self.nodes[u as usize].out_links {
                let link = &self.links[id as usize];
                let b = beta[link.to as usize];
                if link.alive && b > WORST_SCORE {
                    beta[u as usize] =
                        self.logmath.add(beta[u as usize], log_mul(self.path_score(link), b));
                }
            }
        }

        let total = alpha[end as usize];
        self.links
            .iter()
            .map(|link| {
                let (a, b) = (alpha[link.from as usize], beta[link.to as usize]);
                if !link.alive || a <= WORST_SCORE || b <= WORST_SCORE || total <= WORST_SCORE {
                    return WORST_SCORE;
                }
                let joint = log_mul(log_mul(a, self.path_score(link)), b);
                joint.saturating_sub(total).min(0)
            })
            .collect()
    }

    /// Dense, serializable copy of the live lattice.
    pub fn export(&self, end: Option<NodeId>) -> LatticeExport {
        let dict = self.lexicon.dictionary();
        let spell = |w: WordId| dict.word_str(w).unwrap_or("<unk>").to_string();
        let mut renumber = vec![usize::MAX; self.nodes.len()];
        let mut nodes = Vec::new();
        for (id, node) in self.nodes() {
            renumber[id as usize] = nodes.len();
            nodes.push(ExportNode {
                id: nodes.len(),
                frame: node.frame,
                context: self.context(node.state).iter().map(|&w| spell(w)).collect(),
            });
        }
        let posteriors = end.map(|e| self.posteriors(e));
        let links = self
            .links()
            .map(|(id, link)| {
                let posterior = posteriors
                    .as_ref()
                    .map_or(0.0, |p| self.logmath.exp(p[id as usize]).min(1.0));
                ExportLink {
                    from: renumber[link.from as usize],
                    to: renumber[link.to as usize],
                    word: spell(link.word),
                    start_frame: self.nodes[link.from as usize].frame,
                    end_frame: self.nodes[link.to as usize].frame.saturating_sub(1),
                    ascr: link.ascr,
                    lscr: link.lscr,
                    posterior,
                }
            })
            .collect();
        LatticeExport {
            frames: self.n_frames(),
            start: renumber[self.start as usize],
            end: end.map(|e| renumber[e as usize]),
            nodes,
            links,
        }
    }
}

impl LatticeExport {
    /// Write the lattice in HTK Standard Lattice Format. Scores are converted
    /// to natural logarithms and node times to seconds.
    pub fn write_htk<W: Write>(&self, out: &mut W, logmath: &LogMath, frame_rate: u32) -> Result<()> {
        let rate = f64::from(frame_rate.max(1));
        writeln!(out, "# Lattice generated by amira-multipass-decoder")?;
        writeln!(out, "VERSION=1.0")?;
        writeln!(out, "start={}", self.start)?;
        if let Some(end) = self.end {
            writeln!(out, "end={}", end)?;
        }
        writeln!(out, "N={}\tL={}", self.nodes.len(), self.links.len())?;
        for node in &self.nodes {
            write!(out, "I={}\tt={:.2}", node.id, node.frame as f64 / rate)?;
            if let Some(word) = node.context.last() {
                write!(out, "\tW={}", htk_word(word))?;
            }
            writeln!(out)?;
        }
        for (j, link) in self.links.iter().enumerate() {
            write!(
                out,
                "J={}\tS={}\tE={}\ta={:.6}\tW={}",
                j,
                link.from,
                link.to,
                logmath.to_ln(link.ascr),
                htk_word(&link.word)
            )?;
            if link.lscr > WORST_SCORE {
                write!(out, "\tl={:.6}", logmath.to_ln(link.lscr))?;
            }
            if link.posterior > 0.0 {
                write!(out, "\tp={}", link.posterior)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Write the lattice as a Graphviz digraph.
    pub fn write_dot<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "digraph lattice {{")?;
        writeln!(out, "\trankdir=LR;")?;
        writeln!(out, "\tnode [shape=circle];")?;
        for node in &self.nodes {
            let label = node.context.last().map_or("&epsilon;", String::as_str);
            let shape = if Some(node.id) == self.end || node.id == self.start {
                " shape=doublecircle"
            } else {
                ""
            };
            writeln!(out, "\t{} [label=\"{}/{}\"{}];", node.id, label, node.frame, shape)?;
        }
        for link in &self.links {
            writeln!(
                out,
                "\t{} -> {} [label=\"{}/{}\"];",
                link.from, link.to, link.word, link.ascr
            )?;
        }
        writeln!(out, "}}")?;
        Ok(())
    }
}

fn htk_word(word: &str) -> &str {
    match word {
        START_WORD => HTK_SENT_START,
        FINISH_WORD => HTK_SENT_END,
        w => w,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lexicon::tests::toy_lexicon;
    use crate::search::fwdtree::tests::toy_lm;

    fn lattice() -> (Lattice, impl Fn(&str) -> WordId) {
        let lex = Arc::new(toy_lexicon());
        let lm: Arc<dyn LanguageModel> = Arc::new(toy_lm(&lex));
        let logmath = *lex.acoustic_model().logmath();
        let penalties = Penalties::new(&logmath, 9.5, 0.65, 0.005, 1e-8);
        let dict = Arc::clone(lex.dictionary());
        let id = move |w: &str| dict.word_id(w).unwrap();
        (Lattice::new(lex, lm, penalties), id)
    }

    fn arc(src: usize, dest: usize, word: WordId, score: i32) -> WordArc {
        WordArc {
            src_frame: src,
            dest_frame: dest,
            word,
            score,
        }
    }

    #[test]
    fn test_same_arc_twice_adds_nothing() {
        let (mut lat, id) = lattice();
        assert!(lat.add_arc(&arc(0, 2, id("<s>"), -100)).unwrap());
        let (nodes, links) = (lat.nodes().count(), lat.links().count());
        assert!(lat.add_arc(&arc(0, 2, id("<s>"), -100)).unwrap());
        assert_eq!(lat.nodes().count(), nodes);
        assert_eq!(lat.links().count(), links);

        // A better copy only raises the score.
        lat.add_arc(&arc(0, 2, id("<s>"), -50)).unwrap();
        assert_eq!(lat.links().count(), links);
        assert_eq!(lat.links().next().unwrap().1.ascr, -50);
    }

    #[test]
    fn test_contexts_resolve_per_predecessor() {
        let (mut lat, id) = lattice();
        lat.add_arc(&arc(0, 2, id("<s>"), -100)).unwrap();
        lat.add_arc(&arc(3, 5, id("a"), -300)).unwrap();
        lat.add_arc(&arc(3, 5, id("<sil>"), -300)).unwrap();
        lat.add_arc(&arc(6, 8, id("cat"), -200)).unwrap();
        lat.finish();

        // Frame 6 is reached through `a` and through a filler, which leaves
        // the `<s>` context alone. A bigram model keeps one word of context.
        let states: Vec<Vec<WordId>> = lat
            .nodes()
            .filter(|(_, n)| n.frame == 6)
            .map(|(_, n)| lat.context(n.state).to_vec())
            .collect();
        assert_eq!(states.len(), 2);
        assert!(states.contains(&vec![id("a")]));
        assert!(states.contains(&vec![id("<s>")]));
        // One `cat` link leaves each of them.
        assert_eq!(lat.links().filter(|(_, l)| l.word == id("cat")).count(), 2);
        assert!(lat
            .nodes()
            .all(|(_, n)| n.state != LmStateId::INCOMPLETE));
    }

    #[test]
    fn test_unreachable_arcs_are_dropped() {
        let (mut lat, id) = lattice();
        lat.add_arc(&arc(0, 2, id("<s>"), -100)).unwrap();
        assert!(!lat.add_arc(&arc(5, 7, id("cat"), -100)).unwrap());
        assert_eq!(lat.dropped(), 1);
        assert!(lat.add_arc(&arc(1, 0, id("cat"), 0)).is_err());
    }

    #[test]
    fn test_arcs_out_of_order_rejected() {
        let (mut lat, id) = lattice();
        lat.add_arc(&arc(0, 2, id("<s>"), -100)).unwrap();
        lat.add_arc(&arc(3, 5, id("cat"), -100)).unwrap();
        assert!(matches!(
            lat.add_arc(&arc(0, 4, id("<s>"), -100)),
            Err(DecoderError::InvalidState(_))
        ));
    }

    #[test]
    fn test_best_path_prefers_acoustics_and_lm() {
        let (mut lat, id) = lattice();
        lat.add_arc(&arc(0, 2, id("<s>"), -100)).unwrap();
        lat.add_arc(&arc(3, 11, id("cat"), -1000)).unwrap();
        lat.add_arc(&arc(3, 11, id("cad"), -90_000)).unwrap();
        lat.add_arc(&arc(12, 14, id("</s>"), -100)).unwrap();
        lat.finish();

        let path = lat.best_path().unwrap();
        let hyp = lat.hypothesis(&path);
        assert_eq!(hyp.words, vec!["cat".to_string()]);
        assert_eq!(hyp.segments.len(), 3);
        assert_eq!(hyp.segments[1].start_frame, 3);
        assert_eq!(hyp.segments[1].end_frame, 11);
        assert_eq!(hyp.segments[1].ascr, -1000);
        assert_eq!(lat.nodes[path.end as usize].frame, 15);

        let export = lat.export(Some(path.end));
        assert_eq!(export.frames, 15);
        assert_eq!(export.end, Some(export.nodes.len() - 1));
        let posterior = |w: &str| {
            export
                .links
                .iter()
                .find(|l| l.word == w)
                .map(|l| l.posterior)
                .unwrap()
        };
        assert!(posterior("cat") > 0.99);
        assert!(posterior("cad") < 0.01);
        assert!((posterior("<s>") - 1.0).abs() < 1e-3);
        let json = serde_json::to_string(&export).unwrap();
        let back: LatticeExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, export);
    }

    #[test]
    fn test_best_path_without_finish_ends_at_last_frame() {
        let (mut lat, id) = lattice();
        lat.add_arc(&arc(0, 2, id("<s>"), -100)).unwrap();
        lat.add_arc(&arc(3, 4, id("a"), -100)).unwrap();
        lat.add_arc(&arc(3, 9, id("cat"), -100)).unwrap();
        lat.finish();
        let path = lat.best_path().unwrap();
        assert_eq!(lat.hypothesis(&path).text, "cat");
    }

    #[test]
    fn test_dead_ends_are_unlinked() {
        let (mut lat, id) = lattice();
        lat.add_arc(&arc(0, 2, id("<s>"), -100)).unwrap();
        lat.add_arc(&arc(3, 6, id("a"), -300)).unwrap();
        lat.add_arc(&arc(3, 11, id("cat"), -1000)).unwrap();
        lat.add_arc(&arc(12, 14, id("</s>"), -100)).unwrap();
        lat.finish();
        assert_eq!(lat.nodes().count(), 5);

        let path = lat.best_path().unwrap();
        assert_eq!(lat.unlink_unreachable(path.end), 1);
        assert_eq!(lat.nodes().count(), 4);
        assert!(lat.nodes().all(|(_, n)| n.frame != 7));
        assert!(lat.links().all(|(_, l)| l.word != id("a")));
        // Nothing left to remove, and the path is untouched.
        assert_eq!(lat.unlink_unreachable(path.end), 0);
        assert_eq!(lat.hypothesis(&path).text, "cat");

        let export = lat.export(Some(path.end));
        assert_eq!(export.nodes.len(), 4);
        assert_eq!(export.links.len(), 3);
        assert!(export.links.iter().all(|l| l.posterior > 0.99));
    }

    fn small_export() -> LatticeExport {
        let node = |id: usize, frame: usize, context: &[&str]| ExportNode {
            id,
            frame,
            context: context.iter().map(|w| w.to_string()).collect(),
        };
        let link = |from: usize, to: usize, word: &str, ascr: i32, lscr: i32, posterior: f64| ExportLink {
            from,
            to,
            word: word.to_string(),
            start_frame: 0,
            end_frame: 0,
            ascr,
            lscr,
            posterior,
        };
        LatticeExport {
            frames: 15,
            start: 0,
            end: Some(3),
            nodes: vec![
                node(0, 0, &[]),
                node(1, 3, &["<s>"]),
                node(2, 12, &["cat"]),
                node(3, 15, &["</s>"]),
            ],
            links: vec![
                link(0, 1, "<s>", -100, 0, 1.0),
                link(1, 2, "cat", -5000, -3000, 0.25),
                link(2, 3, "</s>", -100, WORST_SCORE, 0.0),
            ],
        }
    }

    #[test]
    fn test_write_htk() {
        let mut out = Vec::new();
        small_export()
            .write_htk(&mut out, &LogMath::default(), 100)
            .unwrap();
        let expected = "\
# Lattice generated by amira-multipass-decoder
VERSION=1.0
start=0
end=3
N=4\tL=3
I=0\tt=0.00
I=1\tt=0.03\tW=!SENT_START
I=2\tt=0.12\tW=cat
I=3\tt=0.15\tW=!SENT_END
J=0\tS=0\tE=1\ta=-0.010000\tW=!SENT_START\tl=0.000000\tp=1
J=1\tS=1\tE=2\ta=-0.499975\tW=cat\tl=-0.299985\tp=0.25
J=2\tS=2\tE=3\ta=-0.010000\tW=!SENT_END
";
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn test_write_dot() {
        let mut out = Vec::new();
        small_export().write_dot(&mut out).unwrap();
        let dot = String::from_utf8(out).unwrap();
        assert!(dot.starts_with("digraph lattice {"));
        assert!(dot.contains("\t0 [label=\"&epsilon;/0\" shape=doublecircle];"));
        assert!(dot.contains("\t2 [label=\"cat/12\"];"));
        assert!(dot.contains("\t1 -> 2 [label=\"cat/-5000\"];"));
        assert!(dot.trim_end().ends_with('}'));
    }
}
