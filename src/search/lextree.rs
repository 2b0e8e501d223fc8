//! Lexical prefix tree for the first pass.
//!
//! Words sharing leading phones share HMMs. Roots are keyed by the first two
//! phones and multiplexed over the previous word's last phone. Internal nodes
//! are keyed by parent, phone and senone sequence. A word's last phone hangs
//! off its penultimate node as one channel per right-context class. Single-phone
//! words and fillers have standalone channels.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{DecoderError, Result};
use crate::hmm::evaluator::Hmm;
use crate::model::lexicon::Lexicon;
use crate::model::lm::LanguageModel;
use crate::types::{PhoneId, WordId};

/// Index of a tree node.
pub type NodeId = u32;

/// Role of a node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// First phone of multi-phone words; `second` is the next phone.
    Root { second: PhoneId },
    /// Word-internal phone.
    Internal,
    /// Last phone of `word` in right-context class `rc`.
    Last { word: WordId, rc: u16 },
    /// Whole single-phone word or filler.
    Single { word: WordId },
}

/// Last-phone channels of one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordChannels {
    /// The word.
    pub word: WordId,
    /// First channel node; channels are consecutive.
    pub first: NodeId,
    /// Number of channels.
    pub n_rc: u16,
}

/// One tree node.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// HMM of the node's phone.
    pub hmm: Hmm,
    /// Phone.
    pub phone: PhoneId,
    /// Role.
    pub kind: NodeKind,
    /// Internal successors.
    pub children: Vec<NodeId>,
    /// Words whose last phone follows this node.
    pub words: Vec<WordChannels>,
}

/// The prefix tree.
#[derive(Debug)]
pub struct LexTree {
    nodes: Vec<TreeNode>,
    roots_by_phone: Vec<Vec<NodeId>>,
    singles: Vec<NodeId>,
    start: NodeId,
    n_roots: usize,
    n_internal: usize,
}

impl LexTree {
    /// Build the tree over every dictionary word the language model knows.
    /// Fillers are always included; `<s>` gets its own start channel.
    pub fn build(lexicon: &Lexicon, lm: &dyn LanguageModel) -> Result<Self> {
        let dict = lexicon.dictionary();
        let am = lexicon.acoustic_model();
        let n_emit = am.n_emit_state();
        let sil = lexicon.silence_phone();

        let mut nodes: Vec<TreeNode> = Vec::new();
        let mut roots: HashMap<(PhoneId, PhoneId), NodeId> = HashMap::new();
        let mut internal: HashMap<(NodeId, PhoneId, u32), NodeId> = HashMap::new();
        let mut roots_by_phone = vec![Vec::new(); am.n_phone()];
        let mut singles = Vec::new();
        let mut skipped = 0usize;

        let push = |nodes: &mut Vec<TreeNode>, hmm: Hmm, phone: PhoneId, kind: NodeKind| {
            nodes.push(TreeNode {
                hmm,
                phone,
                kind,
                children: Vec::new(),
                words: Vec::new(),
            });
            (nodes.len() - 1) as NodeId
        };

        let start_word = dict.start_word();
        let start_phone = lexicon.pronunciation(start_word)[0];
        let start = push(
            &mut nodes,
            Hmm::new(n_emit, lexicon.single_ssid(start_word), lexicon.tmat(start_phone)),
            start_phone,
            NodeKind::Single { word: start_word },
        );

        for w in 0..lexicon.n_words() {
            let word = WordId(w as u32);
            if word == start_word {
                continue;
            }
            let filler = lexicon.is_filler(word);
            if !filler && !lm.contains(word) {
                warn!(word = dict.word_str(word).unwrap_or("?"), "Word not in language model, left out of the tree");
                skipped += 1;
                continue;
            }
            let pron = lexicon.pronunciation(word);
            if filler || pron.len() == 1 {
                let id = push(
                    &mut nodes,
                    Hmm::new(n_emit, lexicon.single_ssid(word), lexicon.tmat(pron[0])),
                    pron[0],
                    NodeKind::Single { word },
                );
                singles.push(id);
                continue;
            }

            let (p0, p1) = (pron[0], pron[1]);
            let mut parent = match roots.get(&(p0, p1)).copied() {
                Some(id) => id,
                None => {
                    let hmm = Hmm::new_multiplexed(
                        n_emit,
                        lexicon.first_ssid(p0, sil, p1),
                        lexicon.tmat(p0),
                    );
                    let id = push(&mut nodes, hmm, p0, NodeKind::Root { second: p1 });
                    roots.insert((p0, p1), id);
                    roots_by_phone[p0.index()].push(id);
                    id
                }
            };

            let last = pron.len() - 1;
            for d in 1..last {
                let ssid = lexicon.internal_ssid(pron[d - 1], pron[d], pron[d + 1]);
                let key = (parent, pron[d], ssid.0);
                parent = match internal.get(&key).copied() {
                    Some(id) => id,
                    None => {
                        let hmm = Hmm::new(n_emit, ssid, lexicon.tmat(pron[d]));
                        let id = push(&mut nodes, hmm, pron[d], NodeKind::Internal);
                        nodes[parent as usize].children.push(id);
                        internal.insert(key, id);
                        id
                    }
                };
            }

            let n_rc = lexicon.n_rc(word);
            let first = nodes.len() as NodeId;
            for rc in 0..n_rc {
                let hmm = Hmm::new(
                    n_emit,
                    lexicon.last_phone_ssid(word, rc),
                    lexicon.tmat(pron[last]),
                );
                push(
                    &mut nodes,
                    hmm,
                    pron[last],
                    NodeKind::Last {
                        word,
                        rc: rc as u16,
                    },
                );
            }
            nodes[parent as usize].words.push(WordChannels {
                word,
                first,
                n_rc: n_rc as u16,
            });
        }

        if nodes.len() >= u32::MAX as usize {
            return Err(DecoderError::Model(format!(
                "lexical tree has too many nodes ({})",
                nodes.len()
            )));
        }

        debug!(
            nodes = nodes.len(),
            roots = roots.len(),
            internal = internal.len(),
            singles = singles.len(),
            skipped,
            "Built lexical tree"
        );

        Ok(Self {
            nodes,
            roots_by_phone,
            singles,
            start,
            n_roots: roots.len(),
            n_internal: internal.len(),
        })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id as usize]
    }

    /// Mutable node by id.
    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id as usize]
    }

    /// Roots whose first phone is `phone`.
    pub fn roots_for(&self, phone: PhoneId) -> &[NodeId] {
        self.roots_by_phone
            .get(phone.index())
            .map_or(&[][..], |r| &r[..])
    }

    /// Standalone channels, `<s>` excluded.
    pub fn singles(&self) -> &[NodeId] {
        &self.singles
    }

    /// Channel of the utterance start marker.
    pub fn start_node(&self) -> NodeId {
        self.start
    }

    /// Number of root nodes.
    pub fn n_roots(&self) -> usize {
        self.n_roots
    }

    /// Number of internal nodes.
    pub fn n_internal(&self) -> usize {
        self.n_internal
    }

    /// Reset every HMM.
    pub fn clear(&mut self) {
        for node in &mut self.nodes {
            node.hmm.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::logmath::LogMath;
    use crate::model::lexicon::tests::toy_lexicon;
    use crate::model::lm::BackoffNgramModel;

    fn lm_for(lex: &Lexicon, words: &[&str]) -> BackoffNgramModel {
        let mut lm = BackoffNgramModel::new(LogMath::default());
        let dict = lex.dictionary();
        for w in words {
            lm.add_unigram(dict.word_id(w).unwrap(), -1.0, 0.0);
        }
        lm
    }

    #[test]
    fn test_tree_shares_prefixes() {
        let lex = toy_lexicon();
        let lm = lm_for(&lex, &["<s>", "</s>", "cat", "cad", "a"]);
        let tree = LexTree::build(&lex, &lm).unwrap();
        let am = lex.acoustic_model();
        let k = am.phone_id("K").unwrap();
        let dict = lex.dictionary();

        assert_eq!(tree.n_roots(), 1);
        assert_eq!(tree.n_internal(), 1);
        // start + root + internal + 3 cat channels + 1 cad channel + a, <sil>, </s>
        assert_eq!(tree.len(), 10);
        assert_eq!(tree.singles().len(), 3);

        let root = tree.roots_for(k)[0];
        assert!(tree.node(root).hmm.is_multiplexed());
        let ae = tree.node(root).children[0];
        let words = &tree.node(ae).words;
        assert_eq!(words.len(), 2);
        let cat = words
            .iter()
            .find(|c| c.word == dict.word_id("cat").unwrap())
            .unwrap();
        assert_eq!(cat.n_rc, 3);
        for rc in 0..cat.n_rc {
            let node = tree.node(cat.first + rc as u32);
            assert_eq!(node.kind, NodeKind::Last { word: cat.word, rc });
        }
        assert_eq!(
            tree.node(tree.start_node()).kind,
            NodeKind::Single {
                word: dict.start_word()
            }
        );
    }

    #[test]
    fn test_words_outside_lm_are_left_out() {
        let lex = toy_lexicon();
        let lm = lm_for(&lex, &["<s>", "</s>", "cat"]);
        let tree = LexTree::build(&lex, &lm).unwrap();
        // start + root + internal + 3 cat channels + <sil>, </s>
        assert_eq!(tree.len(), 8);
        let dict = lex.dictionary();
        assert!(tree.singles().iter().all(|&n| match tree.node(n).kind {
            NodeKind::Single { word } => word != dict.word_id("a").unwrap(),
            _ => false,
        }));
    }
}
