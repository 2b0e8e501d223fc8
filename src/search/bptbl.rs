//! Backpointer table: the word-exit log of a search pass.
//!
//! Each entry records the best way to end a word in a frame. Entries reference
//! their predecessor by index, and indices stay valid as the table grows, so
//! HMM histories and arc producers can hold them across frames. Right-context
//! scores of an entry live in a shared score stack.

use std::ops::Range;
use std::sync::Arc;

use crate::constants::score::WORST_SCORE;
use crate::error::{DecoderError, Result};
use crate::model::lexicon::Lexicon;
use crate::search::grow_for;
use crate::types::{BpIdx, WordId};

/// One word exit.
#[derive(Debug, Clone, PartialEq)]
pub struct BpEntry {
    /// Word that ended.
    pub word: WordId,
    /// Frame in which it ended.
    pub frame: usize,
    /// First frame of the word.
    pub start_frame: usize,
    /// Previous word exit, `None` at utterance start.
    pub prev: Option<BpIdx>,
    /// Best path score over all right contexts.
    pub score: i32,
    /// Offset of this entry's right-context scores in the score stack.
    pub s_idx: usize,
    /// Number of right-context classes.
    pub n_rc: u16,
    /// Last non-filler word of the path.
    pub real_word: WordId,
    /// Non-filler word before `real_word`.
    pub prev_real_word: Option<WordId>,
}

/// Append-only backpointer table with per-frame indexing.
pub struct BackpointerTable {
    lexicon: Arc<Lexicon>,
    entries: Vec<BpEntry>,
    score_stack: Vec<i32>,
    frame_start: Vec<usize>,
    word_latest: Vec<Option<BpIdx>>,
    rescale: Vec<(usize, i64)>,
}

impl std::fmt::Debug for BackpointerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpointerTable")
            .field("entries", &self.entries.len())
            .field("frames", &self.frame_start.len())
            .field("score_stack", &self.score_stack.len())
            .finish()
    }
}

impl BackpointerTable {
    /// Create a table sized for `initial` entries.
    pub fn new(lexicon: Arc<Lexicon>, initial: usize) -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(initial)
            .map_err(|e| DecoderError::growth("backpointer table", initial, e))?;
        let mut score_stack = Vec::new();
        let stack_initial = initial * 4;
        score_stack
            .try_reserve_exact(stack_initial)
            .map_err(|e| DecoderError::growth("score stack", stack_initial, e))?;
        let n_words = lexicon.n_words();
        Ok(Self {
            lexicon,
            entries,
            score_stack,
            frame_start: Vec::new(),
            word_latest: vec![None; n_words],
            rescale: Vec::new(),
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of frames begun.
    pub fn n_frames(&self) -> usize {
        self.frame_start.len()
    }

    /// Start collecting exits for `frame`. Frames must be begun in order.
    pub fn begin_frame(&mut self, frame: usize) -> Result<()> {
        if frame != self.frame_start.len() {
            return Err(DecoderError::InvalidState(format!(
                "backpointer frame {} begun after frame {}",
                frame,
                self.frame_start.len() as isize - 1
            )));
        }
        grow_for(&mut self.frame_start, 1, "backpointer frame index")?;
        self.frame_start.push(self.entries.len());
        Ok(())
    }

    fn current_frame(&self) -> Result<usize> {
        self.frame_start
            .len()
            .checked_sub(1)
            .ok_or_else(|| DecoderError::InvalidState("no backpointer frame begun".to_string()))
    }

    /// Record that `word` ends in the current frame with `score` in right-context
    /// class `rc`, reached from `prev`.
    ///
    /// A word has at most one entry per frame. A later exit of the same word
    /// raises the entry's score and, only if the predecessor actually changes,
    /// relinks it and refreshes its cached language-model context.
    pub fn save_entry(
        &mut self,
        word: WordId,
        score: i32,
        prev: Option<BpIdx>,
        rc: usize,
    ) -> Result<BpIdx> {
        let frame = self.current_frame()?;
        if let Some(p) = prev {
            if p.index() >= self.entries.len() {
                return Err(DecoderError::InvalidState(format!(
                    "predecessor {} does not exist",
                    p
                )));
            }
        }

        if let Some(idx) = self.word_latest.get(word.index()).copied().flatten() {
            if self.entries[idx.index()].frame == frame {
                if prev.map_or(false, |p| p >= idx) {
                    return Err(DecoderError::InvalidState(format!(
                        "{} cannot precede {}",
                        prev.map_or(String::new(), |p| p.to_string()),
                        idx
                    )));
                }
                let entry = &mut self.entries[idx.index()];
                if score > entry.score {
                    let relink = entry.prev != prev;
                    entry.score = score;
                    if relink {
                        entry.prev = prev;
                        self.recache_from(idx);
                    }
                }
                let entry = &self.entries[idx.index()];
                let slot = entry.s_idx + rc.min(entry.n_rc as usize - 1);
                if score > self.score_stack[slot] {
                    self.score_stack[slot] = score;
                }
                return Ok(idx);
            }
        }

        let n_rc = self.lexicon.n_rc(word).max(1);
        grow_for(&mut self.entries, 1, "backpointer table")?;
        grow_for(&mut self.score_stack, n_rc, "score stack")?;

        let idx = BpIdx(self.entries.len() as u32);
        let s_idx = self.score_stack.len();
        self.score_stack.resize(s_idx + n_rc, WORST_SCORE);
        self.score_stack[s_idx + rc.min(n_rc - 1)] = score;
        self.entries.push(BpEntry {
            word,
            frame,
            start_frame: 0,
            prev,
            score,
            s_idx,
            n_rc: n_rc as u16,
            real_word: word,
            prev_real_word: None,
        });
        self.cache_paths(idx);
        if let Some(slot) = self.word_latest.get_mut(word.index()) {
            *slot = Some(idx);
        }
        Ok(idx)
    }

    /// Refresh a relinked entry and every later entry of its frame that
    /// descends from it. A filler passes its context on, so dependents of a
    /// relinked filler would otherwise keep the old one.
    fn recache_from(&mut self, idx: BpIdx) {
        self.cache_paths(idx);
        let mut changed = vec![idx];
        for j in idx.index() + 1..self.entries.len() {
            if let Some(p) = self.entries[j].prev {
                if changed.contains(&p) {
                    let j = BpIdx(j as u32);
                    self.cache_paths(j);
                    changed.push(j);
                }
            }
        }
    }

    /// Refresh the start frame and language-model context of an entry.
    fn cache_paths(&mut self, idx: BpIdx) {
        let (word, prev) = {
            let e = &self.entries[idx.index()];
            (e.word, e.prev)
        };
        let (start_frame, real_word, prev_real_word) = match prev {
            None => {
                let real = if self.lexicon.is_filler(word) {
                    self.lexicon.dictionary().start_word()
                } else {
                    word
                };
                (0, real, None)
            }
            Some(p) => {
                let pe = &self.entries[p.index()];
                if self.lexicon.is_filler(word) {
                    (pe.frame + 1, pe.real_word, pe.prev_real_word)
                } else {
                    (pe.frame + 1, word, Some(pe.real_word))
                }
            }
        };
        let e = &mut self.entries[idx.index()];
        e.start_frame = start_frame;
        e.real_word = real_word;
        e.prev_real_word = prev_real_word;
    }

    /// Entry by index.
    pub fn get(&self, idx: BpIdx) -> Option<&BpEntry> {
        self.entries.get(idx.index())
    }

    /// All entries in creation order.
    pub fn entries(&self) -> &[BpEntry] {
        &self.entries
    }

    /// Path score of an entry in right-context class `rc`.
    pub fn rc_score(&self, idx: BpIdx, rc: usize) -> i32 {
        match self.entries.get(idx.index()) {
            Some(e) => self.score_stack[e.s_idx + rc.min(e.n_rc as usize - 1)],
            None => WORST_SCORE,
        }
    }

    /// Index range of the entries ending in `frame`.
    pub fn frame_entries(&self, frame: usize) -> Range<usize> {
        let Some(&start) = self.frame_start.get(frame) else {
            return 0..0;
        };
        let end = self
            .frame_start
            .get(frame + 1)
            .copied()
            .unwrap_or(self.entries.len());
        start..end
    }

    /// Best exit at or before `frame`, scanning back to the latest non-empty
    /// frame. With `prefer`, an exit of that word wins over better scores.
    pub fn find_best_exit(&self, frame: usize, prefer: Option<WordId>) -> Option<BpIdx> {
        let last = frame.min(self.frame_start.len().checked_sub(1)?);
        for f in (0..=last).rev() {
            let range = self.frame_entries(f);
            if range.is_empty() {
                continue;
            }
            if let Some(word) = prefer {
                if let Some(i) = range.clone().find(|&i| self.entries[i].word == word) {
                    return Some(BpIdx(i as u32));
                }
            }
            let mut best = range.start;
            for i in range {
                if self.entries[i].score > self.entries[best].score {
                    best = i;
                }
            }
            return Some(BpIdx(best as u32));
        }
        None
    }

    /// Entries on the path ending at `idx`, oldest first.
    pub fn backtrace(&self, idx: BpIdx) -> Vec<BpIdx> {
        let mut path = Vec::new();
        let mut cur = Some(idx);
        while let Some(i) = cur {
            let Some(e) = self.entries.get(i.index()) else {
                break;
            };
            path.push(i);
            if path.len() > self.entries.len() {
                break;
            }
            cur = e.prev;
        }
        path.reverse();
        path
    }

    /// Words on the path ending at `idx`, without fillers or sentence markers.
    pub fn reconstruct_hypothesis(&self, idx: BpIdx) -> Vec<WordId> {
        let dict = self.lexicon.dictionary();
        let (start, finish) = (dict.start_word(), dict.finish_word());
        self.backtrace(idx)
            .into_iter()
            .map(|i| self.entries[i.index()].word)
            .filter(|&w| w != start && w != finish && !dict.is_filler(w))
            .collect()
    }

    /// Note that every score from `frame` on has had `amount` subtracted.
    pub fn record_rescale(&mut self, frame: usize, amount: i32) {
        let total = self.rescale.last().map_or(0, |&(_, t)| t) + amount as i64;
        match self.rescale.last_mut() {
            Some(last) if last.0 == frame => last.1 = total,
            _ => self.rescale.push((frame, total)),
        }
    }

    /// Total amount subtracted from scores of `frame`.
    pub fn scale_at(&self, frame: usize) -> i64 {
        let pos = self.rescale.partition_point(|&(f, _)| f <= frame);
        if pos == 0 {
            0
        } else {
            self.rescale[pos - 1].1
        }
    }

    /// Entry score undoing all renormalization.
    pub fn absolute_score(&self, idx: BpIdx) -> i64 {
        match self.entries.get(idx.index()) {
            Some(e) => e.score as i64 + self.scale_at(e.frame),
            None => WORST_SCORE as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lexicon::tests::toy_lexicon;

    fn table() -> (BackpointerTable, Arc<Lexicon>) {
        let lex = Arc::new(toy_lexicon());
        (BackpointerTable::new(Arc::clone(&lex), 2).unwrap(), lex)
    }

    #[test]
    fn test_update_keeps_cached_context() {
        let (mut bp, lex) = table();
        let dict = lex.dictionary();
        let a = dict.word_id("cat").unwrap();
        let b = dict.word_id("a").unwrap();

        bp.begin_frame(0).unwrap();
        let ia = bp.save_entry(a, 10, None, 0).unwrap();
        let ib = bp.save_entry(b, 8, Some(ia), 0).unwrap();
        let ia2 = bp.save_entry(a, 12, None, 0).unwrap();

        assert_eq!(ia, ia2);
        assert_eq!(bp.len(), 2);
        assert_eq!(bp.get(ia).unwrap().score, 12);
        assert_eq!(bp.get(ib).unwrap().prev_real_word, Some(a));
        assert_eq!(bp.get(ib).unwrap().real_word, b);
    }

    #[test]
    fn test_lower_score_does_not_relink() {
        let (mut bp, lex) = table();
        let dict = lex.dictionary();
        let cat = dict.word_id("cat").unwrap();
        let cad = dict.word_id("cad").unwrap();
        let a = dict.word_id("a").unwrap();

        bp.begin_frame(0).unwrap();
        let p1 = bp.save_entry(cat, -5, None, 0).unwrap();
        let p2 = bp.save_entry(cad, -6, None, 0).unwrap();
        bp.begin_frame(1).unwrap();
        let e = bp.save_entry(a, -20, Some(p1), 0).unwrap();
        bp.save_entry(a, -30, Some(p2), 0).unwrap();
        assert_eq!(bp.get(e).unwrap().prev, Some(p1));
        assert_eq!(bp.get(e).unwrap().prev_real_word, Some(cat));
        bp.save_entry(a, -10, Some(p2), 0).unwrap();
        assert_eq!(bp.get(e).unwrap().prev, Some(p2));
        assert_eq!(bp.get(e).unwrap().prev_real_word, Some(cad));
    }

    #[test]
    fn test_relinked_filler_refreshes_dependents() {
        let (mut bp, lex) = table();
        let dict = lex.dictionary();
        let cat = dict.word_id("cat").unwrap();
        let cad = dict.word_id("cad").unwrap();
        let a = dict.word_id("a").unwrap();
        let sil = dict.silence_word();

        bp.begin_frame(0).unwrap();
        let p1 = bp.save_entry(cat, -5, None, 0).unwrap();
        let p2 = bp.save_entry(cad, -6, None, 0).unwrap();
        bp.begin_frame(1).unwrap();
        let s = bp.save_entry(sil, -20, Some(p1), 0).unwrap();
        let e = bp.save_entry(a, -25, Some(s), 0).unwrap();
        let late = bp.save_entry(cat, -30, Some(e), 0).unwrap();
        assert_eq!(bp.get(e).unwrap().prev_real_word, Some(cat));

        bp.save_entry(sil, -10, Some(p2), 0).unwrap();
        assert_eq!(bp.get(s).unwrap().real_word, cad);
        assert_eq!(bp.get(e).unwrap().prev_real_word, Some(cad));
        assert_eq!(bp.get(e).unwrap().real_word, a);
        assert_eq!(bp.get(late).unwrap().prev_real_word, Some(a));
        assert_eq!(bp.get(p1).unwrap().prev_real_word, None);
    }

    #[test]
    fn test_rc_scores_and_growth() {
        let (mut bp, lex) = table();
        let dict = lex.dictionary();
        let cat = dict.word_id("cat").unwrap();
        let n_rc = lex.n_rc(cat);
        assert!(n_rc > 1);

        let mut ids = Vec::new();
        for f in 0..50 {
            bp.begin_frame(f).unwrap();
            let prev = ids.last().copied();
            let id = bp.save_entry(cat, -(f as i32), prev, 0).unwrap();
            bp.save_entry(cat, -(f as i32) - 3, prev, 1).unwrap();
            ids.push(id);
        }
        // Indices issued before growth still resolve.
        assert_eq!(bp.get(ids[0]).unwrap().frame, 0);
        assert_eq!(bp.rc_score(ids[10], 0), -10);
        assert_eq!(bp.rc_score(ids[10], 1), -13);
        assert_eq!(bp.rc_score(ids[10], 2), WORST_SCORE);
        assert_eq!(bp.get(ids[49]).unwrap().start_frame, 49);
    }

    #[test]
    fn test_find_best_exit_scans_back() {
        let (mut bp, lex) = table();
        let dict = lex.dictionary();
        let cat = dict.word_id("cat").unwrap();
        let cad = dict.word_id("cad").unwrap();
        let fin = dict.finish_word();

        bp.begin_frame(0).unwrap();
        let c = bp.save_entry(cat, -10, None, 0).unwrap();
        let d = bp.save_entry(cad, -5, None, 0).unwrap();
        let f = bp.save_entry(fin, -50, None, 0).unwrap();
        bp.begin_frame(1).unwrap();
        bp.begin_frame(2).unwrap();

        assert_eq!(bp.find_best_exit(2, None), Some(d));
        assert_eq!(bp.find_best_exit(7, Some(fin)), Some(f));
        assert_ne!(bp.find_best_exit(0, None), Some(c));
    }

    #[test]
    fn test_hypothesis_skips_fillers_and_is_deterministic() {
        let (mut bp, lex) = table();
        let dict = lex.dictionary();
        let start = dict.start_word();
        let sil = dict.silence_word();
        let cat = dict.word_id("cat").unwrap();
        let a = dict.word_id("a").unwrap();

        let words = [start, cat, sil, a, dict.finish_word()];
        let mut prev = None;
        for (f, &w) in words.iter().enumerate() {
            bp.begin_frame(f).unwrap();
            prev = Some(bp.save_entry(w, -(f as i32) * 10, prev, 0).unwrap());
        }
        let last = prev.unwrap();
        let hyp = bp.reconstruct_hypothesis(last);
        assert_eq!(hyp, vec![cat, a]);
        assert_eq!(bp.reconstruct_hypothesis(last), hyp);

        // Filler inherits the language-model context of its predecessor.
        let sil_entry = bp.get(BpIdx(2)).unwrap();
        assert_eq!(sil_entry.real_word, cat);
        assert_eq!(sil_entry.prev_real_word, Some(start));
        assert_eq!(bp.get(BpIdx(3)).unwrap().prev_real_word, Some(cat));
    }

    #[test]
    fn test_backpointers_are_acyclic() {
        let (mut bp, lex) = table();
        let dict = lex.dictionary();
        let words: Vec<WordId> = ["cat", "cad", "a"]
            .iter()
            .map(|w| dict.word_id(w).unwrap())
            .collect();
        let n_frames = 30;
        for f in 0..n_frames {
            bp.begin_frame(f).unwrap();
            for (k, &w) in words.iter().enumerate() {
                let prev = if f == 0 {
                    None
                } else {
                    let r = bp.frame_entries(f - 1);
                    Some(BpIdx((r.start + (k + f) % r.len()) as u32))
                };
                bp.save_entry(w, -((f * 3 + k) as i32), prev, 0).unwrap();
            }
        }
        for i in 0..bp.len() {
            let mut steps = 0;
            let mut cur = Some(BpIdx(i as u32));
            while let Some(c) = cur {
                let e = bp.get(c).unwrap();
                if let Some(p) = e.prev {
                    assert!(p < c);
                }
                cur = e.prev;
                steps += 1;
                assert!(steps <= n_frames);
            }
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut bp, lex) = table();
        let dict = lex.dictionary();
        let cat = dict.word_id("cat").unwrap();
        let a = dict.word_id("a").unwrap();
        bp.begin_frame(0).unwrap();
        let ic = bp.save_entry(cat, -10, None, 0).unwrap();
        let ia = bp.save_entry(a, -10, Some(ic), 0).unwrap();
        assert!(bp.save_entry(cat, -1, Some(ia), 0).is_err());
        assert!(bp.save_entry(cat, -1, Some(BpIdx(99)), 0).is_err());
        assert!(bp.begin_frame(5).is_err());
    }

    #[test]
    fn test_rescale_restores_absolute_scores() {
        let (mut bp, lex) = table();
        let cat = lex.dictionary().word_id("cat").unwrap();
        let a = lex.dictionary().word_id("a").unwrap();

        bp.begin_frame(0).unwrap();
        let x = bp.save_entry(cat, -400, None, 0).unwrap();
        bp.begin_frame(1).unwrap();
        bp.record_rescale(1, -1000);
        let y = bp.save_entry(a, 300, Some(x), 0).unwrap();
        bp.begin_frame(2).unwrap();
        bp.record_rescale(2, -50);
        let z = bp.save_entry(cat, 20, Some(y), 0).unwrap();

        assert_eq!(bp.absolute_score(x), -400);
        assert_eq!(bp.absolute_score(y), -700);
        assert_eq!(bp.absolute_score(z), -1030);
        // Ordering by absolute score is preserved across rescaling.
        assert!(bp.absolute_score(x) > bp.absolute_score(y));
        assert!(bp.absolute_score(y) > bp.absolute_score(z));
    }
}
