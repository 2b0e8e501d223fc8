//! Phonetic context tables derived from the dictionary and acoustic model.
//!
//! A word's first phone depends on the previous word's last phone, and its last
//! phone on the next word's first phone. The first dependency is handled by
//! multiplexed HMMs; the second by fanning the last phone out over right-context
//! classes. Right-context phones mapping to the same senone sequence share a
//! class, and the class tables are shared by every word ending in the same
//! (left phone, last phone) pair.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{DecoderError, Result};
use crate::model::acoustic::AcousticModel;
use crate::model::dictionary::Dictionary;
use crate::types::{PhoneId, SenoneSeqId, TmatId, WordId};

/// Right-context classes of one (left phone, last phone) pair.
#[derive(Debug, Clone)]
pub struct RcFanout {
    ssids: Box<[SenoneSeqId]>,
    class_of: Box<[u16]>,
}

impl RcFanout {
    /// Senone sequence per class.
    pub fn ssids(&self) -> &[SenoneSeqId] {
        &self.ssids
    }

    /// Class of a following phone.
    pub fn class_of(&self, next: PhoneId) -> usize {
        self.class_of.get(next.index()).map_or(0, |&c| c as usize)
    }
}

/// Dictionary and acoustic model joined into search-ready context tables.
pub struct Lexicon {
    dict: Arc<dyn Dictionary>,
    am: Arc<AcousticModel>,
    fanouts: Vec<RcFanout>,
    word_fanout: Vec<Option<u32>>,
    silence_phone: PhoneId,
}

impl std::fmt::Debug for Lexicon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lexicon")
            .field("words", &self.dict.len())
            .field("fanouts", &self.fanouts.len())
            .finish()
    }
}

impl Lexicon {
    /// Build context tables for every dictionary word.
    pub fn new(dict: Arc<dyn Dictionary>, am: Arc<AcousticModel>) -> Result<Self> {
        let n_phone = am.n_phone();
        let mut fanouts = Vec::new();
        let mut shared: HashMap<(PhoneId, PhoneId), u32> = HashMap::new();
        let mut word_fanout = Vec::with_capacity(dict.len());

        for w in 0..dict.len() {
            let word = WordId(w as u32);
            let pron = dict.pronunciation(word);
            if pron.is_empty() {
                return Err(DecoderError::Model(format!("{} has no pronunciation", word)));
            }
            if let Some(bad) = pron.iter().find(|p| p.index() >= n_phone) {
                return Err(DecoderError::Model(format!(
                    "{} uses unknown {}",
                    dict.word_str(word).unwrap_or("?"),
                    bad
                )));
            }
            if dict.is_filler(word) || pron.len() < 2 {
                word_fanout.push(None);
                continue;
            }
            let last = pron[pron.len() - 1];
            let left = pron[pron.len() - 2];
            let idx = *shared.entry((left, last)).or_insert_with(|| {
                let mut ssids: Vec<SenoneSeqId> = Vec::new();
                let class_of = (0..n_phone)
                    .map(|r| {
                        let ssid = am.triphone_ssid(last, left, PhoneId(r as u16));
                        match ssids.iter().position(|&s| s == ssid) {
                            Some(c) => c as u16,
                            None => {
                                ssids.push(ssid);
                                (ssids.len() - 1) as u16
                            }
                        }
                    })
                    .collect();
                fanouts.push(RcFanout {
                    ssids: ssids.into_boxed_slice(),
                    class_of,
                });
                (fanouts.len() - 1) as u32
            });
            word_fanout.push(Some(idx));
        }

        let silence_phone = dict
            .pronunciation(dict.silence_word())
            .first()
            .copied()
            .ok_or_else(|| DecoderError::Model("silence word has no pronunciation".to_string()))?;

        debug!(
            words = dict.len(),
            fanouts = fanouts.len(),
            "Built right-context fan-out tables"
        );

        Ok(Self {
            dict,
            am,
            fanouts,
            word_fanout,
            silence_phone,
        })
    }

    /// The dictionary.
    pub fn dictionary(&self) -> &Arc<dyn Dictionary> {
        &self.dict
    }

    /// The acoustic model.
    pub fn acoustic_model(&self) -> &Arc<AcousticModel> {
        &self.am
    }

    /// Number of dictionary words.
    pub fn n_words(&self) -> usize {
        self.word_fanout.len()
    }

    /// Phone that silence and fillers present as context.
    pub fn silence_phone(&self) -> PhoneId {
        self.silence_phone
    }

    /// Whether a word is a filler.
    pub fn is_filler(&self, word: WordId) -> bool {
        self.dict.is_filler(word)
    }

    /// Phones of a word.
    pub fn pronunciation(&self, word: WordId) -> &[PhoneId] {
        self.dict.pronunciation(word)
    }

    /// Right-context fan-out of a word's last phone, `None` for fillers and
    /// single-phone words.
    pub fn fanout(&self, word: WordId) -> Option<&RcFanout> {
        self.word_fanout
            .get(word.index())
            .copied()
            .flatten()
            .map(|i| &self.fanouts[i as usize])
    }

    /// Number of right-context classes of a word (at least 1).
    pub fn n_rc(&self, word: WordId) -> usize {
        self.fanout(word).map_or(1, |f| f.ssids.len())
    }

    /// Right-context class of `word` when followed by a word starting with `next`.
    pub fn rc_class(&self, word: WordId, next: PhoneId) -> usize {
        self.fanout(word).map_or(0, |f| f.class_of(next))
    }

    /// Senone sequence of a word's last phone in right-context class `rc`.
    pub fn last_phone_ssid(&self, word: WordId, rc: usize) -> SenoneSeqId {
        match self.fanout(word) {
            Some(f) => f.ssids[rc.min(f.ssids.len() - 1)],
            None => self.ci_ssid_of_last(word),
        }
    }

    fn ci_ssid_of_last(&self, word: WordId) -> SenoneSeqId {
        let pron = self.dict.pronunciation(word);
        self.am.ci_ssid(pron[pron.len() - 1])
    }

    /// Phone a following word sees as its left context.
    pub fn left_context(&self, word: WordId) -> PhoneId {
        if self.dict.is_filler(word) {
            return self.silence_phone;
        }
        let pron = self.dict.pronunciation(word);
        pron.last().copied().unwrap_or(self.silence_phone)
    }

    /// Senone sequence of a multi-phone word's first phone after `left`.
    pub fn first_ssid(&self, first: PhoneId, left: PhoneId, second: PhoneId) -> SenoneSeqId {
        self.am.triphone_ssid(first, left, second)
    }

    /// Senone sequence of a word-internal phone.
    pub fn internal_ssid(&self, prev: PhoneId, phone: PhoneId, next: PhoneId) -> SenoneSeqId {
        self.am.triphone_ssid(phone, prev, next)
    }

    /// Senone sequence of a single-phone word or filler.
    pub fn single_ssid(&self, word: WordId) -> SenoneSeqId {
        self.ci_ssid_of_last(word)
    }

    /// Transition matrix of a phone.
    pub fn tmat(&self, phone: PhoneId) -> TmatId {
        self.am.tmat(phone)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hmm::logmath::LogMath;
    use crate::model::dictionary::PronouncingDictionary;

    /// Small lexicon: SIL, K, AE, T, D; words cat, cad, a.
    pub(crate) fn toy_lexicon() -> Lexicon {
        let mut b = AcousticModel::builder(3, LogMath::default());
        let t = b
            .add_tmat(&[
                vec![0.5, 0.4, 0.1, 0.0],
                vec![0.0, 0.5, 0.4, 0.1],
                vec![0.0, 0.0, 0.5, 0.5],
            ])
            .unwrap();
        let sil = b.add_phone("SIL", &[0, 1, 2], t, true).unwrap();
        let k = b.add_phone("K", &[3, 4, 5], t, false).unwrap();
        let ae = b.add_phone("AE", &[6, 7, 8], t, false).unwrap();
        let tt = b.add_phone("T", &[9, 10, 11], t, false).unwrap();
        let d = b.add_phone("D", &[12, 13, 14], t, false).unwrap();
        // T after AE differs before SIL and before K.
        b.add_triphone(tt, ae, sil, &[15, 16, 17]).unwrap();
        b.add_triphone(tt, ae, k, &[18, 19, 20]).unwrap();
        let am = Arc::new(b.build().unwrap());

        let mut dict = PronouncingDictionary::new(sil);
        dict.add_word("cat", &[k, ae, tt]).unwrap();
        dict.add_word("cad", &[k, ae, d]).unwrap();
        dict.add_word("a", &[ae]).unwrap();
        Lexicon::new(Arc::new(dict), am).unwrap()
    }

    #[test]
    fn test_rc_classes() {
        let lex = toy_lexicon();
        let dict = lex.dictionary().clone();
        let am = lex.acoustic_model().clone();
        let cat = dict.word_id("cat").unwrap();
        let cad = dict.word_id("cad").unwrap();
        let a = dict.word_id("a").unwrap();
        let sil = am.phone_id("SIL").unwrap();
        let k = am.phone_id("K").unwrap();
        let d = am.phone_id("D").unwrap();

        // CI class plus the two modelled contexts.
        assert_eq!(lex.n_rc(cat), 3);
        assert_ne!(lex.rc_class(cat, sil), lex.rc_class(cat, k));
        assert_eq!(lex.rc_class(cat, d), lex.rc_class(cat, am.phone_id("AE").unwrap()));
        // No triphones for D: one class.
        assert_eq!(lex.n_rc(cad), 1);
        assert_eq!(lex.n_rc(a), 1);
        assert_eq!(lex.n_rc(dict.silence_word()), 1);
        assert_eq!(
            lex.last_phone_ssid(cat, lex.rc_class(cat, sil)),
            am.triphone_ssid(am.phone_id("T").unwrap(), am.phone_id("AE").unwrap(), sil)
        );
    }

    #[test]
    fn test_left_context() {
        let lex = toy_lexicon();
        let dict = lex.dictionary().clone();
        let cat = dict.word_id("cat").unwrap();
        assert_eq!(lex.left_context(cat), lex.acoustic_model().phone_id("T").unwrap());
        assert_eq!(lex.left_context(dict.silence_word()), lex.silence_phone());
    }
}
