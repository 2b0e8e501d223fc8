//! Pronunciation dictionary seam and an in-memory implementation.

use std::collections::HashMap;

use crate::constants::words::{FINISH_WORD, SILENCE_WORD, START_WORD};
use crate::error::{DecoderError, Result};
use crate::types::{PhoneId, WordId};

/// Word inventory with pronunciations and filler classification.
pub trait Dictionary: Send + Sync {
    /// Number of words.
    fn len(&self) -> usize;

    /// Whether the dictionary has no words.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a word id by spelling.
    fn word_id(&self, word: &str) -> Option<WordId>;

    /// Spelling of a word.
    fn word_str(&self, id: WordId) -> Option<&str>;

    /// Phone sequence of a word (never empty).
    fn pronunciation(&self, id: WordId) -> &[PhoneId];

    /// Whether the word is a filler (silence, noise) invisible to the language model.
    fn is_filler(&self, id: WordId) -> bool;

    /// The utterance start marker.
    fn start_word(&self) -> WordId;

    /// The utterance end marker.
    fn finish_word(&self) -> WordId;

    /// The silence filler.
    fn silence_word(&self) -> WordId;
}

#[derive(Debug, Clone)]
struct DictEntry {
    word: String,
    phones: Box<[PhoneId]>,
    filler: bool,
}

/// Dictionary held in memory.
///
/// `<s>`, `</s>` and `<sil>` are created up front, all pronounced with the
/// silence phone; `<sil>` is a filler.
#[derive(Debug, Clone)]
pub struct PronouncingDictionary {
    entries: Vec<DictEntry>,
    index: HashMap<String, WordId>,
    start: WordId,
    finish: WordId,
    silence: WordId,
}

impl PronouncingDictionary {
    /// Create a dictionary holding only the sentence markers and silence.
    pub fn new(silence_phone: PhoneId) -> Self {
        let mut dict = Self {
            entries: Vec::new(),
            index: HashMap::new(),
            start: WordId(0),
            finish: WordId(0),
            silence: WordId(0),
        };
        dict.start = dict.push(START_WORD, vec![silence_phone], false);
        dict.finish = dict.push(FINISH_WORD, vec![silence_phone], false);
        dict.silence = dict.push(SILENCE_WORD, vec![silence_phone], true);
        dict
    }

    fn push(&mut self, word: &str, phones: Vec<PhoneId>, filler: bool) -> WordId {
        let id = WordId(self.entries.len() as u32);
        self.entries.push(DictEntry {
            word: word.to_string(),
            phones: phones.into_boxed_slice(),
            filler,
        });
        self.index.insert(word.to_string(), id);
        id
    }

    fn add(&mut self, word: &str, phones: &[PhoneId], filler: bool) -> Result<WordId> {
        if phones.is_empty() {
            return Err(DecoderError::Model(format!(
                "word '{}' has an empty pronunciation",
                word
            )));
        }
        if self.index.contains_key(word) {
            return Err(DecoderError::Model(format!("duplicate word '{}'", word)));
        }
        Ok(self.push(word, phones.to_vec(), filler))
    }

    /// Add a regular word.
    pub fn add_word(&mut self, word: &str, phones: &[PhoneId]) -> Result<WordId> {
        self.add(word, phones, false)
    }

    /// Add a filler word.
    pub fn add_filler(&mut self, word: &str, phones: &[PhoneId]) -> Result<WordId> {
        self.add(word, phones, true)
    }
}

impl Dictionary for PronouncingDictionary {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn word_id(&self, word: &str) -> Option<WordId> {
        self.index.get(word).copied()
    }

    fn word_str(&self, id: WordId) -> Option<&str> {
        self.entries.get(id.index()).map(|e| e.word.as_str())
    }

    fn pronunciation(&self, id: WordId) -> &[PhoneId] {
        self.entries.get(id.index()).map_or(&[][..], |e| &e.phones[..])
    }

    fn is_filler(&self, id: WordId) -> bool {
        self.entries.get(id.index()).map_or(false, |e| e.filler)
    }

    fn start_word(&self) -> WordId {
        self.start
    }

    fn finish_word(&self) -> WordId {
        self.finish
    }

    fn silence_word(&self) -> WordId {
        self.silence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_and_words() {
        let sil = PhoneId(0);
        let mut dict = PronouncingDictionary::new(sil);
        assert_eq!(dict.len(), 3);
        assert_eq!(dict.word_id("<s>"), Some(dict.start_word()));
        assert!(dict.is_filler(dict.silence_word()));
        assert!(!dict.is_filler(dict.finish_word()));

        let go = dict.add_word("go", &[PhoneId(1), PhoneId(2)]).unwrap();
        assert_eq!(dict.word_str(go), Some("go"));
        assert_eq!(dict.pronunciation(go), &[PhoneId(1), PhoneId(2)]);
        let um = dict.add_filler("++um++", &[PhoneId(3)]).unwrap();
        assert!(dict.is_filler(um));
    }

    #[test]
    fn test_rejects_bad_entries() {
        let mut dict = PronouncingDictionary::new(PhoneId(0));
        assert!(dict.add_word("x", &[]).is_err());
        dict.add_word("x", &[PhoneId(1)]).unwrap();
        assert!(dict.add_word("x", &[PhoneId(1)]).is_err());
        assert_eq!(dict.word_str(WordId(99)), None);
        assert!(dict.pronunciation(WordId(99)).is_empty());
    }
}
