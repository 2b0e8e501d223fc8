//! Self-contained decoding tasks in JSON.
//!
//! A task bundles a small acoustic model (phones, transition matrices,
//! triphones), a dictionary, an n-gram model and per-frame senone scores, so
//! the decoder can be driven without external model files.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::words::SILENCE_PHONE;
use crate::error::{DecoderError, ErrorContext, Result};
use crate::hmm::logmath::LogMath;
use crate::model::acoustic::{AcousticModel, AcousticModelBuilder, PrecomputedScorer};
use crate::model::dictionary::{Dictionary, PronouncingDictionary};
use crate::model::lm::BackoffNgramModel;
use crate::types::{PhoneId, SenoneId, TmatId, WordId};

fn default_n_emit_state() -> usize {
    3
}

fn default_silence_phone() -> String {
    SILENCE_PHONE.to_string()
}

/// A context-independent phone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoneSpec {
    /// Phone name.
    pub name: String,
    /// Senone of each emitting state.
    pub senones: Vec<SenoneId>,
    /// Index into [`Task::tmats`].
    pub tmat: u16,
    /// Noise or silence phone.
    #[serde(default)]
    pub filler: bool,
}

/// A triphone `left-base+right`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriphoneSpec {
    /// Centre phone.
    pub base: String,
    /// Left context.
    pub left: String,
    /// Right context.
    pub right: String,
    /// Senone of each emitting state.
    pub senones: Vec<SenoneId>,
}

/// A dictionary entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordSpec {
    /// Spelling.
    pub word: String,
    /// Pronunciation.
    pub phones: Vec<String>,
}

/// An n-gram with log10 probability and back-off weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NgramSpec {
    /// Words, oldest first.
    pub words: Vec<String>,
    /// log10 probability.
    pub prob: f64,
    /// log10 back-off weight.
    #[serde(default)]
    pub backoff: f64,
}

/// A decoding task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Emitting states per HMM.
    #[serde(default = "default_n_emit_state")]
    pub n_emit_state: usize,
    /// Transition matrices as probabilities, `n_emit_state` rows of `n_emit_state + 1`.
    pub tmats: Vec<Vec<Vec<f64>>>,
    /// Phone set.
    pub phones: Vec<PhoneSpec>,
    /// Context-dependent models.
    #[serde(default)]
    pub triphones: Vec<TriphoneSpec>,
    /// Phone used for `<s>`, `</s>` and `<sil>`.
    #[serde(default = "default_silence_phone")]
    pub silence_phone: String,
    /// Regular words.
    pub words: Vec<WordSpec>,
    /// Filler words besides `<sil>`.
    #[serde(default)]
    pub fillers: Vec<WordSpec>,
    /// Unigrams. Empty means uniform over every non-filler word.
    #[serde(default)]
    pub unigrams: Vec<NgramSpec>,
    /// Bigrams.
    #[serde(default)]
    pub bigrams: Vec<NgramSpec>,
    /// Trigrams.
    #[serde(default)]
    pub trigrams: Vec<NgramSpec>,
    /// Per-frame senone scores in the log domain.
    #[serde(default)]
    pub frames: Vec<Vec<f32>>,
}

/// Models built from a task.
#[derive(Debug, Clone)]
pub struct TaskModels {
    /// Acoustic model.
    pub am: Arc<AcousticModel>,
    /// Dictionary.
    pub dict: Arc<PronouncingDictionary>,
    /// Language model.
    pub lm: Arc<BackoffNgramModel>,
    /// Scorer reading senone scores straight from the frames.
    pub scorer: Arc<PrecomputedScorer>,
}

impl Task {
    /// Parse a task.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read a task file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading task {}", path.display()))?;
        debug!("Loaded task from {:?}", path);
        serde_json::from_str(&text).with_context(|| format!("parsing task {}", path.display()))
    }

    /// Build the models in the given log domain.
    pub fn build(&self, logmath: LogMath) -> Result<TaskModels> {
        let mut b = AcousticModel::builder(self.n_emit_state, logmath);
        let mut tmats = Vec::with_capacity(self.tmats.len());
        for rows in &self.tmats {
            tmats.push(b.add_tmat(rows)?);
        }
        for p in &self.phones {
            let tmat: TmatId = *tmats.get(p.tmat as usize).ok_or_else(|| {
                DecoderError::Model(format!(
                    "phone '{}' uses transition matrix {} of {}",
                    p.name,
                    p.tmat,
                    tmats.len()
                ))
            })?;
            b.add_phone(&p.name, &p.senones, tmat, p.filler)?;
        }
        let phone_id = |b: &AcousticModelBuilder, name: &str| {
            b.phone_id(name)
                .ok_or_else(|| DecoderError::Model(format!("unknown phone '{}'", name)))
        };
        for t in &self.triphones {
            let (base, left, right) = (
                phone_id(&b, &t.base)?,
                phone_id(&b, &t.left)?,
                phone_id(&b, &t.right)?,
            );
            b.add_triphone(base, left, right, &t.senones)?;
        }
        let am = Arc::new(b.build()?);

        let phones = |spec: &WordSpec| -> Result<Vec<PhoneId>> {
            spec.phones
                .iter()
                .map(|p| {
                    am.phone_id(p).ok_or_else(|| {
                        DecoderError::Model(format!("word '{}' uses unknown phone '{}'", spec.word, p))
                    })
                })
                .collect()
        };
        let sil = am.phone_id(&self.silence_phone).ok_or_else(|| {
            DecoderError::Model(format!("silence phone '{}' not in phone set", self.silence_phone))
        })?;
        let mut dict = PronouncingDictionary::new(sil);
        for w in &self.words {
            dict.add_word(&w.word, &phones(w)?)?;
        }
        for w in &self.fillers {
            dict.add_filler(&w.word, &phones(w)?)?;
        }

        let lm = self.build_lm(&dict, logmath)?;
        let scorer = Arc::new(PrecomputedScorer::new(am.n_senone()));
        debug!(
            phones = am.n_phone(),
            senones = am.n_senone(),
            words = dict.len(),
            lm_order = crate::model::lm::LanguageModel::order(&lm),
            frames = self.frames.len(),
            "Built task models"
        );
        Ok(TaskModels {
            am,
            dict: Arc::new(dict),
            lm: Arc::new(lm),
            scorer,
        })
    }

    fn build_lm(&self, dict: &PronouncingDictionary, logmath: LogMath) -> Result<BackoffNgramModel> {
        let mut lm = BackoffNgramModel::new(logmath);
        let ids = |spec: &NgramSpec, order: usize| -> Result<Vec<WordId>> {
            if spec.words.len() != order {
                return Err(DecoderError::Model(format!(
                    "{}-gram {:?} has {} words",
                    order,
                    spec.words,
                    spec.words.len()
                )));
            }
            spec.words
                .iter()
                .map(|w| {
                    dict.word_id(w)
                        .ok_or_else(|| DecoderError::Model(format!("n-gram word '{}' not in dictionary", w)))
                })
                .collect()
        };

        if self.unigrams.is_empty() {
            let words: Vec<WordId> = (0..dict.len() as u32)
                .map(WordId)
                .filter(|&w| !dict.is_filler(w))
                .collect();
            let prob = -(words.len() as f64).log10();
            for w in words {
                lm.add_unigram(w, prob, 0.0);
            }
        }
        for g in &self.unigrams {
            let w = ids(g, 1)?;
            lm.add_unigram(w[0], g.prob, g.backoff);
        }
        for g in &self.bigrams {
            let w = ids(g, 2)?;
            lm.add_bigram(w[0], w[1], g.prob, g.backoff);
        }
        for g in &self.trigrams {
            let w = ids(g, 3)?;
            lm.add_trigram(w[0], w[1], w[2], g.prob);
        }
        Ok(lm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lm::LanguageModel;

    const TASK: &str = r#"{
        "tmats": [[[0.5, 0.5, 0.0, 0.0], [0.0, 0.5, 0.5, 0.0], [0.0, 0.0, 0.5, 0.5]]],
        "phones": [
            {"name": "SIL", "senones": [0, 1, 2], "tmat": 0, "filler": true},
            {"name": "AH", "senones": [3, 4, 5], "tmat": 0}
        ],
        "triphones": [{"base": "AH", "left": "SIL", "right": "SIL", "senones": [6, 7, 8]}],
        "words": [{"word": "uh", "phones": ["AH"]}],
        "fillers": [{"word": "++noise++", "phones": ["SIL"]}],
        "bigrams": [],
        "frames": [[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]]
    }"#;

    #[test]
    fn test_builds_models() {
        let task = Task::from_json(TASK).unwrap();
        assert_eq!(task.n_emit_state, 3);
        let models = task.build(LogMath::default()).unwrap();
        assert_eq!(models.am.n_senone(), 9);
        let uh = models.dict.word_id("uh").unwrap();
        assert!(models.dict.is_filler(models.dict.word_id("++noise++").unwrap()));
        // Uniform unigrams over <s>, </s> and uh.
        assert!(models.lm.contains(uh));
        assert_eq!(
            models.lm.unigram_score(uh),
            models.lm.unigram_score(models.dict.start_word())
        );
        assert_eq!(models.lm.order(), 1);
    }

    #[test]
    fn test_rejects_unknown_names() {
        let mut task = Task::from_json(TASK).unwrap();
        task.words.push(WordSpec {
            word: "oh".to_string(),
            phones: vec!["OW".to_string()],
        });
        assert!(matches!(task.build(LogMath::default()), Err(DecoderError::Model(_))));

        let mut task = Task::from_json(TASK).unwrap();
        task.bigrams.push(NgramSpec {
            words: vec!["uh".to_string()],
            prob: -0.1,
            backoff: 0.0,
        });
        assert!(task.build(LogMath::default()).is_err());
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(matches!(Task::from_json("{"), Err(DecoderError::Json(_))));
    }

    #[test]
    fn test_load_names_the_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        match Task::load(&missing) {
            Err(DecoderError::Model(msg)) => {
                assert!(msg.starts_with("reading task"));
                assert!(msg.contains("missing.json"));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(b"{\"tmats\": ").unwrap();
        let err = Task::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("parsing task"));

        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(TASK.as_bytes()).unwrap();
        assert_eq!(Task::load(file.path()).unwrap().n_emit_state, 3);
    }
}
