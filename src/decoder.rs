//! Utterance-level decoder driving the search passes.
//!
//! Each enabled pass runs on its own thread for the length of an utterance.
//! Frames go into a shared feature array; the tree pass streams word arcs to
//! the flat pass, whose arcs feed the bestpath pass. The controller only ever
//! touches the arrays and the passes' final outcomes.

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;
use tracing::{error, info, warn, Span};
use uuid::Uuid;

use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::metrics;
use crate::model::acoustic::{AcousticModel, AcousticScorer};
use crate::model::dictionary::Dictionary;
use crate::model::lexicon::Lexicon;
use crate::model::lm::LanguageModel;
use crate::search::fwdflat::FlatSearch;
use crate::search::fwdtree::TreeSearch;
use crate::search::latgen::LatticeSearch;
use crate::search::{Hypothesis, LatticeExport, PassOutcome, PhoneConstraint, SearchPass, Segment};
use crate::sync::arc_buffer::ArcBuffer;
use crate::sync::sync_array::SyncArray;
use crate::telemetry::span_utils;

struct PassThread {
    name: &'static str,
    handle: JoinHandle<Result<PassOutcome>>,
}

struct Utterance {
    id: Uuid,
    span: Span,
    feed: Arc<SyncArray<Arc<[f32]>>>,
    passes: Vec<PassThread>,
    n_frames: usize,
    frame_len: Option<usize>,
}

/// Result of the last completed utterance.
#[derive(Debug, Clone)]
pub struct UtteranceResult {
    /// Utterance id.
    pub id: Uuid,
    /// Final hypothesis.
    pub hypothesis: Hypothesis,
    /// Lattice of the bestpath pass, when it ran.
    pub lattice: Option<LatticeExport>,
    /// Frames decoded.
    pub frames: usize,
}

/// Multi-pass decoder. One utterance at a time.
pub struct Decoder {
    config: DecoderConfig,
    lexicon: Arc<Lexicon>,
    lm: Arc<dyn LanguageModel>,
    scorer: Arc<dyn AcousticScorer>,
    constraint: Option<PhoneConstraint>,
    partial: Arc<RwLock<Option<Hypothesis>>>,
    utterance: Option<Utterance>,
    last: Option<UtteranceResult>,
    poisoned: bool,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("words", &self.lexicon.n_words())
            .field("in_utterance", &self.utterance.is_some())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl Decoder {
    /// Create a decoder over the given models.
    pub fn new(
        config: DecoderConfig,
        am: Arc<AcousticModel>,
        dict: Arc<dyn Dictionary>,
        lm: Arc<dyn LanguageModel>,
        scorer: Arc<dyn AcousticScorer>,
    ) -> Result<Self> {
        config.validate()?;
        if (am.logmath().base() - config.log_base).abs() > f64::EPSILON {
            return Err(DecoderError::Configuration(format!(
                "acoustic model uses log base {}, configuration says {}",
                am.logmath().base(),
                config.log_base
            )));
        }
        if scorer.n_senone() < am.n_senone() {
            return Err(DecoderError::Model(format!(
                "scorer produces {} senones, model needs {}",
                scorer.n_senone(),
                am.n_senone()
            )));
        }
        let lexicon = Arc::new(Lexicon::new(dict, am)?);
        info!(
            words = lexicon.n_words(),
            lm_order = lm.order(),
            fwdflat = config.fwdflat,
            bestpath = config.bestpath,
            "Decoder created"
        );
        Ok(Self {
            config,
            lexicon,
            lm,
            scorer,
            constraint: None,
            partial: Arc::new(RwLock::new(None)),
            utterance: None,
            last: None,
            poisoned: false,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Lexicon shared by the passes.
    pub fn lexicon(&self) -> &Arc<Lexicon> {
        &self.lexicon
    }

    /// Phone segmentation constraining the tree pass of the next utterance.
    pub fn set_phone_constraint(&mut self, constraint: Option<PhoneConstraint>) -> Result<()> {
        if self.utterance.is_some() {
            return Err(DecoderError::InvalidState(
                "cannot change the phone constraint during an utterance".to_string(),
            ));
        }
        self.constraint = constraint;
        Ok(())
    }

    /// Start decoding an utterance and return its id.
    pub fn start_utterance(&mut self) -> Result<Uuid> {
        if self.poisoned {
            return Err(DecoderError::InvalidState(
                "decoder is unusable after a fatal error".to_string(),
            ));
        }
        if self.utterance.is_some() {
            return Err(DecoderError::InvalidState(
                "an utterance is already in progress".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let span = crate::utterance_span!(id);
        let _enter = span.enter();
        *self.partial.write() = None;
        self.last = None;

        let feed = SyncArray::<Arc<[f32]>>::new("features");
        let keep = self.config.keep_scores;

        // Every reader is registered before any pass runs.
        let tree_out = ArcBuffer::new("fwdtree", Some(Arc::clone(&self.lm)), keep);
        let mut passes: Vec<Box<dyn SearchPass>> = vec![Box::new(
            TreeSearch::new(
                &self.config,
                Arc::clone(&self.lexicon),
                Arc::clone(&self.lm),
                Arc::clone(&self.scorer),
                feed.retain()?,
                Arc::clone(&tree_out),
                Arc::clone(&self.partial),
            )?
            .with_constraint(self.constraint.clone()),
        )];
        let mut arcs = tree_out;
        if self.config.fwdflat {
            let flat_out = ArcBuffer::new("fwdflat", Some(Arc::clone(&self.lm)), keep);
            passes.push(Box::new(FlatSearch::new(
                &self.config,
                Arc::clone(&self.lexicon),
                Arc::clone(&self.lm),
                Arc::clone(&self.scorer),
                feed.retain()?,
                arcs.reader()?,
                Arc::clone(&flat_out),
            )?));
            arcs = flat_out;
        }
        if self.config.bestpath {
            passes.push(Box::new(LatticeSearch::new(
                &self.config,
                Arc::clone(&self.lexicon),
                Arc::clone(&self.lm),
                arcs.reader()?,
            )));
        }

        let mut threads = Vec::with_capacity(passes.len());
        for pass in passes {
            match spawn_pass(&span, pass) {
                Ok(t) => threads.push(t),
                Err(e) => {
                    // Let the passes already running drain and exit.
                    let _ = feed.finalize();
                    for t in threads {
                        let _ = t.handle.join();
                    }
                    return Err(e);
                }
            }
        }

        metrics::record_utterance_start();
        info!(passes = threads.len(), "Utterance started");
        drop(_enter);
        self.utterance = Some(Utterance {
            id,
            span,
            feed,
            passes: threads,
            n_frames: 0,
            frame_len: None,
        });
        Ok(id)
    }

    /// Queue one frame of features for every pass.
    pub fn process_frame(&mut self, features: &[f32]) -> Result<()> {
        let utt = self.utterance.as_mut().ok_or_else(|| {
            DecoderError::InvalidState("no utterance in progress".to_string())
        })?;
        if features.is_empty() {
            return Err(DecoderError::InvalidInput("empty feature frame".to_string()));
        }
        match utt.frame_len {
            Some(n) if n != features.len() => {
                return Err(DecoderError::InvalidInput(format!(
                    "frame {} has {} values, previous frames had {}",
                    utt.n_frames,
                    features.len(),
                    n
                )));
            }
            _ => utt.frame_len = Some(features.len()),
        }
        utt.feed.append(Arc::from(features))?;
        utt.n_frames += 1;
        Ok(())
    }

    /// Finish the utterance: wait for every pass and return the final hypothesis.
    pub fn end_utterance(&mut self) -> Result<Hypothesis> {
        let utt = self.utterance.take().ok_or_else(|| {
            DecoderError::InvalidState("no utterance in progress".to_string())
        })?;
        let _enter = utt.span.enter();
        utt.feed.finalize()?;

        let mut first_error: Option<DecoderError> = None;
        let mut outcomes: Vec<(&'static str, PassOutcome)> = Vec::with_capacity(utt.passes.len());
        for pass in utt.passes {
            match pass.handle.join() {
                Ok(Ok(outcome)) => outcomes.push((pass.name, outcome)),
                Ok(Err(e)) => {
                    warn!(pass = pass.name, error = %e, "Search pass failed");
                    first_error.get_or_insert(e);
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(pass = pass.name, message = %message, "Search pass panicked");
                    first_error.get_or_insert(DecoderError::PassPanicked {
                        pass: pass.name,
                        message,
                    });
                }
            }
        }

        if let Some(e) = first_error {
            if e.is_process_fatal() {
                self.poisoned = true;
            }
            metrics::record_utterance_failure(error_kind(&e));
            return Err(e);
        }

        let lattice = outcomes.iter_mut().rev().find_map(|(_, o)| o.lattice.take());
        let final_pass = outcomes.last().map_or("none", |(name, _)| *name);
        let Some((from, hypothesis)) = outcomes
            .into_iter()
            .rev()
            .find_map(|(name, o)| o.hypothesis.map(|h| (name, h)))
        else {
            metrics::record_utterance_failure("no_hypothesis");
            return Err(DecoderError::InvalidState(
                "no search pass produced a hypothesis".to_string(),
            ));
        };
        if from != final_pass {
            warn!(pass = final_pass, fallback = from, "Final pass found no path, using an earlier pass");
        }

        span_utils::add_words(&utt.span, hypothesis.words.len());
        utt.span.record("frames", utt.n_frames);
        info!(
            frames = utt.n_frames,
            pass = from,
            text = %hypothesis.text,
            score = hypothesis.score,
            "Utterance decoded"
        );
        self.last = Some(UtteranceResult {
            id: utt.id,
            hypothesis: hypothesis.clone(),
            lattice,
            frames: utt.n_frames,
        });
        Ok(hypothesis)
    }

    /// Whether an utterance is being decoded.
    pub fn in_utterance(&self) -> bool {
        self.utterance.is_some()
    }

    /// Final hypothesis of the last utterance.
    pub fn current_hypothesis(&self) -> Option<&Hypothesis> {
        self.last.as_ref().map(|r| &r.hypothesis)
    }

    /// Latest partial hypothesis of the tree pass. After an utterance this is
    /// the tree pass's final hypothesis.
    pub fn partial_hypothesis(&self) -> Option<Hypothesis> {
        self.partial.read().clone()
    }

    /// Word segmentation of the last utterance. Each call starts over.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.last
            .iter()
            .flat_map(|r| r.hypothesis.segments.iter())
    }

    /// Lattice of the last utterance, if the bestpath pass ran.
    pub fn lattice(&self) -> Option<&LatticeExport> {
        self.last.as_ref().and_then(|r| r.lattice.as_ref())
    }

    /// Everything kept from the last utterance.
    pub fn last_result(&self) -> Option<&UtteranceResult> {
        self.last.as_ref()
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if let Some(utt) = self.utterance.take() {
            let _ = utt.feed.finalize();
            for pass in utt.passes {
                let _ = pass.handle.join();
            }
        }
    }
}

fn spawn_pass(parent: &Span, mut pass: Box<dyn SearchPass>) -> Result<PassThread> {
    let name = pass.name();
    let parent = parent.clone();
    let handle = thread::Builder::new()
        .name(format!("decoder-{}", name))
        .spawn(move || {
            let span = crate::pass_span!(&parent, name);
            let _enter = span.enter();
            pass.run()
        })?;
    Ok(PassThread { name, handle })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn error_kind(e: &DecoderError) -> &'static str {
    match e {
        DecoderError::PruningExhausted { .. } => "pruning_exhausted",
        DecoderError::NumericUnderflow { .. } => "numeric_underflow",
        DecoderError::CapacityGrowthFailure { .. } => "capacity",
        DecoderError::PassPanicked { .. } => "panic",
        DecoderError::InvalidInput(_) => "invalid_input",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::logmath::LogMath;
    use crate::model::acoustic::PrecomputedScorer;
    use crate::model::lexicon::tests::toy_lexicon;
    use crate::search::fwdtree::tests::{cat_frames, toy_lm};

    fn decoder(config: DecoderConfig) -> Decoder {
        let lex = toy_lexicon();
        let lm = Arc::new(toy_lm(&lex));
        Decoder::new(
            config,
            Arc::clone(lex.acoustic_model()),
            Arc::clone(lex.dictionary()),
            lm,
            Arc::new(PrecomputedScorer::new(21)),
        )
        .unwrap()
    }

    fn decode(dec: &mut Decoder, frames: &[Vec<f32>]) -> Result<Hypothesis> {
        dec.start_utterance()?;
        for f in frames {
            dec.process_frame(f)?;
        }
        dec.end_utterance()
    }

    #[test]
    fn test_three_passes() {
        let mut dec = decoder(DecoderConfig::default());
        let hyp = decode(&mut dec, &cat_frames()).unwrap();
        assert_eq!(hyp.text, "cat");
        assert_eq!(dec.current_hypothesis().unwrap().text, "cat");
        assert_eq!(dec.partial_hypothesis().unwrap().text, "cat");
        let lattice = dec.lattice().unwrap();
        assert!(lattice.links.iter().any(|l| l.word == "cat"));
        let words: Vec<&str> = dec.segments().map(|s| s.word.as_str()).collect();
        assert_eq!(words.first(), Some(&"<s>"));
        assert!(words.contains(&"cat"));
        // Restartable.
        assert_eq!(dec.segments().count(), words.len());
    }

    #[test]
    fn test_tree_pass_only() {
        let config = DecoderConfig {
            fwdflat: false,
            bestpath: false,
            ..DecoderConfig::default()
        };
        let mut dec = decoder(config);
        assert_eq!(decode(&mut dec, &cat_frames()).unwrap().text, "cat");
        assert!(dec.lattice().is_none());
    }

    #[test]
    fn test_bestpath_from_tree_arcs() {
        let config = DecoderConfig {
            fwdflat: false,
            ..DecoderConfig::default()
        };
        let mut dec = decoder(config);
        assert_eq!(decode(&mut dec, &cat_frames()).unwrap().text, "cat");
        assert!(dec.lattice().is_some());
    }

    #[test]
    fn test_state_errors() {
        let mut dec = decoder(DecoderConfig::default());
        assert!(matches!(
            dec.process_frame(&[0.0; 21]),
            Err(DecoderError::InvalidState(_))
        ));
        assert!(matches!(dec.end_utterance(), Err(DecoderError::InvalidState(_))));
        dec.start_utterance().unwrap();
        assert!(matches!(dec.start_utterance(), Err(DecoderError::InvalidState(_))));
        assert!(dec.set_phone_constraint(None).is_err());
        assert!(matches!(
            dec.process_frame(&[]),
            Err(DecoderError::InvalidInput(_))
        ));
        dec.process_frame(&[0.0; 21]).unwrap();
        assert!(matches!(
            dec.process_frame(&[0.0; 5]),
            Err(DecoderError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_failed_utterance_leaves_decoder_usable() {
        let mut dec = decoder(DecoderConfig::default());
        let short = vec![vec![0.0f32; 4]];
        assert!(matches!(
            decode(&mut dec, &short),
            Err(DecoderError::InvalidInput(_))
        ));
        assert!(!dec.in_utterance());
        assert_eq!(decode(&mut dec, &cat_frames()).unwrap().text, "cat");
    }

    #[test]
    fn test_drop_mid_utterance_joins_passes() {
        let mut dec = decoder(DecoderConfig::default());
        dec.start_utterance().unwrap();
        for f in cat_frames().iter().take(5) {
            dec.process_frame(f).unwrap();
        }
        drop(dec);
    }

    #[test]
    fn test_log_base_mismatch_rejected() {
        let lex = toy_lexicon();
        let config = DecoderConfig {
            log_base: 1.001,
            ..DecoderConfig::default()
        };
        assert_ne!(LogMath::default().base(), 1.001);
        let result = Decoder::new(
            config,
            Arc::clone(lex.acoustic_model()),
            Arc::clone(lex.dictionary()),
            Arc::new(toy_lm(&lex)),
            Arc::new(PrecomputedScorer::new(21)),
        );
        assert!(matches!(result, Err(DecoderError::Configuration(_))));
    }
}
