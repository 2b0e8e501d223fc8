//! Third pass: lattice construction and bestpath search.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::DecoderConfig;
use crate::error::Result;
use crate::metrics::{self, PassTimer};
use crate::model::lexicon::Lexicon;
use crate::model::lm::LanguageModel;
use crate::search::lattice::Lattice;
use crate::search::{PassOutcome, Penalties, SearchPass};
use crate::sync::arc_buffer::ArcReader;
use crate::telemetry::span_utils;

const PASS: &str = "bestpath";

/// Builds the lattice from the arcs of the previous pass as they are
/// committed, then searches it once the stream ends.
pub struct LatticeSearch {
    input: ArcReader,
    lattice: Lattice,
}

impl LatticeSearch {
    /// Set up a bestpath pass over the arcs of `input`.
    pub fn new(
        config: &DecoderConfig,
        lexicon: Arc<Lexicon>,
        lm: Arc<dyn LanguageModel>,
        input: ArcReader,
    ) -> Self {
        let logmath = *lexicon.acoustic_model().logmath();
        let penalties = Penalties::new(
            &logmath,
            config.bestpath_lw,
            config.wip,
            config.silprob,
            config.fillprob,
        );
        Self {
            input,
            lattice: Lattice::new(lexicon, lm, penalties),
        }
    }

    /// The lattice built so far.
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }
}

impl SearchPass for LatticeSearch {
    fn name(&self) -> &'static str {
        PASS
    }

    fn run(&mut self) -> Result<PassOutcome> {
        let _timer = PassTimer::new(PASS);
        let mut sf = 0;
        let mut n_arcs = 0;
        while let Some(arcs) = self.input.frame_arcs(sf)? {
            for arc in &arcs {
                self.lattice.add_arc(arc)?;
            }
            n_arcs += arcs.len();
            sf += 1;
            self.input.release_before(sf)?;
        }
        self.lattice.finish();

        let best = self.lattice.best_path();
        let unlinked = match &best {
            Some(path) => self.lattice.unlink_unreachable(path.end),
            None => {
                warn!(arcs = n_arcs, "No path through the lattice");
                0
            }
        };
        let hypothesis = best.as_ref().map(|p| self.lattice.hypothesis(p));
        let export = self.lattice.export(best.as_ref().map(|p| p.end));

        let frames = self.lattice.n_frames();
        metrics::record_arcs(PASS, n_arcs);
        span_utils::add_frames(frames);
        span_utils::add_arcs(n_arcs);
        info!(
            frames,
            arcs = n_arcs,
            nodes = export.nodes.len(),
            links = export.links.len(),
            dropped = self.lattice.dropped(),
            unlinked,
            hypothesis = hypothesis.as_ref().map_or("", |h| h.text.as_str()),
            "Bestpath pass finished"
        );
        Ok(PassOutcome {
            hypothesis,
            frames,
            lattice: Some(export),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lexicon::tests::toy_lexicon;
    use crate::search::fwdtree::tests::toy_lm;
    use crate::sync::arc_buffer::{ArcBuffer, WordArc};
    use crate::types::WordId;
    use std::thread;

    fn arc(src: usize, dest: usize, word: WordId, score: i32) -> WordArc {
        WordArc {
            src_frame: src,
            dest_frame: dest,
            word,
            score,
        }
    }

    #[test]
    fn test_bestpath_over_streamed_arcs() {
        let lex = Arc::new(toy_lexicon());
        let lm: Arc<dyn LanguageModel> = Arc::new(toy_lm(&lex));
        let dict = Arc::clone(lex.dictionary());
        let id = |w: &str| dict.word_id(w).unwrap();
        let buffer = ArcBuffer::new("fwdflat", Some(Arc::clone(&lm)), true);
        let mut search =
            LatticeSearch::new(&DecoderConfig::default(), lex, lm, buffer.reader().unwrap());
        let handle = thread::spawn(move || search.run());

        let by_start = [
            vec![arc(0, 2, id("<s>"), -100)],
            vec![],
            vec![],
            vec![arc(3, 11, id("cat"), -1000), arc(3, 11, id("cad"), -50_000)],
        ];
        for arcs in &by_start {
            for a in arcs {
                buffer.push(*a).unwrap();
            }
            buffer.commit_frame().unwrap();
        }
        for _ in 4..12 {
            buffer.commit_frame().unwrap();
        }
        buffer.push(arc(12, 14, id("</s>"), -100)).unwrap();
        buffer.commit_frame().unwrap();
        buffer.finalize().unwrap();

        let outcome = handle.join().unwrap().unwrap();
        let hyp = outcome.hypothesis.unwrap();
        assert_eq!(hyp.text, "cat");
        assert_eq!(outcome.frames, 15);
        let lattice = outcome.lattice.unwrap();
        assert_eq!(lattice.links.iter().filter(|l| l.word == "</s>").count(), 2);
    }

    #[test]
    fn test_empty_stream_yields_no_hypothesis() {
        let lex = Arc::new(toy_lexicon());
        let lm: Arc<dyn LanguageModel> = Arc::new(toy_lm(&lex));
        let buffer = ArcBuffer::new("fwdflat", None, true);
        let mut search =
            LatticeSearch::new(&DecoderConfig::default(), lex, lm, buffer.reader().unwrap());
        buffer.finalize().unwrap();
        let outcome = search.run().unwrap();
        assert!(outcome.hypothesis.is_none());
        assert_eq!(outcome.lattice.unwrap().nodes.len(), 1);
    }
}
