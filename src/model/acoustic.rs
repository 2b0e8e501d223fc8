//! Acoustic model tables and the acoustic scoring seam.
//!
//! The decoder needs only the phone set, transition matrices, senone sequences
//! and a triphone lookup; Gaussian evaluation is behind [`AcousticScorer`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::constants::score::WORST_SCORE;
use crate::error::{DecoderError, Result};
use crate::hmm::context::{HmmContext, TransitionMatrix};
use crate::hmm::logmath::LogMath;
use crate::types::{PhoneId, SenoneId, SenoneSeqId, TmatId};

/// Per-frame senone scoring.
pub trait AcousticScorer: Send + Sync {
    /// Number of senones this scorer produces.
    fn n_senone(&self) -> usize;

    /// Score the `active` senones of one frame into `out` (indexed by senone id).
    ///
    /// Entries of `out` outside `active` may be left untouched.
    fn score(&self, frame: usize, features: &[f32], active: &[SenoneId], out: &mut [i32]) -> Result<()>;
}

/// Scorer for feature vectors that already hold log-domain senone scores.
#[derive(Debug, Clone)]
pub struct PrecomputedScorer {
    n_senone: usize,
}

impl PrecomputedScorer {
    /// Create a scorer expecting `n_senone` values per frame.
    pub fn new(n_senone: usize) -> Self {
        Self { n_senone }
    }
}

impl AcousticScorer for PrecomputedScorer {
    fn n_senone(&self) -> usize {
        self.n_senone
    }

    fn score(&self, frame: usize, features: &[f32], active: &[SenoneId], out: &mut [i32]) -> Result<()> {
        if features.len() < self.n_senone {
            return Err(DecoderError::InvalidInput(format!(
                "frame {} has {} values, expected {}",
                frame,
                features.len(),
                self.n_senone
            )));
        }
        for &s in active {
            out[s as usize] = senone_score(features[s as usize]);
        }
        Ok(())
    }
}

/// NaN and infinities score as [`WORST_SCORE`]; finite values never fall below it.
fn senone_score(value: f32) -> i32 {
    if !value.is_finite() {
        return WORST_SCORE;
    }
    (value.round() as i32).max(WORST_SCORE)
}

#[derive(Debug, Clone)]
struct PhoneInfo {
    name: String,
    ssid: SenoneSeqId,
    tmat: TmatId,
    filler: bool,
}

/// Phone inventory with context-independent and triphone senone sequences.
#[derive(Debug, Clone)]
pub struct AcousticModel {
    logmath: LogMath,
    n_emit_state: usize,
    n_senone: usize,
    phones: Vec<PhoneInfo>,
    phone_index: HashMap<String, PhoneId>,
    tmats: Arc<[TransitionMatrix]>,
    sseq: Arc<[Box<[SenoneId]>]>,
    triphones: HashMap<(PhoneId, PhoneId, PhoneId), SenoneSeqId>,
}

impl AcousticModel {
    /// Start building a model whose HMMs have `n_emit_state` emitting states.
    pub fn builder(n_emit_state: usize, logmath: LogMath) -> AcousticModelBuilder {
        AcousticModelBuilder {
            logmath,
            n_emit_state,
            phones: Vec::new(),
            phone_index: HashMap::new(),
            tmats: Vec::new(),
            sseq: Vec::new(),
            sseq_index: HashMap::new(),
            triphones: HashMap::new(),
        }
    }

    /// The model's log domain.
    pub fn logmath(&self) -> &LogMath {
        &self.logmath
    }

    /// Emitting states per phone HMM.
    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    /// Number of senones referenced by any sequence.
    pub fn n_senone(&self) -> usize {
        self.n_senone
    }

    /// Number of context-independent phones.
    pub fn n_phone(&self) -> usize {
        self.phones.len()
    }

    /// Look up a phone by name.
    pub fn phone_id(&self, name: &str) -> Option<PhoneId> {
        self.phone_index.get(name).copied()
    }

    /// Name of a phone.
    pub fn phone_name(&self, phone: PhoneId) -> Option<&str> {
        self.phones.get(phone.index()).map(|p| p.name.as_str())
    }

    /// Whether a phone models silence or noise and takes no context.
    pub fn is_filler_phone(&self, phone: PhoneId) -> bool {
        self.phones.get(phone.index()).map_or(false, |p| p.filler)
    }

    /// Transition matrix of a phone.
    pub fn tmat(&self, phone: PhoneId) -> TmatId {
        self.phones[phone.index()].tmat
    }

    /// Context-independent senone sequence of a phone.
    pub fn ci_ssid(&self, phone: PhoneId) -> SenoneSeqId {
        self.phones[phone.index()].ssid
    }

    /// Senone sequence of `base` between `left` and `right`, falling back to the
    /// context-independent model when the triphone is not modelled.
    pub fn triphone_ssid(&self, base: PhoneId, left: PhoneId, right: PhoneId) -> SenoneSeqId {
        if self.is_filler_phone(base) {
            return self.ci_ssid(base);
        }
        self.triphones
            .get(&(base, left, right))
            .copied()
            .unwrap_or_else(|| self.ci_ssid(base))
    }

    /// Fresh evaluation context sharing this model's tables.
    pub fn hmm_context(&self) -> Result<HmmContext> {
        HmmContext::new(
            self.n_emit_state,
            Arc::clone(&self.tmats),
            Arc::clone(&self.sseq),
            self.n_senone,
        )
    }
}

/// Incremental construction of an [`AcousticModel`].
#[derive(Debug)]
pub struct AcousticModelBuilder {
    logmath: LogMath,
    n_emit_state: usize,
    phones: Vec<PhoneInfo>,
    phone_index: HashMap<String, PhoneId>,
    tmats: Vec<TransitionMatrix>,
    sseq: Vec<Box<[SenoneId]>>,
    sseq_index: HashMap<Box<[SenoneId]>, SenoneSeqId>,
    triphones: HashMap<(PhoneId, PhoneId, PhoneId), SenoneSeqId>,
}

impl AcousticModelBuilder {
    /// Add a transition matrix given as probabilities.
    pub fn add_tmat(&mut self, rows: &[Vec<f64>]) -> Result<TmatId> {
        let tmat = TransitionMatrix::from_probs(rows, &self.logmath)?;
        if tmat.n_emit_state() != self.n_emit_state {
            return Err(DecoderError::Model(format!(
                "transition matrix has {} states, model uses {}",
                tmat.n_emit_state(),
                self.n_emit_state
            )));
        }
        let id = TmatId(self.tmats.len() as u16);
        self.tmats.push(tmat);
        Ok(id)
    }

    fn intern_sseq(&mut self, senones: &[SenoneId]) -> Result<SenoneSeqId> {
        if senones.len() != self.n_emit_state {
            return Err(DecoderError::Model(format!(
                "senone sequence has {} entries, model uses {}",
                senones.len(),
                self.n_emit_state
            )));
        }
        if let Some(&id) = self.sseq_index.get(senones) {
            return Ok(id);
        }
        let id = SenoneSeqId(self.sseq.len() as u32);
        let seq: Box<[SenoneId]> = senones.into();
        self.sseq.push(seq.clone());
        self.sseq_index.insert(seq, id);
        Ok(id)
    }

    /// Add a context-independent phone.
    pub fn add_phone(
        &mut self,
        name: &str,
        senones: &[SenoneId],
        tmat: TmatId,
        filler: bool,
    ) -> Result<PhoneId> {
        if self.phone_index.contains_key(name) {
            return Err(DecoderError::Model(format!("duplicate phone '{}'", name)));
        }
        if tmat.index() >= self.tmats.len() {
            return Err(DecoderError::Model(format!(
                "phone '{}' uses unknown transition matrix {}",
                name,
                tmat.index()
            )));
        }
        let ssid = self.intern_sseq(senones)?;
        let id = PhoneId(self.phones.len() as u16);
        self.phones.push(PhoneInfo {
            name: name.to_string(),
            ssid,
            tmat,
            filler,
        });
        self.phone_index.insert(name.to_string(), id);
        Ok(id)
    }

    /// Look up a phone added so far.
    pub fn phone_id(&self, name: &str) -> Option<PhoneId> {
        self.phone_index.get(name).copied()
    }

    /// Add a triphone `left-base+right`.
    pub fn add_triphone(
        &mut self,
        base: PhoneId,
        left: PhoneId,
        right: PhoneId,
        senones: &[SenoneId],
    ) -> Result<SenoneSeqId> {
        let n = self.phones.len();
        if [base, left, right].iter().any(|p| p.index() >= n) {
            return Err(DecoderError::Model(format!(
                "triphone {}-{}+{} references an unknown phone",
                left, base, right
            )));
        }
        let ssid = self.intern_sseq(senones)?;
        self.triphones.insert((base, left, right), ssid);
        Ok(ssid)
    }

    /// Finish the model.
    pub fn build(self) -> Result<AcousticModel> {
        if self.phones.is_empty() {
            return Err(DecoderError::Model("acoustic model has no phones".to_string()));
        }
        let n_senone = self
            .sseq
            .iter()
            .flat_map(|s| s.iter())
            .map(|&s| s as usize + 1)
            .max()
            .unwrap_or(0);
        Ok(AcousticModel {
            logmath: self.logmath,
            n_emit_state: self.n_emit_state,
            n_senone,
            phones: self.phones,
            phone_index: self.phone_index,
            tmats: self.tmats.into(),
            sseq: self.sseq.into(),
            triphones: self.triphones,
        })
    }
}
