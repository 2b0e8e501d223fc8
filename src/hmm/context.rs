//! Shared HMM parameters and the per-pass senone score vector.

use std::sync::Arc;

use crate::constants::hmm::MAX_EMIT_STATES;
use crate::constants::score::WORST_SCORE;
use crate::error::{DecoderError, Result};
use crate::hmm::logmath::LogMath;
use crate::types::{SenoneId, SenoneSeqId, TmatId};

/// Log-domain transition probabilities for one topology.
///
/// Rows are emitting states; column `n_emit` is the non-emitting exit state.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrix {
    n_emit: usize,
    logprob: Box<[i32]>,
    left_to_right: bool,
}

impl TransitionMatrix {
    /// Build from probabilities. Each row has `n` entries (no exit) or `n + 1`.
    pub fn from_probs(rows: &[Vec<f64>], logmath: &LogMath) -> Result<Self> {
        let n = rows.len();
        let mut logprob = Vec::with_capacity(n * (n + 1));
        for (i, row) in rows.iter().enumerate() {
            if row.len() != n && row.len() != n + 1 {
                return Err(DecoderError::Model(format!(
                    "transition matrix row {} has {} columns, expected {} or {}",
                    i,
                    row.len(),
                    n,
                    n + 1
                )));
            }
            logprob.extend(row.iter().map(|&p| logmath.log(p)));
            if row.len() == n {
                logprob.push(WORST_SCORE);
            }
        }
        Self::from_log(n, logprob)
    }

    /// Build from log scores laid out row-major, `n_emit x (n_emit + 1)`.
    pub fn from_log(n_emit: usize, logprob: Vec<i32>) -> Result<Self> {
        if n_emit == 0 || n_emit > MAX_EMIT_STATES {
            return Err(DecoderError::Model(format!(
                "unsupported emitting state count {} (max {})",
                n_emit, MAX_EMIT_STATES
            )));
        }
        if logprob.len() != n_emit * (n_emit + 1) {
            return Err(DecoderError::Model(format!(
                "transition matrix has {} entries, expected {}",
                logprob.len(),
                n_emit * (n_emit + 1)
            )));
        }
        let left_to_right = (0..n_emit).all(|i| {
            (0..=n_emit).all(|j| logprob[i * (n_emit + 1) + j] <= WORST_SCORE || (j >= i && j <= i + 2))
        });
        Ok(Self {
            n_emit,
            logprob: logprob.into_boxed_slice(),
            left_to_right,
        })
    }

    /// Number of emitting states.
    pub fn n_emit_state(&self) -> usize {
        self.n_emit
    }

    /// Log probability of `from -> to`; `to == n_emit_state()` is the exit.
    #[inline]
    pub fn prob(&self, from: usize, to: usize) -> i32 {
        self.logprob[from * (self.n_emit + 1) + to]
    }

    /// Whether every transition is a self loop, a step or a skip.
    pub fn is_left_to_right(&self) -> bool {
        self.left_to_right
    }
}

/// Evaluation context shared by all HMMs of one search pass.
///
/// Transition matrices and senone sequences are shared between passes; the
/// senone score vector belongs to the pass and is overwritten every frame.
#[derive(Debug, Clone)]
pub struct HmmContext {
    n_emit_state: usize,
    tmats: Arc<[TransitionMatrix]>,
    sseq: Arc<[Box<[SenoneId]>]>,
    senscore: Vec<i32>,
}

impl HmmContext {
    /// Create a context. Every senone sequence must have `n_emit_state` entries.
    pub fn new(
        n_emit_state: usize,
        tmats: Arc<[TransitionMatrix]>,
        sseq: Arc<[Box<[SenoneId]>]>,
        n_senone: usize,
    ) -> Result<Self> {
        if let Some(bad) = tmats.iter().position(|t| t.n_emit_state() != n_emit_state) {
            return Err(DecoderError::Model(format!(
                "transition matrix {} does not have {} emitting states",
                bad, n_emit_state
            )));
        }
        if let Some(bad) = sseq.iter().position(|s| s.len() != n_emit_state) {
            return Err(DecoderError::Model(format!(
                "senone sequence {} does not have {} entries",
                bad, n_emit_state
            )));
        }
        if let Some(s) = sseq.iter().flat_map(|s| s.iter()).find(|&&s| s as usize >= n_senone) {
            return Err(DecoderError::Model(format!(
                "senone {} out of range ({} senones)",
                s, n_senone
            )));
        }
        Ok(Self {
            n_emit_state,
            tmats,
            sseq,
            senscore: vec![WORST_SCORE; n_senone],
        })
    }

    /// Emitting states per HMM.
    pub fn n_emit_state(&self) -> usize {
        self.n_emit_state
    }

    /// Number of senones scored per frame.
    pub fn n_senone(&self) -> usize {
        self.senscore.len()
    }

    /// Transition matrix by id.
    #[inline]
    pub fn tmat(&self, id: TmatId) -> &TransitionMatrix {
        &self.tmats[id.index()]
    }

    /// Senone of `state` in sequence `ssid`.
    #[inline]
    pub fn senone(&self, ssid: SenoneSeqId, state: usize) -> SenoneId {
        self.sseq[ssid.index()][state]
    }

    /// Score of `state` in sequence `ssid` for the current frame.
    #[inline]
    pub fn senone_score(&self, ssid: SenoneSeqId, state: usize) -> i32 {
        self.senscore[self.senone(ssid, state) as usize]
    }

    /// Senone score vector for the current frame.
    pub fn scores(&self) -> &[i32] {
        &self.senscore
    }

    /// Mutable senone score vector; reset to `WORST_SCORE` before each frame.
    pub fn scores_mut(&mut self) -> &mut [i32] {
        &mut self.senscore
    }

    /// Forget the previous frame's scores.
    pub fn clear_scores(&mut self) {
        self.senscore.fill(WORST_SCORE);
    }
}

/// Set of senones referenced by active HMMs in a frame.
#[derive(Debug, Clone, Default)]
pub struct SenoneSet {
    member: Vec<bool>,
    list: Vec<SenoneId>,
}

impl SenoneSet {
    /// Create an empty set over `n_senone` senones.
    pub fn new(n_senone: usize) -> Self {
        Self {
            member: vec![false; n_senone],
            list: Vec::with_capacity(n_senone.min(1024)),
        }
    }

    /// Remove all members.
    pub fn clear(&mut self) {
        for &s in &self.list {
            self.member[s as usize] = false;
        }
        self.list.clear();
    }

    /// Add a senone.
    #[inline]
    pub fn insert(&mut self, senone: SenoneId) {
        let slot = &mut self.member[senone as usize];
        if !*slot {
            *slot = true;
            self.list.push(senone);
        }
    }

    /// Members in insertion order.
    pub fn as_slice(&self) -> &[SenoneId] {
        &self.list
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
