//! Single-frame Viterbi evaluation of one HMM.
//!
//! Each emitting state first absorbs its own senone score (emit before
//! transition), then scores propagate along the transition matrix. The
//! non-emitting entry score competes with state 0 once and is then consumed; the
//! exit score is derived from the same pre-update scores and histories, so an
//! exit always carries the history of the state it left from.
//!
//! Three- and five-state left-to-right topologies are monomorphized with a
//! two-state reach; everything else runs the dense recurrence.

use crate::constants::hmm::{BAKIS_3, BAKIS_5, MAX_EMIT_STATES};
use crate::constants::score::WORST_SCORE;
use crate::hmm::context::{HmmContext, SenoneSet};
use crate::types::{BpIdx, SenoneSeqId, TmatId};

/// Which senones and transitions an HMM uses.
#[derive(Debug, Clone, PartialEq)]
pub enum HmmIdentity {
    /// One senone sequence and one transition matrix for the whole HMM.
    Simple {
        /// Senone sequence.
        ssid: SenoneSeqId,
        /// Transition matrix.
        tmatid: TmatId,
    },
    /// Per-state identities, copied from the winning predecessor on every
    /// transition. Used for word-initial phones whose left context varies.
    Multiplexed {
        /// Senone sequence per state; `None` until a path reaches the state.
        ssid: Box<[Option<SenoneSeqId>]>,
        /// Transition matrix per state.
        tmatid: Box<[TmatId]>,
    },
}

/// One HMM instance: state scores, histories and entry/exit bookkeeping.
#[derive(Debug, Clone)]
pub struct Hmm {
    score: Box<[i32]>,
    history: Box<[Option<BpIdx>]>,
    pred: Box<[u8]>,
    identity: HmmIdentity,
    in_score: i32,
    in_history: Option<BpIdx>,
    in_identity: Option<(SenoneSeqId, TmatId)>,
    out_score: i32,
    out_history: Option<BpIdx>,
    best_score: i32,
    frame: Option<usize>,
}

impl Hmm {
    /// Create an inactive HMM with a fixed identity.
    pub fn new(n_emit_state: usize, ssid: SenoneSeqId, tmatid: TmatId) -> Self {
        Self::with_identity(n_emit_state, HmmIdentity::Simple { ssid, tmatid })
    }

    /// Create an inactive multiplexed HMM. Only state 0 starts with an identity.
    pub fn new_multiplexed(n_emit_state: usize, ssid: SenoneSeqId, tmatid: TmatId) -> Self {
        let mut ssids = vec![None; n_emit_state].into_boxed_slice();
        ssids[0] = Some(ssid);
        Self::with_identity(
            n_emit_state,
            HmmIdentity::Multiplexed {
                ssid: ssids,
                tmatid: vec![tmatid; n_emit_state].into_boxed_slice(),
            },
        )
    }

    fn with_identity(n_emit_state: usize, identity: HmmIdentity) -> Self {
        debug_assert!(n_emit_state > 0 && n_emit_state <= MAX_EMIT_STATES);
        Self {
            score: vec![WORST_SCORE; n_emit_state].into_boxed_slice(),
            history: vec![None; n_emit_state].into_boxed_slice(),
            pred: (0..n_emit_state as u8).collect(),
            identity,
            in_score: WORST_SCORE,
            in_history: None,
            in_identity: None,
            out_score: WORST_SCORE,
            out_history: None,
            best_score: WORST_SCORE,
            frame: None,
        }
    }

    /// Number of emitting states.
    pub fn n_emit_state(&self) -> usize {
        self.score.len()
    }

    /// The HMM's identity.
    pub fn identity(&self) -> &HmmIdentity {
        &self.identity
    }

    /// Whether identities are tracked per state.
    pub fn is_multiplexed(&self) -> bool {
        matches!(self.identity, HmmIdentity::Multiplexed { .. })
    }

    /// Senone sequence of a state, `None` for an unreached multiplexed state.
    #[inline]
    pub fn ssid(&self, state: usize) -> Option<SenoneSeqId> {
        match &self.identity {
            HmmIdentity::Simple { ssid, .. } => Some(*ssid),
            HmmIdentity::Multiplexed { ssid, .. } => ssid[state],
        }
    }

    /// Transition matrix of a state.
    #[inline]
    pub fn tmatid(&self, state: usize) -> TmatId {
        match &self.identity {
            HmmIdentity::Simple { tmatid, .. } => *tmatid,
            HmmIdentity::Multiplexed { tmatid, .. } => tmatid[state],
        }
    }

    /// Path score of a state.
    pub fn score(&self, state: usize) -> i32 {
        self.score[state]
    }

    /// History of the best path into a state.
    pub fn history(&self, state: usize) -> Option<BpIdx> {
        self.history[state]
    }

    /// Predecessor state chosen for `state` in the last evaluation.
    pub fn predecessor(&self, state: usize) -> usize {
        self.pred[state] as usize
    }

    /// Pending entry score.
    pub fn in_score(&self) -> i32 {
        self.in_score
    }

    /// Pending entry history.
    pub fn in_history(&self) -> Option<BpIdx> {
        self.in_history
    }

    /// Exit score of the last evaluation.
    pub fn out_score(&self) -> i32 {
        self.out_score
    }

    /// History carried by the exit.
    pub fn out_history(&self) -> Option<BpIdx> {
        self.out_history
    }

    /// Best of all state scores and the exit score after the last evaluation.
    pub fn best_score(&self) -> i32 {
        self.best_score
    }

    /// Frame in which the HMM is (or will next be) active.
    pub fn frame(&self) -> Option<usize> {
        self.frame
    }

    /// Mark the HMM as active in `frame`.
    pub fn set_frame(&mut self, frame: usize) {
        self.frame = Some(frame);
    }

    /// Whether the HMM holds any live score.
    pub fn is_active(&self) -> bool {
        self.frame.is_some()
    }

    /// Reset every score to `WORST_SCORE` and mark the HMM inactive.
    pub fn clear(&mut self) {
        self.score.fill(WORST_SCORE);
        self.history.fill(None);
        self.in_score = WORST_SCORE;
        self.in_history = None;
        self.in_identity = None;
        self.out_score = WORST_SCORE;
        self.out_history = None;
        self.best_score = WORST_SCORE;
        self.frame = None;
        if let HmmIdentity::Multiplexed { ssid, .. } = &mut self.identity {
            for s in ssid.iter_mut().skip(1) {
                *s = None;
            }
        }
    }

    /// Set the entry score and history and mark the HMM active in `frame`.
    pub fn enter(&mut self, score: i32, history: Option<BpIdx>, frame: usize) {
        self.in_score = score;
        self.in_history = history;
        self.in_identity = None;
        self.frame = Some(frame);
    }

    /// Enter a multiplexed HMM with the identity of the incoming left context.
    pub fn enter_multiplexed(
        &mut self,
        score: i32,
        history: Option<BpIdx>,
        frame: usize,
        ssid: SenoneSeqId,
        tmatid: TmatId,
    ) {
        self.enter(score, history, frame);
        if self.is_multiplexed() {
            self.in_identity = Some((ssid, tmatid));
        }
    }

    /// Subtract `norm` from every live score.
    pub fn normalize(&mut self, norm: i32) {
        for s in self.score.iter_mut() {
            if *s > WORST_SCORE {
                *s -= norm;
            }
        }
        for s in [&mut self.in_score, &mut self.out_score, &mut self.best_score] {
            if *s > WORST_SCORE {
                *s -= norm;
            }
        }
    }

    /// Add the senones this HMM will read in the next evaluation.
    pub fn collect_senones(&self, ctx: &HmmContext, set: &mut SenoneSet) {
        for state in 0..self.n_emit_state() {
            if let Some(ssid) = self.ssid(state) {
                set.insert(ctx.senone(ssid, state));
            }
        }
        if let Some((ssid, _)) = self.in_identity {
            set.insert(ctx.senone(ssid, 0));
        }
    }

    /// Advance the HMM by one frame using the context's senone scores.
    ///
    /// Returns the new best score (including the exit score).
    pub fn vit_eval(&mut self, ctx: &HmmContext) -> i32 {
        let left_to_right = self.is_left_to_right(ctx);
        match self.n_emit_state() {
            BAKIS_3 if left_to_right => self.recurrence::<BAKIS_3>(ctx, Some(2)),
            BAKIS_5 if left_to_right => self.recurrence::<BAKIS_5>(ctx, Some(2)),
            _ => self.recurrence::<MAX_EMIT_STATES>(ctx, None),
        }
    }

    fn is_left_to_right(&self, ctx: &HmmContext) -> bool {
        let entry_ok = self
            .in_identity
            .map_or(true, |(_, t)| ctx.tmat(t).is_left_to_right());
        entry_ok
            && match &self.identity {
                HmmIdentity::Simple { tmatid, .. } => ctx.tmat(*tmatid).is_left_to_right(),
                HmmIdentity::Multiplexed { tmatid, .. } => {
                    tmatid.iter().all(|t| ctx.tmat(*t).is_left_to_right())
                }
            }
    }

    /// Core recurrence. `reach` bounds how far back a transition can come from.
    fn recurrence<const CAP: usize>(&mut self, ctx: &HmmContext, reach: Option<usize>) -> i32 {
        let n = self.n_emit_state();
        debug_assert!(n <= CAP);

        let mut from = [WORST_SCORE; CAP];
        let mut hist: [Option<BpIdx>; CAP] = [None; CAP];
        let mut ssid: [Option<SenoneSeqId>; CAP] = [None; CAP];
        let mut tmat = [TmatId(0); CAP];
        for i in 0..n {
            ssid[i] = self.ssid(i);
            tmat[i] = self.tmatid(i);
            hist[i] = self.history[i];
            from[i] = emit(ctx, self.score[i], ssid[i], i);
        }

        if self.in_score > WORST_SCORE {
            let (in_ssid, in_tmat) = match self.in_identity {
                Some((s, t)) => (Some(s), t),
                None => (ssid[0], tmat[0]),
            };
            let entry = emit(ctx, self.in_score, in_ssid, 0);
            if entry > from[0] {
                from[0] = entry;
                hist[0] = self.in_history;
                ssid[0] = in_ssid;
                tmat[0] = in_tmat;
            }
        }
        self.in_score = WORST_SCORE;
        self.in_identity = None;

        let exit_lo = reach.map_or(0, |r| n.saturating_sub(r));
        let mut out = WORST_SCORE;
        let mut out_from = n;
        for i in exit_lo..n {
            if from[i] <= WORST_SCORE {
                continue;
            }
            let tp = ctx.tmat(tmat[i]).prob(i, n);
            if tp <= WORST_SCORE {
                continue;
            }
            if from[i] + tp > out {
                out = from[i] + tp;
                out_from = i;
            }
        }
        self.out_score = out;
        self.out_history = if out_from < n { hist[out_from] } else { None };

        let mut best = out;
        for j in 0..n {
            let (lo, hi) = match reach {
                Some(r) => (j.saturating_sub(r), j + 1),
                None => (0, n),
            };
            let mut state_best = WORST_SCORE;
            let mut arg = j;
            for i in lo..hi {
                if from[i] <= WORST_SCORE {
                    continue;
                }
                let tp = ctx.tmat(tmat[i]).prob(i, j);
                if tp <= WORST_SCORE {
                    continue;
                }
                if from[i] + tp > state_best {
                    state_best = from[i] + tp;
                    arg = i;
                }
            }
            self.score[j] = state_best;
            if state_best > WORST_SCORE {
                self.history[j] = hist[arg];
                self.pred[j] = arg as u8;
                if let HmmIdentity::Multiplexed { ssid: ids, tmatid: tids } = &mut self.identity {
                    ids[j] = ssid[arg];
                    tids[j] = tmat[arg];
                }
                best = best.max(state_best);
            }
        }

        self.best_score = best;
        best
    }
}

#[inline]
fn emit(ctx: &HmmContext, score: i32, ssid: Option<SenoneSeqId>, state: usize) -> i32 {
    match ssid {
        Some(ssid) if score > WORST_SCORE => {
            let senscr = ctx.senone_score(ssid, state);
            if senscr <= WORST_SCORE {
                return WORST_SCORE;
            }
            let s = score + senscr;
            if s <= WORST_SCORE {
                WORST_SCORE
            } else {
                s
            }
        }
        _ => WORST_SCORE,
    }
}
