//! Sparse per-frame set of active search nodes.
//!
//! A dense map from node id to slot marks which nodes are live in a frame.
//! Each slot carries the best entry offered to its node for the frame. The map
//! holds `INACTIVE` for every node that is not in the set; `clear` restores
//! that for exactly the nodes used, since slots are reused every frame.

use crate::constants::score::WORST_SCORE;
use crate::error::{DecoderError, Result};
use crate::search::grow_for;
use crate::types::{BpIdx, SenoneSeqId, TmatId};

/// Map value of a node outside the set.
pub const INACTIVE: u32 = u32::MAX;

/// Best entry offered to a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingEntry {
    /// Entry score, `WORST_SCORE` if nothing entered.
    pub score: i32,
    /// History carried into the node.
    pub history: Option<BpIdx>,
    /// Left-context identity for multiplexed nodes.
    pub identity: Option<(SenoneSeqId, TmatId)>,
}

impl PendingEntry {
    /// No entry.
    pub const NONE: Self = Self {
        score: WORST_SCORE,
        history: None,
        identity: None,
    };

    /// Entry without a left-context identity.
    pub fn new(score: i32, history: Option<BpIdx>) -> Self {
        Self {
            score,
            history,
            identity: None,
        }
    }

    /// Entry into a multiplexed node.
    pub fn with_identity(self, ssid: SenoneSeqId, tmatid: TmatId) -> Self {
        Self {
            identity: Some((ssid, tmatid)),
            ..self
        }
    }
}

impl Default for PendingEntry {
    fn default() -> Self {
        Self::NONE
    }
}

/// Active nodes of one frame, with their pending entries.
#[derive(Debug)]
pub struct ActiveSet {
    slot_of: Vec<u32>,
    nodes: Vec<u32>,
    entries: Vec<PendingEntry>,
}

impl ActiveSet {
    /// Set over `universe` node ids with room for `initial` active nodes.
    pub fn new(universe: usize, initial: usize) -> Result<Self> {
        let mut nodes = Vec::new();
        nodes
            .try_reserve_exact(initial)
            .map_err(|e| DecoderError::growth("active list", initial, e))?;
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(initial)
            .map_err(|e| DecoderError::growth("active entries", initial, e))?;
        Ok(Self {
            slot_of: vec![INACTIVE; universe],
            nodes,
            entries,
        })
    }

    /// Number of active nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is active.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Active node ids, in activation order.
    pub fn nodes(&self) -> &[u32] {
        &self.nodes
    }

    /// Slot of a node, if active.
    pub fn slot(&self, node: u32) -> Option<usize> {
        match self.slot_of.get(node as usize) {
            Some(&s) if s != INACTIVE => Some(s as usize),
            _ => None,
        }
    }

    /// Whether a node is active.
    pub fn is_active(&self, node: u32) -> bool {
        self.slot(node).is_some()
    }

    /// Pending entry of a slot.
    pub fn entry(&self, slot: usize) -> PendingEntry {
        self.entries.get(slot).copied().unwrap_or_default()
    }

    /// Active nodes with their pending entries.
    pub fn iter(&self) -> impl Iterator<Item = (u32, PendingEntry)> + '_ {
        self.nodes.iter().copied().zip(self.entries.iter().copied())
    }

    /// Make a node active, returning its slot.
    pub fn activate(&mut self, node: u32) -> Result<usize> {
        let idx = node as usize;
        if idx >= self.slot_of.len() {
            return Err(DecoderError::InvalidState(format!(
                "node {} outside active set of {}",
                node,
                self.slot_of.len()
            )));
        }
        if self.slot_of[idx] != INACTIVE {
            return Ok(self.slot_of[idx] as usize);
        }
        // Both lists grow together so every slot has an entry.
        grow_for(&mut self.nodes, 1, "active list")?;
        grow_for(&mut self.entries, 1, "active entries")?;
        let slot = self.nodes.len();
        self.nodes.push(node);
        self.entries.push(PendingEntry::NONE);
        self.slot_of[idx] = slot as u32;
        Ok(slot)
    }

    /// Offer an entry to a node. The best entry wins; on ties the first stays.
    /// Returns whether the offer was taken.
    pub fn offer(&mut self, node: u32, entry: PendingEntry) -> Result<bool> {
        let slot = self.activate(node)?;
        if entry.score > self.entries[slot].score {
            self.entries[slot] = entry;
            return Ok(true);
        }
        Ok(false)
    }

    /// Deactivate every node.
    pub fn clear(&mut self) {
        for &node in &self.nodes {
            self.slot_of[node as usize] = INACTIVE;
        }
        self.nodes.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_and_clear() {
        let mut set = ActiveSet::new(10, 2).unwrap();
        assert_eq!(set.activate(7).unwrap(), 0);
        assert_eq!(set.activate(3).unwrap(), 1);
        assert_eq!(set.activate(7).unwrap(), 0);
        assert_eq!(set.len(), 2);
        assert!(set.is_active(3));
        assert!(!set.is_active(4));

        set.clear();
        assert!(set.is_empty());
        for node in 0..10 {
            assert_eq!(set.slot(node), None);
        }
        // Reused slots start empty.
        assert_eq!(set.activate(3).unwrap(), 0);
        assert_eq!(set.entry(0), PendingEntry::NONE);
    }

    #[test]
    fn test_offer_keeps_best_and_first_on_tie() {
        let mut set = ActiveSet::new(4, 1).unwrap();
        assert!(set.offer(2, PendingEntry::new(-50, Some(BpIdx(1)))).unwrap());
        assert!(!set.offer(2, PendingEntry::new(-50, Some(BpIdx(2)))).unwrap());
        assert!(!set.offer(2, PendingEntry::new(-80, Some(BpIdx(3)))).unwrap());
        assert!(set.offer(2, PendingEntry::new(-10, Some(BpIdx(4)))).unwrap());
        let slot = set.slot(2).unwrap();
        assert_eq!(set.entry(slot).history, Some(BpIdx(4)));
    }

    #[test]
    fn test_growth_preserves_slots() {
        let mut set = ActiveSet::new(1000, 2).unwrap();
        for node in (0..1000).rev() {
            set.offer(node, PendingEntry::new(-(node as i32), None)).unwrap();
        }
        assert_eq!(set.len(), 1000);
        for (node, entry) in set.iter() {
            assert_eq!(entry.score, -(node as i32));
            assert_eq!(set.nodes()[set.slot(node).unwrap()], node);
        }
        assert!(set.activate(1000).is_err());
    }
}
