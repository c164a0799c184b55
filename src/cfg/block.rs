//! Basic blocks and their layout side-band
//!
//! Blocks carry the profile data (frequency and count) consumed by the
//! layout heuristics, the hot/cold partition assignment, and a mutable
//! layout side-band used while traces are formed and connected. The
//! side-band's `next` chain is the authoritative block order once a layout
//! pass finishes.

use super::insn::{Insn, LabelId};
use super::EdgeId;
use crate::cfg::BB_FREQ_MAX;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Set of hard or pseudo register numbers
pub type RegSet = BTreeSet<u32>;

/// Unique identifier for basic blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    /// The synthetic entry block (arena slot 0).
    pub const ENTRY: BlockId = BlockId(0);

    /// The synthetic exit block (arena slot 1).
    pub const EXIT: BlockId = BlockId(1);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn is_entry(&self) -> bool {
        *self == Self::ENTRY
    }

    pub fn is_exit(&self) -> bool {
        *self == Self::EXIT
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Hot/cold section assignment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partition {
    /// Not yet classified
    #[default]
    Unset,
    /// Likely executed; stays in the primary text section
    Hot,
    /// Predicted never executed; emitted into the unlikely section
    Cold,
}

/// Mutable layout state attached to every block.
///
/// `next` links blocks into the trace/layout chain, `visited` records which
/// trace claimed the block (0 = unclaimed), and `footer` holds instructions
/// (barriers) that are emitted after the block but are not part of its
/// executable body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutState {
    pub next: Option<BlockId>,
    pub visited: u32,
    pub footer: Vec<Insn>,
}

/// A basic block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Stable identifier; also the arena index
    pub id: BlockId,

    /// Relative execution frequency in [0, BB_FREQ_MAX]
    pub frequency: u32,

    /// Absolute profile execution count
    pub count: u64,

    /// Hot/cold section assignment
    pub partition: Partition,

    /// Incoming edges, in insertion order
    pub preds: Vec<EdgeId>,

    /// Outgoing edges, in insertion order
    pub succs: Vec<EdgeId>,

    /// Instructions belonging to this block
    pub insns: Vec<Insn>,

    /// Registers live on entry, if liveness has been computed
    pub live_at_start: Option<RegSet>,

    /// Registers live on exit, if liveness has been computed
    pub live_at_end: Option<RegSet>,

    /// Previous block in the physical order
    pub prev_bb: Option<BlockId>,

    /// Next block in the physical order
    pub next_bb: Option<BlockId>,

    /// Layout side-band
    pub layout: LayoutState,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            frequency: 0,
            count: 0,
            partition: Partition::Unset,
            preds: Vec::new(),
            succs: Vec::new(),
            insns: Vec::new(),
            live_at_start: None,
            live_at_end: None,
            prev_bb: None,
            next_bb: None,
            layout: LayoutState::default(),
        }
    }

    pub fn first_insn(&self) -> Option<&Insn> {
        self.insns.first()
    }

    pub fn last_insn(&self) -> Option<&Insn> {
        self.insns.last()
    }

    pub fn last_insn_mut(&mut self) -> Option<&mut Insn> {
        self.insns.last_mut()
    }

    /// Whether the block ends in a control transfer.
    pub fn ends_in_jump(&self) -> bool {
        self.last_insn().map_or(false, Insn::is_jump)
    }

    /// The label this block starts with, if any.
    pub fn head_label(&self) -> Option<LabelId> {
        match self.first_insn()?.kind {
            super::insn::InsnKind::Label(l) => Some(l),
            _ => None,
        }
    }

    /// Summed encoded size of the block's real instructions.
    pub fn code_size(&self) -> u32 {
        self.insns
            .iter()
            .filter(|i| i.is_real())
            .map(|i| i.length)
            .sum()
    }

    /// Whether profile data predicts this block never executes.
    pub fn probably_never_executed(&self) -> bool {
        self.count == 0 && self.frequency == 0
    }

    /// Whether this block is plausibly on a hot path.
    pub fn maybe_hot(&self) -> bool {
        self.frequency >= BB_FREQ_MAX / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::insn::{InsnKind, JumpTarget};

    #[test]
    fn test_block_id_display() {
        assert_eq!(format!("{}", BlockId::new(7)), "bb7");
        assert!(BlockId::ENTRY.is_entry());
        assert!(BlockId::EXIT.is_exit());
        assert!(!BlockId::new(2).is_entry());
    }

    #[test]
    fn test_code_size_counts_real_insns_only() {
        let mut bb = BasicBlock::new(BlockId::new(2));
        bb.insns.push(Insn::label(LabelId(0)));
        bb.insns.push(Insn::op(4));
        bb.insns.push(Insn::op(2));
        bb.insns.push(Insn::jump(JumpTarget::Label(LabelId(1))));
        bb.insns.push(Insn::barrier());
        assert_eq!(bb.code_size(), 7);
    }

    #[test]
    fn test_head_label_and_jump() {
        let mut bb = BasicBlock::new(BlockId::new(2));
        assert_eq!(bb.head_label(), None);
        bb.insns.push(Insn::label(LabelId(3)));
        assert_eq!(bb.head_label(), Some(LabelId(3)));
        assert!(!bb.ends_in_jump());
        bb.insns.push(Insn::ret());
        assert!(bb.ends_in_jump());
        assert!(matches!(bb.last_insn().unwrap().kind, InsnKind::Return));
    }

    #[test]
    fn test_profile_predicates() {
        let mut bb = BasicBlock::new(BlockId::new(2));
        assert!(bb.probably_never_executed());
        assert!(!bb.maybe_hot());
        bb.frequency = BB_FREQ_MAX;
        bb.count = 100;
        assert!(!bb.probably_never_executed());
        assert!(bb.maybe_hot());
    }
}
