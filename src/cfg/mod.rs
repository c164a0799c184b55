//! Control-flow graph model consumed by the layout passes
//!
//! The graph is an arena of blocks and edges addressed by integer ids; no
//! owning pointers exist between blocks, so the cyclic structure and the
//! mid-pass mutation (block duplication, edge redirection) stay simple.
//! Arena slots 0 and 1 hold the synthetic entry and exit blocks; real
//! blocks start at slot 2 and are linked into a physical order through
//! `prev_bb`/`next_bb`.

pub mod analysis;
pub mod block;
pub mod builder;
pub mod edge;
pub mod insn;

pub use analysis::{mark_dfs_back_edges, set_can_fallthru_flags};
pub use block::{BasicBlock, BlockId, LayoutState, Partition, RegSet};
pub use builder::FlowGraphBuilder;
pub use edge::{Edge, EdgeId};
pub use insn::{Insn, InsnKind, JumpTarget, LabelId, NoteKind, RegNote};

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point denominator for branch probabilities.
pub const PROB_BASE: u32 = 10_000;

/// Upper bound of the block frequency scale.
pub const BB_FREQ_MAX: u32 = 10_000;

/// Errors reported by [`FlowGraph::verify`]
#[derive(Debug, Clone)]
pub enum CfgError {
    /// The arena is missing its entry or exit slot
    MissingEntryOrExit,

    /// An edge references a block outside the arena
    InvalidEdgeEndpoint { edge: EdgeId },

    /// An edge is not listed by one of its endpoint blocks
    UnlinkedEdge { edge: EdgeId, block: BlockId },

    /// A block lists an edge that does not reference it
    InconsistentEdgeList { block: BlockId, edge: EdgeId },

    /// The physical order chain does not reach every block
    BrokenPhysicalOrder { missing: BlockId },
}

impl fmt::Display for CfgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CfgError::MissingEntryOrExit => {
                write!(f, "flow graph is missing its entry or exit block")
            }
            CfgError::InvalidEdgeEndpoint { edge } => {
                write!(f, "edge {} references a block outside the arena", edge)
            }
            CfgError::UnlinkedEdge { edge, block } => {
                write!(f, "edge {} is not listed by its endpoint {}", edge, block)
            }
            CfgError::InconsistentEdgeList { block, edge } => {
                write!(f, "block {} lists edge {} which does not touch it", block, edge)
            }
            CfgError::BrokenPhysicalOrder { missing } => {
                write!(f, "physical order chain never reaches {}", missing)
            }
        }
    }
}

impl std::error::Error for CfgError {}

/// A function's control-flow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraph {
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    next_label: u32,
    next_reg: u32,
}

impl Default for FlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowGraph {
    /// Create an empty graph holding only the synthetic entry and exit.
    pub fn new() -> Self {
        let mut entry = BasicBlock::new(BlockId::ENTRY);
        let exit = BasicBlock::new(BlockId::EXIT);
        entry.next_bb = Some(BlockId::EXIT);
        Self {
            blocks: vec![entry, exit],
            edges: Vec::new(),
            next_label: 0,
            next_reg: 0,
        }
    }

    pub fn entry(&self) -> &BasicBlock {
        &self.blocks[BlockId::ENTRY.index()]
    }

    pub fn exit(&self) -> &BasicBlock {
        &self.blocks[BlockId::EXIT.index()]
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.index()]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        &mut self.edges[id.index()]
    }

    /// Number of real (non-synthetic) blocks.
    pub fn n_real_blocks(&self) -> usize {
        self.blocks.len() - 2
    }

    /// Total number of arena slots, including entry and exit.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Real blocks in physical order, as a snapshot.
    pub fn real_blocks_in_order(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.n_real_blocks());
        let mut cur = self.entry().next_bb;
        while let Some(bb) = cur {
            if bb.is_exit() {
                break;
            }
            order.push(bb);
            cur = self.block(bb).next_bb;
        }
        order
    }

    /// Allocate a fresh block at the end of the arena, outside the
    /// physical chain. Used by the builder and by duplication.
    fn alloc_block(&mut self) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id));
        id
    }

    /// Create an empty block and splice it into the physical order
    /// immediately after `after`.
    pub fn create_basic_block(&mut self, after: BlockId) -> BlockId {
        let id = self.alloc_block();
        self.splice_after(id, after);
        id
    }

    fn splice_after(&mut self, bb: BlockId, after: BlockId) {
        let old_next = self.block(after).next_bb;
        self.block_mut(after).next_bb = Some(bb);
        self.block_mut(bb).prev_bb = Some(after);
        self.block_mut(bb).next_bb = old_next;
        if let Some(n) = old_next {
            self.block_mut(n).prev_bb = Some(bb);
        }
    }

    /// Add an edge from `src` to `dst` with the given probability.
    pub fn make_edge(&mut self, src: BlockId, dst: BlockId, probability: u32) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge::new(src, dst, probability));
        self.block_mut(src).succs.push(id);
        self.block_mut(dst).preds.push(id);
        id
    }

    /// Point an existing edge at a new destination, keeping its source,
    /// probability and flags.
    pub fn redirect_edge_succ(&mut self, e: EdgeId, new_dst: BlockId) {
        let old_dst = self.edge(e).dst;
        self.block_mut(old_dst).preds.retain(|&p| p != e);
        self.edge_mut(e).dst = new_dst;
        self.block_mut(new_dst).preds.push(e);
    }

    /// Frequency contributed by an edge: the source block's frequency
    /// scaled by the edge probability.
    pub fn edge_frequency(&self, e: EdgeId) -> i64 {
        let edge = self.edge(e);
        let src_freq = self.block(edge.src).frequency as i64;
        src_freq * edge.probability as i64 / PROB_BASE as i64
    }

    /// The block's single successor edge, when it has exactly one.
    pub fn single_succ(&self, bb: BlockId) -> Option<EdgeId> {
        let succs = &self.block(bb).succs;
        if succs.len() == 1 {
            Some(succs[0])
        } else {
            None
        }
    }

    pub fn new_label(&mut self) -> LabelId {
        let l = LabelId(self.next_label);
        self.next_label += 1;
        l
    }

    /// Allocate a fresh pseudo register.
    pub fn new_reg(&mut self) -> u32 {
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    /// Number of pseudo registers allocated so far.
    pub fn max_reg(&self) -> u32 {
        self.next_reg
    }

    /// Ensure `bb` starts with a label and return it.
    pub fn block_label(&mut self, bb: BlockId) -> LabelId {
        debug_assert!(!bb.is_entry() && !bb.is_exit());
        if let Some(l) = self.block(bb).head_label() {
            return l;
        }
        let l = self.new_label();
        self.block_mut(bb).insns.insert(0, Insn::label(l));
        l
    }

    /// Rewrite the conditional jump ending `bb` to target `label`.
    /// Returns false when the block does not end in a conditional jump.
    pub fn invert_jump(&mut self, bb: BlockId, label: LabelId) -> bool {
        match self.block_mut(bb).last_insn_mut() {
            Some(insn) if insn.is_any_condjump() => {
                insn.kind = InsnKind::CondJump {
                    target: JumpTarget::Label(label),
                };
                true
            }
            _ => false,
        }
    }

    /// Rewrite the jump ending `bb` to target `label`.
    pub fn redirect_jump(&mut self, bb: BlockId, label: LabelId) {
        match self.block_mut(bb).last_insn_mut() {
            Some(insn) => match &mut insn.kind {
                InsnKind::Jump(target) | InsnKind::CondJump { target } => {
                    *target = JumpTarget::Label(label);
                }
                other => panic!("cannot redirect non-jump instruction {:?} in {}", other, bb),
            },
            None => panic!("cannot redirect jump in empty block {}", bb),
        }
    }

    /// Materialize a block on the fall-through edge `e` so the transfer to
    /// the original destination becomes an explicit jump. The edge is
    /// redirected to the new block (staying a fall-through); the new block
    /// ends in an unconditional jump to the old destination.
    pub fn force_nonfallthru(&mut self, e: EdgeId) -> BlockId {
        let (src, dst) = {
            let edge = self.edge(e);
            (edge.src, edge.dst)
        };
        debug_assert!(self.edge(e).fallthru, "edge {} is not a fall-through", e);

        let freq = self.edge_frequency(e).min(BB_FREQ_MAX as i64) as u32;
        let count = self.edge(e).count;

        let new_bb = self.create_basic_block(src);
        self.block_mut(new_bb).frequency = freq;
        self.block_mut(new_bb).count = count;

        let label = self.block_label(dst);
        self.block_mut(new_bb).insns.push(Insn::jump(JumpTarget::Label(label)));

        self.redirect_edge_succ(e, new_bb);
        let out = self.make_edge(new_bb, dst, PROB_BASE);
        self.edge_mut(out).count = count;

        debug!("forced non-fallthru: {} -> {} via {}", src, dst, new_bb);
        new_bb
    }

    /// Duplicate `bb` and redirect `via` (an edge into `bb`) to the copy.
    /// The copy mirrors the original's outgoing edges; frequency and count
    /// move along `via`. Labels are not copied; the clone starts unlabeled.
    pub fn duplicate_block(&mut self, bb: BlockId, via: EdgeId) -> BlockId {
        assert_eq!(
            self.edge(via).dst,
            bb,
            "duplication edge {} does not enter {}",
            via,
            bb
        );

        let freq = self.edge_frequency(via).min(BB_FREQ_MAX as i64) as u32;
        let count = self.edge(via).count;

        let new_bb = self.alloc_block();
        self.splice_after(new_bb, bb);

        let src_insns: Vec<Insn> = self
            .block(bb)
            .insns
            .iter()
            .filter(|i| !i.is_label())
            .cloned()
            .collect();
        {
            let (partition, live_start, live_end) = {
                let b = self.block(bb);
                (b.partition, b.live_at_start.clone(), b.live_at_end.clone())
            };
            let new = self.block_mut(new_bb);
            new.insns = src_insns;
            new.frequency = freq;
            new.count = count;
            new.partition = partition;
            new.live_at_start = live_start;
            new.live_at_end = live_end;
        }
        {
            let b = self.block_mut(bb);
            b.frequency = b.frequency.saturating_sub(freq);
            b.count = b.count.saturating_sub(count);
        }

        // Mirror outgoing edges, scaling counts to the moved profile weight.
        let out_edges: Vec<EdgeId> = self.block(bb).succs.clone();
        for oe in out_edges {
            let (dst, probability, can_fallthru, complex, fallthru, fake) = {
                let e = self.edge(oe);
                (e.dst, e.probability, e.can_fallthru, e.complex, e.fallthru, e.fake)
            };
            let ne = self.make_edge(new_bb, dst, probability);
            let scaled = count * probability as u64 / PROB_BASE as u64;
            let e = self.edge_mut(ne);
            e.count = scaled;
            e.can_fallthru = can_fallthru;
            e.complex = complex;
            e.fallthru = fallthru;
            e.fake = fake;
        }

        self.redirect_edge_succ(via, new_bb);
        debug!("duplicated {} as {}", bb, new_bb);
        new_bb
    }

    /// Commit a layout chain as the new physical order. `head` is the first
    /// real block of the chain; every real block must be on it.
    pub fn relink_physical_order(&mut self, head: BlockId) {
        let mut prev = BlockId::ENTRY;
        let mut cur = Some(head);
        self.block_mut(BlockId::ENTRY).next_bb = Some(head);
        while let Some(bb) = cur {
            self.block_mut(bb).prev_bb = Some(prev);
            let next = self.block(bb).layout.next;
            self.block_mut(bb).next_bb = Some(next.unwrap_or(BlockId::EXIT));
            prev = bb;
            cur = next;
        }
        self.block_mut(prev).next_bb = Some(BlockId::EXIT);
        self.block_mut(BlockId::EXIT).prev_bb = Some(prev);
    }

    /// Structural validation of the graph.
    pub fn verify(&self) -> Result<(), CfgError> {
        if self.blocks.len() < 2 {
            return Err(CfgError::MissingEntryOrExit);
        }

        for (i, edge) in self.edges.iter().enumerate() {
            let id = EdgeId(i as u32);
            if edge.src.index() >= self.blocks.len() || edge.dst.index() >= self.blocks.len() {
                return Err(CfgError::InvalidEdgeEndpoint { edge: id });
            }
            if !self.block(edge.src).succs.contains(&id) {
                return Err(CfgError::UnlinkedEdge { edge: id, block: edge.src });
            }
            if !self.block(edge.dst).preds.contains(&id) {
                return Err(CfgError::UnlinkedEdge { edge: id, block: edge.dst });
            }
        }

        for block in &self.blocks {
            for &e in &block.succs {
                if self.edge(e).src != block.id {
                    return Err(CfgError::InconsistentEdgeList { block: block.id, edge: e });
                }
            }
            for &e in &block.preds {
                if self.edge(e).dst != block.id {
                    return Err(CfgError::InconsistentEdgeList { block: block.id, edge: e });
                }
            }
        }

        let order = self.real_blocks_in_order();
        if order.len() != self.n_real_blocks() {
            let reached: std::collections::HashSet<BlockId> = order.into_iter().collect();
            for block in &self.blocks {
                if !block.id.is_entry() && !block.id.is_exit() && !reached.contains(&block.id) {
                    return Err(CfgError::BrokenPhysicalOrder { missing: block.id });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_block_graph() -> (FlowGraph, BlockId, BlockId) {
        let mut g = FlowGraph::new();
        let a = g.create_basic_block(BlockId::ENTRY);
        let b = g.create_basic_block(a);
        g.block_mut(a).frequency = BB_FREQ_MAX;
        g.block_mut(a).count = 1000;
        (g, a, b)
    }

    #[test]
    fn test_new_graph_has_entry_and_exit() {
        let g = FlowGraph::new();
        assert_eq!(g.n_real_blocks(), 0);
        assert_eq!(g.entry().next_bb, Some(BlockId::EXIT));
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_create_block_splices_physical_order() {
        let (g, a, b) = two_block_graph();
        assert_eq!(g.real_blocks_in_order(), vec![a, b]);
        assert_eq!(g.block(b).prev_bb, Some(a));
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_make_and_redirect_edge() {
        let (mut g, a, b) = two_block_graph();
        let e = g.make_edge(a, b, PROB_BASE);
        assert_eq!(g.block(a).succs, vec![e]);
        assert_eq!(g.block(b).preds, vec![e]);

        let c = g.create_basic_block(b);
        g.redirect_edge_succ(e, c);
        assert!(g.block(b).preds.is_empty());
        assert_eq!(g.block(c).preds, vec![e]);
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_edge_frequency_scales_by_probability() {
        let (mut g, a, b) = two_block_graph();
        let e = g.make_edge(a, b, PROB_BASE / 4);
        assert_eq!(g.edge_frequency(e), BB_FREQ_MAX as i64 / 4);
    }

    #[test]
    fn test_block_label_is_stable() {
        let (mut g, a, _) = two_block_graph();
        let l1 = g.block_label(a);
        let l2 = g.block_label(a);
        assert_eq!(l1, l2);
        assert_eq!(g.block(a).head_label(), Some(l1));
    }

    #[test]
    fn test_force_nonfallthru_inserts_jump_block() {
        let (mut g, a, b) = two_block_graph();
        let e = g.make_edge(a, b, PROB_BASE);
        g.edge_mut(e).fallthru = true;
        g.edge_mut(e).count = 500;

        let n = g.force_nonfallthru(e);
        assert_eq!(g.edge(e).dst, n);
        assert!(g.edge(e).fallthru);
        assert!(g.block(n).ends_in_jump());
        let out = g.single_succ(n).unwrap();
        assert_eq!(g.edge(out).dst, b);
        assert!(!g.edge(out).fallthru);
        assert!(g.verify().is_ok());
    }

    #[test]
    fn test_duplicate_block_moves_profile_weight() {
        let (mut g, a, b) = two_block_graph();
        let c = g.create_basic_block(b);
        g.block_mut(b).frequency = 4000;
        g.block_mut(b).count = 400;
        g.block_mut(b).insns.push(Insn::op(2));

        let e1 = g.make_edge(a, b, PROB_BASE / 2);
        g.edge_mut(e1).count = 200;
        let e2 = g.make_edge(c, b, PROB_BASE / 2);
        g.edge_mut(e2).count = 200;
        let out = g.make_edge(b, c, PROB_BASE);
        g.edge_mut(out).count = 400;

        let d = g.duplicate_block(b, e1);
        assert_eq!(g.edge(e1).dst, d);
        assert_eq!(g.block(b).preds, vec![e2]);
        assert_eq!(g.block(d).insns.len(), 1);
        assert_eq!(g.block(d).count, 200);
        assert_eq!(g.block(b).count, 200);
        let mirrored = g.single_succ(d).unwrap();
        assert_eq!(g.edge(mirrored).dst, c);
        assert!(g.verify().is_ok());
        assert_ne!(mirrored, out);
    }

    #[test]
    fn test_relink_physical_order_follows_chain() {
        let (mut g, a, b) = two_block_graph();
        let c = g.create_basic_block(b);
        // Chain c -> a -> b
        g.block_mut(c).layout.next = Some(a);
        g.block_mut(a).layout.next = Some(b);
        g.block_mut(b).layout.next = None;
        g.relink_physical_order(c);
        assert_eq!(g.real_blocks_in_order(), vec![c, a, b]);
        assert_eq!(g.exit().prev_bb, Some(b));
        assert!(g.verify().is_ok());
    }
}
