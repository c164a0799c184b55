//! Programmatic flow-graph construction
//!
//! Hosts hand the layout passes an already-built CFG; this builder offers a
//! compact API for assembling one: create blocks with their profile data,
//! append instructions, and terminate blocks with branch/conditional/return
//! helpers that create the corresponding edges and mark the fall-through
//! arm. `finish` wires the physical order in creation order and adds the
//! entry edge.

use super::insn::{Insn, JumpTarget};
use super::{BlockId, EdgeId, FlowGraph, PROB_BASE};

/// Builder for [`FlowGraph`]
pub struct FlowGraphBuilder {
    graph: FlowGraph,
    order: Vec<BlockId>,
}

impl Default for FlowGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowGraphBuilder {
    pub fn new() -> Self {
        Self {
            graph: FlowGraph::new(),
            order: Vec::new(),
        }
    }

    /// Create a block with the given profile data. Blocks are laid out in
    /// creation order.
    pub fn block(&mut self, frequency: u32, count: u64) -> BlockId {
        let after = self.order.last().copied().unwrap_or(BlockId::ENTRY);
        let bb = self.graph.create_basic_block(after);
        self.graph.block_mut(bb).frequency = frequency;
        self.graph.block_mut(bb).count = count;
        self.order.push(bb);
        bb
    }

    /// Append an ordinary instruction of the given encoded size.
    pub fn op(&mut self, bb: BlockId, length: u32) {
        self.graph.block_mut(bb).insns.push(Insn::op(length));
    }

    /// Append an arbitrary instruction.
    pub fn insn(&mut self, bb: BlockId, insn: Insn) {
        self.graph.block_mut(bb).insns.push(insn);
    }

    /// End `from` with an unconditional jump to `to`.
    pub fn branch(&mut self, from: BlockId, to: BlockId) -> EdgeId {
        let label = self.graph.block_label(to);
        self.graph
            .block_mut(from)
            .insns
            .push(Insn::jump(JumpTarget::Label(label)));
        self.edge_with_count(from, to, PROB_BASE)
    }

    /// End `from` with a conditional jump taken to `taken` with probability
    /// `taken_prob`, falling through to `fallthru` otherwise. Returns the
    /// (taken, fall-through) edges.
    pub fn cond(
        &mut self,
        from: BlockId,
        taken: BlockId,
        fallthru: BlockId,
        taken_prob: u32,
    ) -> (EdgeId, EdgeId) {
        debug_assert!(taken_prob <= PROB_BASE);
        let label = self.graph.block_label(taken);
        self.graph
            .block_mut(from)
            .insns
            .push(Insn::cond_jump(JumpTarget::Label(label)));
        let taken_edge = self.edge_with_count(from, taken, taken_prob);
        let fall_edge = self.edge_with_count(from, fallthru, PROB_BASE - taken_prob);
        self.graph.edge_mut(fall_edge).fallthru = true;
        (taken_edge, fall_edge)
    }

    /// Let `from` fall straight through into `to` with no jump.
    pub fn fallthru(&mut self, from: BlockId, to: BlockId) -> EdgeId {
        let e = self.edge_with_count(from, to, PROB_BASE);
        self.graph.edge_mut(e).fallthru = true;
        e
    }

    /// End `from` with a return.
    pub fn ret(&mut self, from: BlockId) -> EdgeId {
        self.graph.block_mut(from).insns.push(Insn::ret());
        self.edge_with_count(from, BlockId::EXIT, PROB_BASE)
    }

    fn edge_with_count(&mut self, from: BlockId, to: BlockId, prob: u32) -> EdgeId {
        let e = self.graph.make_edge(from, to, prob);
        let count = self.graph.block(from).count * prob as u64 / PROB_BASE as u64;
        self.graph.edge_mut(e).count = count;
        e
    }

    /// Finish construction: add the entry edge to the first created block
    /// (unless one was added explicitly) and return the graph.
    pub fn finish(mut self) -> FlowGraph {
        if let Some(&first) = self.order.first() {
            if self.graph.entry().succs.is_empty() {
                let e = self.graph.make_edge(BlockId::ENTRY, first, PROB_BASE);
                self.graph.edge_mut(e).fallthru = true;
                self.graph.edge_mut(e).count = self.graph.block(first).count;
            }
        }
        self.graph
    }
}
