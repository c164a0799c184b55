//! Edge-flag analyses run before trace formation
//!
//! Two small analyses prepare the graph for the layout heuristics:
//! fall-through capability flagging (which edges could become fall-throughs
//! if their destination were placed next) and DFS back-edge marking (which
//! edges close loops).

use super::{BlockId, FlowGraph};

/// Mark every edge that could be turned into a fall-through.
///
/// An edge that currently falls through obviously can. A simple direct
/// unconditional jump can be deleted outright if layout places its target
/// next, so its single outgoing edge also qualifies. When a block ends in
/// an invertible conditional jump, both of its outgoing edges qualify:
/// either arm may be placed next and the condition inverted to suit.
pub fn set_can_fallthru_flags(graph: &mut FlowGraph) {
    use super::insn::{InsnKind, JumpTarget};

    for bb in graph.real_blocks_in_order() {
        let succs = graph.block(bb).succs.clone();
        for &e in &succs {
            let fallthru = graph.edge(e).fallthru;
            graph.edge_mut(e).can_fallthru = fallthru;
        }
        let last_kind = graph.block(bb).last_insn().map(|i| i.kind);
        match last_kind {
            Some(InsnKind::CondJump { .. }) if succs.len() == 2 => {
                for &e in &succs {
                    graph.edge_mut(e).can_fallthru = true;
                }
            }
            Some(InsnKind::Jump(JumpTarget::Label(_))) if succs.len() == 1 => {
                graph.edge_mut(succs[0]).can_fallthru = true;
            }
            _ => {}
        }
    }
}

/// Mark DFS back edges: edges whose destination is an ancestor on the
/// depth-first spanning tree rooted at the entry block.
pub fn mark_dfs_back_edges(graph: &mut FlowGraph) {
    let n = graph.block_count();
    let mut visited = vec![false; n];
    let mut on_stack = vec![false; n];

    // Iterative DFS; each frame remembers how far through the successor
    // list it has advanced.
    let mut stack: Vec<(BlockId, usize)> = vec![(BlockId::ENTRY, 0)];
    visited[BlockId::ENTRY.index()] = true;
    on_stack[BlockId::ENTRY.index()] = true;

    while let Some(&(bb, next_succ)) = stack.last() {
        if next_succ < graph.block(bb).succs.len() {
            stack.last_mut().expect("frame present").1 += 1;
            let e = graph.block(bb).succs[next_succ];
            let dst = graph.edge(e).dst;
            graph.edge_mut(e).dfs_back = on_stack[dst.index()];
            if !visited[dst.index()] {
                visited[dst.index()] = true;
                on_stack[dst.index()] = true;
                stack.push((dst, 0));
            }
        } else {
            on_stack[bb.index()] = false;
            stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{FlowGraphBuilder, PROB_BASE};

    #[test]
    fn test_fallthru_edges_can_fallthru() {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(1000, 100);
        let c = b.block(1000, 100);
        let e = b.fallthru(a, c);
        b.ret(c);
        let mut g = b.finish();

        set_can_fallthru_flags(&mut g);
        assert!(g.edge(e).can_fallthru);
    }

    #[test]
    fn test_condjump_arms_can_fallthru() {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(1000, 100);
        let t = b.block(500, 50);
        let f = b.block(500, 50);
        let (taken, fall) = b.cond(a, t, f, PROB_BASE / 2);
        b.ret(t);
        b.ret(f);
        let mut g = b.finish();

        set_can_fallthru_flags(&mut g);
        assert!(g.edge(taken).can_fallthru);
        assert!(g.edge(fall).can_fallthru);
    }

    #[test]
    fn test_simple_jump_edge_can_fallthru() {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(1000, 100);
        let c = b.block(1000, 100);
        let e = b.branch(a, c);
        b.ret(c);
        let mut g = b.finish();

        set_can_fallthru_flags(&mut g);
        assert!(g.edge(e).can_fallthru);
        // The return edge stays ineligible.
        let ret_edge = g.block(c).succs[0];
        assert!(!g.edge(ret_edge).can_fallthru);
    }

    #[test]
    fn test_back_edge_marked_on_loop() {
        let mut b = FlowGraphBuilder::new();
        let head = b.block(10_000, 1000);
        let body = b.block(9000, 900);
        let exit = b.block(1000, 100);
        let (_, to_body) = b.cond(head, exit, body, 1000);
        let back = b.branch(body, head);
        b.ret(exit);
        let mut g = b.finish();

        mark_dfs_back_edges(&mut g);
        assert!(g.edge(back).dfs_back);
        assert!(!g.edge(to_body).dfs_back);
    }

    #[test]
    fn test_diamond_has_no_back_edges() {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(1000, 100);
        let l = b.block(500, 50);
        let r = b.block(500, 50);
        let j = b.block(1000, 100);
        b.cond(a, l, r, PROB_BASE / 2);
        b.branch(l, j);
        b.fallthru(r, j);
        b.ret(j);
        let mut g = b.finish();

        mark_dfs_back_edges(&mut g);
        for i in 0..g.edge_count() {
            assert!(!g.edge(crate::cfg::EdgeId(i as u32)).dfs_back);
        }
    }
}
