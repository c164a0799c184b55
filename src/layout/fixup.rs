//! Partition CFG surgery
//!
//! Blocks in different sections are not contiguous in the object file, so
//! a crossing transfer can neither fall through nor rely on a short-range
//! branch. The surgery runs in a fixed sequence:
//!
//! 1. label every crossing destination and turn crossing pure
//!    fall-throughs into explicit jumps;
//! 2. repair blocks whose fall-through edge crosses, by inverting the
//!    conditional or materializing a forwarding block;
//! 3. on targets without long conditional branches, retarget crossing
//!    conditionals at same-section thunk blocks;
//! 4. on targets without long unconditional branches, rewrite crossing
//!    direct jumps as indirect jumps;
//! 5. annotate every remaining crossing jump for the emitter.
//!
//! The order is load-bearing: step 2 depends on the labels from step 1,
//! and step 3 assumes no crossing fall-throughs remain.

use crate::cfg::{
    BlockId, EdgeId, FlowGraph, Insn, InsnKind, JumpTarget, RegNote, PROB_BASE,
};
use crate::target::Target;
use log::debug;

/// Run the full surgery sequence over the collected crossing edges.
pub(crate) fn fix_edges_for_rarely_executed_code(
    graph: &mut FlowGraph,
    target: &dyn Target,
    crossing_edges: &[EdgeId],
) {
    add_labels_and_missing_jumps(graph, crossing_edges);
    fix_up_fall_thru_edges(graph);

    if !target.has_long_cond_branch() {
        fix_crossing_conditional_branches(graph, target);
    }

    if !target.has_long_uncond_branch() {
        let regs_before = graph.max_reg();
        fix_crossing_unconditional_branches(graph);
        if graph.max_reg() > regs_before {
            // Indirect jumps introduced fresh pseudos; downstream register
            // information must be recomputed from the graph's counter.
            debug!(
                "indirect-jump rewriting allocated {} new registers",
                graph.max_reg() - regs_before
            );
        }
    }

    add_reg_crossing_jump_notes(graph);
}

/// Give every crossing destination a label, and give every crossing source
/// that simply falls off its end an explicit jump (plus a barrier in the
/// footer). The repaired edge stops being a fall-through.
pub(crate) fn add_labels_and_missing_jumps(graph: &mut FlowGraph, crossing_edges: &[EdgeId]) {
    for &e in crossing_edges {
        let (src, dst) = {
            let edge = graph.edge(e);
            (edge.src, edge.dst)
        };
        if src.is_entry() || dst.is_exit() {
            continue;
        }

        let label = graph.block_label(dst);

        if graph.block(src).ends_in_jump() {
            continue;
        }
        // The source just falls through.
        if graph.block(src).succs.len() != 1 {
            panic!(
                "{} has two successors but does not end in a jump",
                src
            );
        }
        graph
            .block_mut(src)
            .insns
            .push(Insn::jump(JumpTarget::Label(label)));
        graph.block_mut(src).layout.footer.push(Insn::barrier());
        graph.edge_mut(e).fallthru = false;
        debug!("added crossing jump {} -> {}", src, dst);
    }
}

/// Repair every block whose fall-through edge crosses the boundary.
///
/// When the block also has a non-crossing conditional arm pointing at the
/// layout-next block, inverting the condition swaps the arms so the
/// fall-through stays in-section. Otherwise a forwarding block is
/// materialized on the fall-through edge, placed in the source's section,
/// with its outgoing jump carrying the crossing.
pub(crate) fn fix_up_fall_thru_edges(graph: &mut FlowGraph) {
    for cur_bb in graph.real_blocks_in_order() {
        let succs = graph.block(cur_bb).succs.clone();
        let succ1 = succs.first().copied();
        let succ2 = succs.get(1).copied();

        let (fall_thru, cond_jump) = if succ1.map_or(false, |e| graph.edge(e).fallthru) {
            (succ1, succ2)
        } else if succ2.map_or(false, |e| graph.edge(e).fallthru) {
            (succ2, succ1)
        } else {
            (None, None)
        };

        let Some(fall_thru) = fall_thru else { continue };
        if graph.edge(fall_thru).dst.is_exit() || !graph.edge(fall_thru).crossing {
            continue;
        }

        let mut cond_jump_crosses = true;
        let mut invert_worked = false;

        if let Some(cond_jump) = cond_jump {
            if !graph.edge(cond_jump).crossing {
                cond_jump_crosses = false;
            }

            // The fall-through crosses but the jump arm does not; if the
            // jump arm is the layout-next block, inverting the condition
            // swaps the roles and no new block is needed.
            if !cond_jump_crosses
                && graph.block(cur_bb).layout.next == Some(graph.edge(cond_jump).dst)
            {
                let fall_thru_label = graph.block_label(graph.edge(fall_thru).dst);
                invert_worked = graph.invert_jump(cur_bb, fall_thru_label);
                if invert_worked {
                    debug!("inverted condition in {}", cur_bb);
                    graph.edge_mut(fall_thru).fallthru = false;
                    graph.edge_mut(cond_jump).fallthru = true;
                    graph.edge_mut(fall_thru).crossing = true;
                    graph.edge_mut(cond_jump).crossing = false;
                }
            }
        }

        if cond_jump_crosses || !invert_worked {
            // Both arms cross (or inversion failed): give the fall-through
            // its own forwarding block in this section.
            let new_bb = graph.force_nonfallthru(fall_thru);

            let cur_next = graph.block(cur_bb).layout.next;
            graph.block_mut(new_bb).layout.next = cur_next;
            graph.block_mut(cur_bb).layout.next = Some(new_bb);

            let partition = graph.block(cur_bb).partition;
            graph.block_mut(new_bb).partition = partition;

            // The transfer into the forwarder stays in-section; its
            // outgoing jump carries the crossing instead.
            graph.edge_mut(fall_thru).crossing = false;
            let out = graph.single_succ(new_bb).expect("forwarder has one successor");
            graph.edge_mut(out).crossing = true;

            graph.block_mut(new_bb).layout.footer.push(Insn::barrier());
        }
    }
}

/// Look for an existing thunk among the destination's crossing
/// predecessors: a block that starts with a label and whose only real
/// instruction is an unconditional jump.
fn find_jump_block(graph: &FlowGraph, jump_dest: BlockId) -> Option<BlockId> {
    for &e in &graph.block(jump_dest).preds {
        if !graph.edge(e).crossing {
            continue;
        }
        let src = graph.edge(e).src;
        let block = graph.block(src);
        if block.head_label().is_none() {
            continue;
        }
        if block.insns.iter().filter(|i| i.is_real()).count() != 1 {
            continue;
        }
        if matches!(block.last_insn().map(|i| i.kind), Some(InsnKind::Jump(_))) {
            return Some(src);
        }
    }
    None
}

/// Retarget every crossing conditional branch at a thunk block in the
/// source's section; the thunk jumps (or returns) on the conditional's
/// behalf and its outgoing edge carries the crossing.
pub(crate) fn fix_crossing_conditional_branches(graph: &mut FlowGraph, target: &dyn Target) {
    let mut last_bb = graph
        .exit()
        .prev_bb
        .expect("graph with real blocks has a physical last block");

    for cur_bb in graph.real_blocks_in_order() {
        let succs = graph.block(cur_bb).succs.clone();
        // Fall-throughs were repaired already, so at most one successor
        // can cross.
        let crossing_edge = succs
            .first()
            .copied()
            .filter(|&e| graph.edge(e).crossing)
            .or_else(|| succs.get(1).copied().filter(|&e| graph.edge(e).crossing));
        let Some(crossing_edge) = crossing_edge else {
            continue;
        };

        let old_target = match graph.block(cur_bb).last_insn().map(|i| i.kind) {
            Some(InsnKind::CondJump { target }) => target,
            _ => continue,
        };

        // Reuse a thunk if one already jumps where we need to go.
        let dest = graph.edge(crossing_edge).dst;
        let (new_bb, new_label) = match find_jump_block(graph, dest) {
            Some(bb) => {
                let label = graph
                    .block(bb)
                    .head_label()
                    .expect("thunk starts with a label");
                (bb, label)
            }
            None => {
                let new_bb = graph.create_basic_block(last_bb);
                let last_next = graph.block(last_bb).layout.next;
                graph.block_mut(new_bb).layout.next = last_next;
                graph.block_mut(last_bb).layout.next = Some(new_bb);
                let prev_bb = last_bb;
                last_bb = new_bb;

                // The thunk executes exactly when the branch is taken.
                let freq = graph.edge_frequency(crossing_edge).max(0) as u32;
                let count = graph.edge(crossing_edge).count;
                graph.block_mut(new_bb).frequency = freq;
                graph.block_mut(new_bb).count = count;

                let live = graph.block(prev_bb).live_at_end.clone();
                graph.block_mut(new_bb).live_at_start = live.clone();
                graph.block_mut(new_bb).live_at_end = live;

                let new_label = graph.new_label();
                graph.block_mut(new_bb).insns.push(Insn::label(new_label));

                match old_target {
                    JumpTarget::Label(old_label) => {
                        graph
                            .block_mut(new_bb)
                            .insns
                            .push(Insn::jump(JumpTarget::Label(old_label)));
                    }
                    JumpTarget::Return => {
                        if !target.has_return() {
                            panic!(
                                "crossing conditional in {} targets a return on a target without return instructions",
                                cur_bb
                            );
                        }
                        graph.block_mut(new_bb).insns.push(Insn::ret());
                    }
                }
                graph.block_mut(new_bb).layout.footer.push(Insn::barrier());

                let partition = graph.block(cur_bb).partition;
                graph.block_mut(new_bb).partition = partition;

                debug!("thunked crossing conditional {} -> {} via {}", cur_bb, dest, new_bb);
                (new_bb, new_label)
            }
        };

        // Branch to the thunk instead; the thunk's own jump crosses.
        graph.redirect_jump(cur_bb, new_label);
        graph.redirect_edge_succ(crossing_edge, new_bb);

        let new_edge = match graph.single_succ(new_bb) {
            Some(e) => e,
            None => graph.make_edge(new_bb, dest, PROB_BASE),
        };
        graph.edge_mut(crossing_edge).crossing = false;
        graph.edge_mut(new_edge).crossing = true;
    }
}

/// Rewrite every crossing unconditional direct jump as an indirect jump
/// through a fresh pseudo register; indirect jumps reach anywhere.
pub(crate) fn fix_crossing_unconditional_branches(graph: &mut FlowGraph) {
    for cur_bb in graph.real_blocks_in_order() {
        let Some(succ) = graph.block(cur_bb).succs.first().copied() else {
            continue;
        };
        if !graph.edge(succ).crossing {
            continue;
        }
        let Some(last) = graph.block(cur_bb).last_insn() else {
            continue;
        };
        if !last.is_jump() {
            continue;
        }
        if last.is_any_condjump() {
            panic!(
                "crossing conditional jump in {} survived conditional-branch fixup",
                cur_bb
            );
        }
        // Already long-range.
        if last.is_computed_jump() || last.is_tablejump() {
            continue;
        }
        let label = match last.kind {
            InsnKind::Jump(JumpTarget::Label(l)) => l,
            _ => continue,
        };

        let reg = graph.new_reg();
        let block = graph.block_mut(cur_bb);
        block.insns.pop();
        block.insns.push(Insn::load_label_addr(reg, label));
        block.insns.push(Insn::indirect_jump(reg));
        debug!("rewrote crossing jump in {} as indirect through r{}", cur_bb, reg);
    }
}

/// Annotate every jump whose outgoing edge crosses, so the emitter knows
/// not to shorten it.
pub(crate) fn add_reg_crossing_jump_notes(graph: &mut FlowGraph) {
    for bb in graph.real_blocks_in_order() {
        let succs = graph.block(bb).succs.clone();
        for &e in &succs {
            if graph.edge(e).crossing && graph.block(bb).ends_in_jump() {
                graph
                    .block_mut(bb)
                    .last_insn_mut()
                    .expect("block ends in a jump")
                    .add_reg_note(RegNote::CrossingJump);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{FlowGraphBuilder, Partition};
    use crate::layout::partition::find_rarely_executed_basic_blocks_and_crossing_edges;
    use crate::target::HostTarget;

    /// A hot block conditionally branching into a cold block that falls
    /// back into hot code.
    fn cold_island() -> (FlowGraph, BlockId, BlockId, BlockId) {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 10_000);
        let cold = b.block(0, 0);
        let c = b.block(10_000, 10_000);
        b.op(a, 2);
        b.cond(a, cold, c, 1000);
        b.op(cold, 2);
        b.fallthru(cold, c);
        b.ret(c);
        let g = b.finish();
        (g, a, cold, c)
    }

    fn seed_layout_chain(graph: &mut FlowGraph) {
        let order = graph.real_blocks_in_order();
        for pair in order.windows(2) {
            graph.block_mut(pair[0]).layout.next = Some(pair[1]);
        }
        if let Some(&last) = order.last() {
            graph.block_mut(last).layout.next = None;
        }
    }

    #[test]
    fn test_missing_jump_is_added_on_crossing_fallthru() {
        let (mut g, _a, cold, c) = cold_island();
        seed_layout_chain(&mut g);
        let crossing = find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);

        assert!(!g.block(cold).ends_in_jump());
        add_labels_and_missing_jumps(&mut g, &crossing);

        // cold -> c became an explicit jump with a footer barrier.
        assert!(g.block(cold).ends_in_jump());
        assert!(g.block(cold).layout.footer.iter().any(|i| matches!(i.kind, InsnKind::Barrier)));
        let e = g.block(cold).succs[0];
        assert!(!g.edge(e).fallthru);
        // The destination now carries a label.
        assert!(g.block(c).head_label().is_some());
    }

    #[test]
    fn test_crossing_conditional_gets_a_thunk() {
        let (mut g, a, cold, _c) = cold_island();
        seed_layout_chain(&mut g);
        let crossing = find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);
        add_labels_and_missing_jumps(&mut g, &crossing);
        fix_up_fall_thru_edges(&mut g);

        let blocks_before = g.block_count();
        let target = HostTarget::default();
        fix_crossing_conditional_branches(&mut g, &target);

        // A new hot-section thunk took over the crossing.
        assert_eq!(g.block_count(), blocks_before + 1);
        let thunk = BlockId::new(blocks_before as u32);
        assert_eq!(g.block(thunk).partition, Partition::Hot);
        assert!(g.block(thunk).head_label().is_some());

        // a's conditional no longer crosses; the thunk's jump does.
        for &e in &g.block(a).succs {
            assert!(!g.edge(e).crossing);
        }
        let out = g.single_succ(thunk).unwrap();
        assert_eq!(g.edge(out).dst, cold);
        assert!(g.edge(out).crossing);
    }

    #[test]
    fn test_crossing_uncond_jump_becomes_indirect() {
        let (mut g, _a, cold, _c) = cold_island();
        seed_layout_chain(&mut g);
        let crossing = find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);
        add_labels_and_missing_jumps(&mut g, &crossing);
        fix_up_fall_thru_edges(&mut g);
        let target = HostTarget::default();
        fix_crossing_conditional_branches(&mut g, &target);

        let regs_before = g.max_reg();
        fix_crossing_unconditional_branches(&mut g);
        assert!(g.max_reg() > regs_before);

        // cold ends with load-address + indirect jump now.
        let n = g.block(cold).insns.len();
        assert!(matches!(
            g.block(cold).insns[n - 2].kind,
            InsnKind::LoadLabelAddr { .. }
        ));
        assert!(g.block(cold).last_insn().unwrap().is_computed_jump());
    }

    #[test]
    fn test_crossing_jumps_are_annotated() {
        let (mut g, _a, cold, _c) = cold_island();
        seed_layout_chain(&mut g);
        let crossing = find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);
        let target = HostTarget::default();
        fix_edges_for_rarely_executed_code(&mut g, &target, &crossing);

        let annotated = g
            .real_blocks_in_order()
            .into_iter()
            .filter(|&bb| {
                g.block(bb)
                    .last_insn()
                    .map_or(false, |i| i.has_reg_note(RegNote::CrossingJump))
            })
            .count();
        assert!(annotated >= 1);
        // Every annotated block really has a crossing outgoing edge.
        for bb in g.real_blocks_in_order() {
            let has_note = g
                .block(bb)
                .last_insn()
                .map_or(false, |i| i.has_reg_note(RegNote::CrossingJump));
            if has_note {
                assert!(g.block(bb).succs.iter().any(|&e| g.edge(e).crossing));
            }
        }
        // cold survived with the annotation on its (now indirect) jump.
        assert!(g
            .block(cold)
            .last_insn()
            .unwrap()
            .has_reg_note(RegNote::CrossingJump));
    }

    #[test]
    fn test_fall_thru_inversion_when_jump_arm_is_next() {
        // a conditionally jumps to hot `next` (the layout-next block) and
        // falls through into cold: inversion fixes it without new blocks.
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 10_000);
        let cold = b.block(0, 0);
        let next = b.block(10_000, 10_000);
        let (taken, fall) = b.cond(a, next, cold, 9000);
        b.ret(cold);
        b.ret(next);
        let mut g = b.finish();
        // Layout order a -> next -> cold, so the taken arm is layout-next.
        g.block_mut(a).layout.next = Some(next);
        g.block_mut(next).layout.next = Some(cold);
        g.block_mut(cold).layout.next = None;

        let crossing = find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);
        add_labels_and_missing_jumps(&mut g, &crossing);
        let blocks_before = g.block_count();
        fix_up_fall_thru_edges(&mut g);

        // No forwarding block; the arms swapped roles instead.
        assert_eq!(g.block_count(), blocks_before);
        assert!(!g.edge(fall).fallthru);
        assert!(g.edge(fall).crossing);
        assert!(g.edge(taken).fallthru);
        assert!(!g.edge(taken).crossing);
    }

    #[test]
    fn test_fall_thru_forwarder_when_inversion_impossible() {
        // a falls through into cold while its jump arm goes elsewhere in
        // the hot section; inversion does not apply, so a forwarding block
        // is materialized on the fall-through.
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 10_000);
        let cold = b.block(0, 0);
        let h = b.block(9000, 9000);
        b.cond(a, h, cold, 9000);
        b.ret(cold);
        b.ret(h);
        let mut g = b.finish();
        seed_layout_chain(&mut g);

        let crossing = find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);
        add_labels_and_missing_jumps(&mut g, &crossing);

        let blocks_before = g.block_count();
        fix_up_fall_thru_edges(&mut g);

        assert_eq!(g.block_count(), blocks_before + 1);
        let fwd = BlockId::new(blocks_before as u32);
        assert_eq!(g.block(fwd).partition, g.block(a).partition);
        let into = g.block(fwd).preds[0];
        assert!(g.edge(into).fallthru);
        assert!(!g.edge(into).crossing);
        let out = g.single_succ(fwd).unwrap();
        assert!(g.edge(out).crossing);
        assert!(!g.edge(out).fallthru);
        // No fall-through edge crosses the partition anywhere.
        for i in 0..g.edge_count() {
            let e = g.edge(crate::cfg::EdgeId(i as u32));
            if e.fallthru && !e.src.is_entry() && !e.dst.is_exit() {
                assert_eq!(g.block(e.src).partition, g.block(e.dst).partition);
            }
        }
    }
}
