//! Hot/cold classification and section markers
//!
//! Profile data splits blocks into a hot partition (stays in the primary
//! text section) and a cold partition (emitted into the unlikely-executed
//! section). Edges between the partitions are "crossing" edges; the
//! surgery in [`super::fixup`] rewrites the graph so every crossing
//! transfer survives arbitrary distance between the sections.

use crate::cfg::{BlockId, EdgeId, FlowGraph, Insn, NoteKind, Partition};
use log::debug;

/// Assign every block to a partition and collect the crossing edges.
///
/// A block goes cold iff its profile predicts it never executes. An edge
/// crosses iff both endpoints are real blocks with different partitions.
pub(crate) fn find_rarely_executed_basic_blocks_and_crossing_edges(
    graph: &mut FlowGraph,
) -> Vec<EdgeId> {
    let mut n_cold = 0usize;
    for bb in graph.real_blocks_in_order() {
        let partition = if graph.block(bb).probably_never_executed() {
            n_cold += 1;
            Partition::Cold
        } else {
            Partition::Hot
        };
        graph.block_mut(bb).partition = partition;
    }
    debug!(
        "partitioned {} blocks, {} cold",
        graph.n_real_blocks(),
        n_cold
    );

    let mut crossing_edges = Vec::new();
    for bb in graph.real_blocks_in_order() {
        let succs = graph.block(bb).succs.clone();
        for &e in &succs {
            let (src, dst) = {
                let edge = graph.edge(e);
                (edge.src, edge.dst)
            };
            let crosses = !src.is_entry()
                && !dst.is_exit()
                && graph.block(src).partition != graph.block(dst).partition;
            graph.edge_mut(e).crossing = crosses;
            if crosses {
                crossing_edges.push(e);
            }
        }
    }
    debug!("{} crossing edges", crossing_edges.len());
    crossing_edges
}

/// Stamp every cold block with the unlikely-executed note the emitter uses
/// to select the cold section.
///
/// The note lands before the block's first real instruction, or at the end
/// when the block holds only labels and notes.
pub(crate) fn add_unlikely_executed_notes(graph: &mut FlowGraph) {
    let cold: Vec<BlockId> = graph
        .real_blocks_in_order()
        .into_iter()
        .filter(|&bb| graph.block(bb).partition == Partition::Cold)
        .collect();
    for bb in cold {
        mark_bb_for_unlikely_executed_section(graph, bb);
    }
}

fn mark_bb_for_unlikely_executed_section(graph: &mut FlowGraph, bb: BlockId) {
    let block = graph.block_mut(bb);
    let note = Insn::note(NoteKind::UnlikelyExecutedCode);
    match block
        .insns
        .iter()
        .position(|i| !i.is_note() && !i.is_label())
    {
        Some(pos) => block.insns.insert(pos, note),
        None => block.insns.push(note),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{FlowGraphBuilder, InsnKind};

    #[test]
    fn test_classifier_covers_every_block() {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 1000);
        let dead = b.block(0, 0);
        let live = b.block(9000, 900);
        b.cond(a, dead, live, 1000);
        b.ret(dead);
        b.ret(live);
        let mut g = b.finish();

        let crossing = find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);

        assert_eq!(g.block(a).partition, Partition::Hot);
        assert_eq!(g.block(dead).partition, Partition::Cold);
        assert_eq!(g.block(live).partition, Partition::Hot);
        // Only A -> dead crosses; edges to the exit block never do.
        assert_eq!(crossing.len(), 1);
        assert_eq!(g.edge(crossing[0]).dst, dead);
        assert!(g.edge(crossing[0]).crossing);
    }

    #[test]
    fn test_classifier_is_idempotent() {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 1000);
        let dead = b.block(0, 0);
        b.fallthru(a, dead);
        b.ret(dead);
        let mut g = b.finish();

        let first = find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);
        let p1: Vec<Partition> = g.real_blocks_in_order().iter().map(|&b| g.block(b).partition).collect();
        let second = find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);
        let p2: Vec<Partition> = g.real_blocks_in_order().iter().map(|&b| g.block(b).partition).collect();
        assert_eq!(first, second);
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_unlikely_note_lands_after_labels() {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 1000);
        let dead = b.block(0, 0);
        let live = b.block(9000, 900);
        b.cond(a, dead, live, 1000); // the taken arm gives `dead` a head label
        b.op(dead, 2);
        b.ret(dead);
        b.ret(live);
        let mut g = b.finish();

        find_rarely_executed_basic_blocks_and_crossing_edges(&mut g);
        add_unlikely_executed_notes(&mut g);

        let insns = &g.block(dead).insns;
        assert!(insns[0].is_label());
        assert!(matches!(
            insns[1].kind,
            InsnKind::Note(NoteKind::UnlikelyExecutedCode)
        ));
        // Hot blocks stay unmarked.
        assert!(!g.block(a).insns.iter().any(|i| i.is_note()));
    }
}
