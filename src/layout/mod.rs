//! Layout passes
//!
//! Two entry points operate on a [`FlowGraph`]:
//!
//! - [`reorder_basic_blocks`] rearranges the block order along the most
//!   probable fall-through paths (trace formation + connection);
//! - [`partition_hot_cold_basic_blocks`] splits blocks into hot and cold
//!   sections and rewrites the CFG so every cross-section transfer is
//!   physically realizable.
//!
//! In a full pipeline the partition pass runs first (it may create
//! pseudo registers, so it precedes register allocation) and the reorder
//! pass runs late with `partition_hot_cold` enabled in its config so cold
//! blocks are laid out last.

pub(crate) mod connect;
pub(crate) mod fixup;
pub(crate) mod heap;
pub(crate) mod partition;
pub(crate) mod trace;

use crate::cfg::FlowGraph;
use crate::target::Target;
use log::{debug, info};
use trace::TraceCtx;

/// Tunables for the layout passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutConfig {
    /// Hot/cold partitioning is in effect: trace formation reserves a
    /// final round for cold blocks, connection places cold traces last,
    /// and block duplication across the boundary is suppressed.
    pub partition_hot_cold: bool,

    /// Optimize for size: never duplicate blocks to win fall-throughs
    /// when that can grow the function.
    pub optimize_size: bool,
}

/// What [`reorder_basic_blocks`] did.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReorderStats {
    /// Traces formed
    pub n_traces: usize,

    /// Blocks duplicated while forming and connecting traces
    pub n_duplicated: usize,
}

/// What [`partition_hot_cold_basic_blocks`] did.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionStats {
    /// Blocks classified hot
    pub n_hot: usize,

    /// Blocks classified cold
    pub n_cold: usize,

    /// Edges found crossing the partition boundary
    pub n_crossing_edges: usize,
}

/// Reorder the basic blocks of `graph` to maximize fall-through frequency.
///
/// The new order is committed to the physical chain and also remains
/// available through the layout side-band. Returns early (no mutation) for
/// graphs with at most one real block and for targets that forbid jump
/// modification.
pub fn reorder_basic_blocks(
    graph: &mut FlowGraph,
    target: &dyn Target,
    config: &LayoutConfig,
) -> ReorderStats {
    if graph.n_real_blocks() <= 1 {
        return ReorderStats::default();
    }
    if target.cannot_modify_jumps() {
        debug!("target forbids jump modification; not reordering");
        return ReorderStats::default();
    }

    // Fresh side-band: no block claimed, no chain. Footers survive from
    // earlier surgery.
    for bb in graph.real_blocks_in_order() {
        let layout = &mut graph.block_mut(bb).layout;
        layout.next = None;
        layout.visited = 0;
    }

    crate::cfg::set_can_fallthru_flags(graph);
    crate::cfg::mark_dfs_back_edges(graph);

    let mut ctx = TraceCtx::new(graph, target, *config);
    ctx.find_traces();
    let head = ctx.connect_traces();

    let stats = ReorderStats {
        n_traces: ctx.traces.len(),
        n_duplicated: ctx.n_duplicated,
    };
    drop(ctx);

    if config.partition_hot_cold {
        partition::add_unlikely_executed_notes(graph);
    }

    graph.relink_physical_order(head);

    info!(
        "reordered {} blocks into {} traces ({} duplicated)",
        graph.n_real_blocks(),
        stats.n_traces,
        stats.n_duplicated
    );
    stats
}

/// Split `graph` into hot and cold partitions and repair every edge that
/// crosses the boundary.
///
/// Returns early (no mutation) for graphs with at most one real block.
pub fn partition_hot_cold_basic_blocks(graph: &mut FlowGraph, target: &dyn Target) -> PartitionStats {
    if graph.n_real_blocks() <= 1 {
        return PartitionStats::default();
    }

    // Seed the layout chain from the current physical order; the surgery
    // splices its new blocks into this chain.
    let order = graph.real_blocks_in_order();
    for pair in order.windows(2) {
        graph.block_mut(pair[0]).layout.next = Some(pair[1]);
    }
    let head = order[0];
    let last = *order.last().expect("at least two real blocks");
    graph.block_mut(last).layout.next = None;

    let crossing_edges = partition::find_rarely_executed_basic_blocks_and_crossing_edges(graph);

    let stats = {
        let mut n_cold = 0;
        for &bb in &order {
            if graph.block(bb).partition == crate::cfg::Partition::Cold {
                n_cold += 1;
            }
        }
        PartitionStats {
            n_hot: order.len() - n_cold,
            n_cold,
            n_crossing_edges: crossing_edges.len(),
        }
    };

    if !crossing_edges.is_empty() {
        fixup::fix_edges_for_rarely_executed_code(graph, target, &crossing_edges);
    }

    graph.relink_physical_order(head);

    info!(
        "partitioned {} hot / {} cold blocks, {} crossing edges",
        stats.n_hot, stats.n_cold, stats.n_crossing_edges
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{FlowGraphBuilder, Partition};
    use crate::target::HostTarget;

    #[test]
    fn test_single_block_function_is_untouched() {
        let mut b = FlowGraphBuilder::new();
        let only = b.block(10_000, 1000);
        b.ret(only);
        let mut g = b.finish();
        let before = g.clone();

        let target = HostTarget::default();
        let stats = reorder_basic_blocks(&mut g, &target, &LayoutConfig::default());
        assert_eq!(stats.n_traces, 0);
        let pstats = partition_hot_cold_basic_blocks(&mut g, &target);
        assert_eq!(pstats.n_crossing_edges, 0);

        assert_eq!(g.real_blocks_in_order(), before.real_blocks_in_order());
        assert_eq!(g.block(only).partition, Partition::Unset);
        assert_eq!(g.block_count(), before.block_count());
    }

    #[test]
    fn test_jump_hostile_target_blocks_reordering() {
        let mut b = FlowGraphBuilder::new();
        let x = b.block(10_000, 1000);
        let y = b.block(10_000, 1000);
        b.fallthru(x, y);
        b.ret(y);
        let mut g = b.finish();

        let target = HostTarget {
            cannot_modify_jumps: true,
            ..HostTarget::default()
        };
        let stats = reorder_basic_blocks(&mut g, &target, &LayoutConfig::default());
        assert_eq!(stats.n_traces, 0);
        assert_eq!(g.real_blocks_in_order(), vec![x, y]);
    }

    #[test]
    fn test_reorder_commits_physical_order() {
        // The hot path a -> c is separated by the rare block r in the
        // original order; reordering pulls c up.
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 10_000);
        let r = b.block(1000, 1000);
        let c = b.block(9000, 9000);
        b.cond(a, r, c, 1000);
        b.op(r, 10);
        b.branch(r, c);
        b.op(c, 10);
        b.ret(c);
        let mut g = b.finish();

        let target = HostTarget::default();
        let stats = reorder_basic_blocks(&mut g, &target, &LayoutConfig::default());

        assert_eq!(g.real_blocks_in_order(), vec![a, c, r]);
        assert!(stats.n_traces >= 2);
        assert_eq!(stats.n_duplicated, 0);
    }

    #[test]
    fn test_reorder_is_a_fixed_point() {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 10_000);
        let r = b.block(1000, 1000);
        let c = b.block(9000, 9000);
        b.cond(a, r, c, 1000);
        b.op(r, 10);
        b.branch(r, c);
        b.op(c, 10);
        b.ret(c);
        let mut g = b.finish();

        let target = HostTarget::default();
        reorder_basic_blocks(&mut g, &target, &LayoutConfig::default());
        let first_order = g.real_blocks_in_order();
        let blocks_after_first = g.block_count();

        reorder_basic_blocks(&mut g, &target, &LayoutConfig::default());
        assert_eq!(g.real_blocks_in_order(), first_order);
        assert_eq!(g.block_count(), blocks_after_first);
    }
}
