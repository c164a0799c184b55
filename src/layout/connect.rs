//! Trace connection
//!
//! After trace formation every block sits on exactly one trace; this stage
//! stitches the traces into a single chain, preferring natural
//! fall-throughs. For each unconnected trace it first walks backward along
//! the best fall-through-capable predecessors, then forward along the best
//! successors, and when no direct continuation exists it may duplicate one
//! small in-between block to manufacture a fall-through. With partitioning
//! enabled, cold traces are held back until every hot trace is placed.

use super::trace::{TraceCtx, DUPLICATION_THRESHOLD};
use crate::cfg::{BlockId, EdgeId, Partition};
use log::debug;

impl<'a> TraceCtx<'a> {
    /// Connect all traces into one chain; returns the chain head.
    pub fn connect_traces(&mut self) -> BlockId {
        let n_traces = self.traces.len();
        assert!(n_traces > 0, "connecting an empty trace set");

        let freq_threshold = self.max_entry_frequency * DUPLICATION_THRESHOLD / 1000;
        let count_threshold = if self.max_entry_count < u64::MAX / 1000 {
            self.max_entry_count * DUPLICATION_THRESHOLD as u64 / 1000
        } else {
            self.max_entry_count / 1000 * DUPLICATION_THRESHOLD as u64
        };

        let mut connected = vec![false; n_traces];
        let mut cold_traces = vec![false; n_traces];
        let mut cold_connected = true;
        let mut unconnected_hot_trace_count = 0usize;
        let mut last_trace: Option<usize> = None;

        // Cold traces are parked until the hot traces have all been placed,
        // then released and connected among themselves.
        if self.config.partition_hot_cold {
            for (i, t) in self.traces.iter().enumerate() {
                if self.graph.block(t.first).partition == Partition::Cold {
                    connected[i] = true;
                    cold_traces[i] = true;
                    cold_connected = false;
                } else {
                    unconnected_hot_trace_count += 1;
                }
            }
        }

        let mut i = 0usize;
        while i < n_traces || !cold_connected {
            let mut t = i;

            if self.config.partition_hot_cold
                && (i >= n_traces || unconnected_hot_trace_count == 0)
                && !cold_connected
            {
                // All hot traces are placed; release the cold ones and
                // resume from the first of them.
                let mut first_cold_trace = None;
                for (j, &is_cold) in cold_traces.iter().enumerate() {
                    if is_cold {
                        connected[j] = false;
                        if first_cold_trace.is_none() {
                            first_cold_trace = Some(j);
                        }
                    }
                }
                let fc = first_cold_trace.expect("cold traces exist when cold_connected is unset");
                i = fc;
                t = fc;
                cold_connected = true;
            }

            if connected[t] {
                i += 1;
                continue;
            }
            connected[t] = true;
            unconnected_hot_trace_count = unconnected_hot_trace_count.saturating_sub(1);

            // Walk backward: chain the best unconnected predecessor traces
            // in front of this one.
            let mut t2 = t;
            while t2 > 0 {
                let mut best: Option<EdgeId> = None;
                let mut best_len = 0usize;
                let preds = self.graph.block(self.traces[t2].first).preds.clone();
                for &e in &preds {
                    let edge = self.graph.edge(e);
                    if edge.src.is_entry() || !edge.can_fallthru || edge.complex {
                        continue;
                    }
                    let Some(et) = self.bbd[edge.src.index()].end_of_trace else {
                        continue;
                    };
                    if connected[et] {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some(b) => {
                            let bp = self.graph.edge(b).probability;
                            edge.probability > bp
                                || (edge.probability == bp && self.traces[et].length > best_len)
                        }
                    };
                    if better {
                        best = Some(e);
                        best_len = self.traces[et].length;
                    }
                }
                let Some(b) = best else { break };
                let (src, dst) = {
                    let edge = self.graph.edge(b);
                    (edge.src, edge.dst)
                };
                debug!("connection: {} {}", src, dst);
                self.graph.block_mut(src).layout.next = Some(dst);
                t2 = self.bbd[src.index()].end_of_trace.expect("predecessor ends a trace");
                connected[t2] = true;
                unconnected_hot_trace_count = unconnected_hot_trace_count.saturating_sub(1);
            }

            if let Some(lt) = last_trace {
                let tail = self.traces[lt].last;
                self.graph.block_mut(tail).layout.next = Some(self.traces[t2].first);
            }
            last_trace = Some(t);

            // Walk forward: chain the best unconnected successor traces, or
            // manufacture a fall-through by copying one block.
            loop {
                let mut best: Option<EdgeId> = None;
                let mut best_len = 0usize;
                let succs = self.graph.block(self.traces[t].last).succs.clone();
                for &e in &succs {
                    let edge = self.graph.edge(e);
                    if edge.dst.is_exit() || !edge.can_fallthru || edge.complex {
                        continue;
                    }
                    let Some(st) = self.bbd[edge.dst.index()].start_of_trace else {
                        continue;
                    };
                    if connected[st] {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some(b) => {
                            let bp = self.graph.edge(b).probability;
                            edge.probability > bp
                                || (edge.probability == bp && self.traces[st].length > best_len)
                        }
                    };
                    if better {
                        best = Some(e);
                        best_len = self.traces[st].length;
                    }
                }

                if let Some(b) = best {
                    let dst = self.graph.edge(b).dst;
                    debug!("connection: {} {}", self.graph.edge(b).src, dst);
                    t = self.bbd[dst.index()].start_of_trace.expect("successor starts a trace");
                    let tail = self.traces[last_trace.expect("a trace was placed")].last;
                    self.graph.block_mut(tail).layout.next = Some(self.traces[t].first);
                    connected[t] = true;
                    unconnected_hot_trace_count = unconnected_hot_trace_count.saturating_sub(1);
                    last_trace = Some(t);
                    continue;
                }

                // No direct continuation. Look for a pair of edges
                // tail -> m -> n where n either exits or starts an
                // unconnected trace, so that copying m yields a
                // fall-through into n's trace.
                let mut next_bb: Option<BlockId> = None;
                let mut try_copy = false;

                for &e in &succs {
                    let edge = self.graph.edge(e);
                    if edge.dst.is_exit() || !edge.can_fallthru || edge.complex {
                        continue;
                    }
                    if let Some(b) = best {
                        if edge.probability <= self.graph.edge(b).probability {
                            continue;
                        }
                    }
                    let m = edge.dst;

                    // A one-block trace as destination is already the whole
                    // continuation; no need to look past it.
                    if let Some(st) = self.bbd[m.index()].start_of_trace {
                        if self.traces[st].length == 1 {
                            best = Some(e);
                            try_copy = true;
                            continue;
                        }
                    }

                    // Each candidate searches m's successors from scratch.
                    let mut best2: Option<EdgeId> = None;
                    let mut best2_len: i64 = 0;

                    let m_succs = self.graph.block(m).succs.clone();
                    for &e2 in &m_succs {
                        let edge2 = self.graph.edge(e2);
                        let di = edge2.dst;

                        let acceptable = if di.is_exit() {
                            true
                        } else {
                            edge2.can_fallthru
                                && !edge2.complex
                                && self.bbd[di.index()]
                                    .start_of_trace
                                    .map_or(false, |st| !connected[st])
                                && self.graph.edge_frequency(e2) >= freq_threshold
                                && edge2.count >= count_threshold
                                && (match best2 {
                                    None => true,
                                    Some(b2) => {
                                        let b2p = self.graph.edge(b2).probability;
                                        edge2.probability > b2p
                                            || (edge2.probability == b2p
                                                && self.bbd[di.index()]
                                                    .start_of_trace
                                                    .map_or(0, |st| self.traces[st].length)
                                                    as i64
                                                    > best2_len)
                                    }
                                })
                        };

                        if acceptable {
                            best = Some(e);
                            best2 = Some(e2);
                            best2_len = if di.is_exit() {
                                i64::MAX
                            } else {
                                self.bbd[di.index()]
                                    .start_of_trace
                                    .map_or(0, |st| self.traces[st].length)
                                    as i64
                            };
                            next_bb = Some(di);
                            try_copy = true;
                        }
                    }
                }

                // Duplication would put hot code on both sides of the
                // section boundary; never copy while partitioning.
                if self.config.partition_hot_cold {
                    try_copy = false;
                }

                // Copy tiny blocks always; larger ones only when the edge
                // is traversed frequently enough.
                let can_copy = try_copy && {
                    let b = best.expect("try_copy implies a candidate edge");
                    let code_may_grow = !self.config.optimize_size
                        && self.graph.edge_frequency(b) >= freq_threshold
                        && self.graph.edge(b).count >= count_threshold;
                    self.copy_bb_p(self.graph.edge(b).dst, code_may_grow)
                };

                if !can_copy {
                    break;
                }

                let b = best.expect("checked above");
                let m = self.graph.edge(b).dst;
                debug!(
                    "connection: {} {} via copy, continuing at {:?}",
                    self.traces[t].last, m, next_bb
                );
                let tail = self.traces[t].last;
                let new_bb = self.copy_bb(m, b, tail, t as u32 + 1);
                self.traces[t].last = new_bb;

                match next_bb {
                    Some(n) if !n.is_exit() => {
                        t = self.bbd[n.index()].start_of_trace.expect("continuation starts a trace");
                        let tail = self.traces[last_trace.expect("a trace was placed")].last;
                        self.graph.block_mut(tail).layout.next = Some(self.traces[t].first);
                        connected[t] = true;
                        unconnected_hot_trace_count = unconnected_hot_trace_count.saturating_sub(1);
                        last_trace = Some(t);
                    }
                    _ => break,
                }
            }

            i += 1;
        }

        debug_assert!(connected.iter().all(|&c| c), "every trace must be placed");

        let head = self.traces[0].first;
        if log::log_enabled!(log::Level::Debug) {
            let mut order = Vec::new();
            let mut cur = Some(head);
            while let Some(bb) = cur {
                order.push(bb.to_string());
                cur = self.graph.block(bb).layout.next;
            }
            debug!("final order: {}", order.join(" "));
        }
        head
    }
}

#[cfg(test)]
mod tests {
    use super::super::trace::TraceCtx;
    use super::super::LayoutConfig;
    use crate::cfg::{mark_dfs_back_edges, set_can_fallthru_flags, BlockId, FlowGraphBuilder};
    use crate::target::HostTarget;

    fn chain_from(graph: &crate::cfg::FlowGraph, first: BlockId) -> Vec<BlockId> {
        let mut order = vec![first];
        let mut cur = first;
        while let Some(next) = graph.block(cur).layout.next {
            order.push(next);
            cur = next;
        }
        order
    }

    #[test]
    fn test_traces_connect_by_fallthrough() {
        // A hot diamond: the off-trace arm reattaches behind the join.
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 10_000);
        let hot = b.block(9000, 9000);
        let rare = b.block(1000, 1000);
        let join = b.block(10_000, 10_000);
        b.cond(a, rare, hot, 1000);
        b.op(join, 10);
        b.fallthru(hot, join);
        b.branch(rare, join);
        b.ret(join);
        let mut g = b.finish();
        set_can_fallthru_flags(&mut g);
        mark_dfs_back_edges(&mut g);

        let target = HostTarget::default();
        let mut ctx = TraceCtx::new(&mut g, &target, LayoutConfig::default());
        ctx.find_traces();
        let head = ctx.connect_traces();

        let chain = chain_from(ctx.graph, head);
        assert_eq!(chain.len(), 4);
        assert_eq!(&chain[..3], &[a, hot, join]);
        assert!(chain.contains(&rare));
    }

    #[test]
    fn test_connector_duplicates_small_join_block() {
        // D is a tiny join block; the trace ending at C earns a copy of D
        // instead of a jump back into B's trace.
        let mut b = FlowGraphBuilder::new();
        let a = b.block(10_000, 10_000);
        let hot = b.block(9000, 9000);
        let cold = b.block(1000, 1000);
        let join = b.block(10_000, 10_000);
        b.cond(a, cold, hot, 1000);
        b.fallthru(hot, join);
        b.fallthru(cold, join);
        b.ret(join);
        let mut g = b.finish();
        set_can_fallthru_flags(&mut g);
        mark_dfs_back_edges(&mut g);

        let blocks_before = g.block_count();
        let target = HostTarget::default();
        let mut ctx = TraceCtx::new(&mut g, &target, LayoutConfig::default());
        ctx.find_traces();
        let head = ctx.connect_traces();

        assert_eq!(ctx.n_duplicated, 1);
        assert_eq!(ctx.graph.block_count(), blocks_before + 1);

        let chain = chain_from(ctx.graph, head);
        // Every block appears exactly once, including the copy.
        assert_eq!(chain.len(), ctx.graph.n_real_blocks());
        let copy = BlockId::new(blocks_before as u32);
        assert_eq!(&chain[..], &[a, hot, join, cold, copy]);
    }
}
