//! Greedy trace formation
//!
//! Traces are built in several rounds. Each round pulls seed blocks off a
//! priority heap and grows a trace from each seed by repeatedly appending
//! the most probable fall-through-capable successor. Successors that are
//! improbable or infrequent for the current round's thresholds become seeds
//! for a later round; the thresholds decay to zero so the final round
//! sweeps up everything. Loops closed by a trace are rotated so the hottest
//! exit ends the trace, and small loop headers may be duplicated to avoid
//! chained jumps.

use super::heap::TraceHeap;
use super::LayoutConfig;
use crate::cfg::{BlockId, EdgeId, FlowGraph, Partition, BB_FREQ_MAX, PROB_BASE};
use crate::target::Target;
use log::{debug, trace};

/// Number of trace-formation rounds. The last round only exists when
/// hot/cold partitioning is enabled and collects the cold blocks.
pub(crate) const N_ROUNDS: usize = 5;

/// Per-round branch probability floors, in per mille of [`PROB_BASE`].
const BRANCH_THRESHOLD: [i64; N_ROUNDS] = [400, 200, 100, 0, 0];

/// Per-round execution floors, in per mille of the entry frequency/count.
const EXEC_THRESHOLD: [i64; N_ROUNDS] = [500, 200, 50, 0, 0];

/// Edges below this per-mille share of the entry profile do not justify
/// duplicating their destination while connecting traces.
pub(crate) const DUPLICATION_THRESHOLD: i64 = 100;

/// Blocks with more successors than this are never duplicated.
const MAX_DUPLICATED_SUCCS: usize = 8;

/// Scratch arrays are allocated with this slack so duplication rarely
/// forces a regrow.
pub(crate) fn scratch_capacity(n: usize) -> usize {
    (n / 4 + 1) * 5
}

/// A linear run of blocks meant to be placed contiguously.
///
/// The member blocks are recovered by walking `first`'s layout chain up to
/// `last`.
#[derive(Debug, Clone)]
pub(crate) struct Trace {
    pub first: BlockId,
    pub last: BlockId,
    pub round: usize,
    pub length: usize,
}

/// Per-block scratch state for trace formation and connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockScratch {
    /// Trace this block starts, if any
    pub start_of_trace: Option<usize>,

    /// Trace this block ends, if any
    pub end_of_trace: Option<usize>,

    /// Whether the block currently sits in one of the round heaps
    pub in_heap: bool,
}

/// The two seed heaps of a round: blocks scheduled for this round and
/// blocks pushed to the next one. A block lives in at most one of them.
#[derive(Debug, Default)]
pub(crate) struct RoundHeaps {
    pub current: TraceHeap,
    pub next: TraceHeap,
}

impl RoundHeaps {
    fn key_of(&self, bb: BlockId) -> Option<i64> {
        self.current.key_of(bb).or_else(|| self.next.key_of(bb))
    }

    fn replace_key(&mut self, bb: BlockId, key: i64) {
        if self.current.contains(bb) {
            self.current.replace_key(bb, key);
        } else {
            self.next.replace_key(bb, key);
        }
    }

    fn remove(&mut self, bb: BlockId) -> bool {
        self.current.remove(bb) || self.next.remove(bb)
    }

    fn advance_round(&mut self) {
        debug_assert!(self.current.is_empty(), "round heap not drained");
        self.current = std::mem::take(&mut self.next);
    }
}

/// Pass-local state shared by trace formation and connection.
pub(crate) struct TraceCtx<'a> {
    pub graph: &'a mut FlowGraph,
    pub target: &'a dyn Target,
    pub config: LayoutConfig,

    /// Per-block scratch, indexed by block id
    pub bbd: Vec<BlockScratch>,

    /// Traces found so far
    pub traces: Vec<Trace>,

    /// Largest frequency among the entry block's successors
    pub max_entry_frequency: i64,

    /// Largest count among the entry block's successors
    pub max_entry_count: u64,

    /// Encoded size of an unconditional jump on the target
    pub uncond_jump_length: u32,

    /// Blocks duplicated by this pass
    pub n_duplicated: usize,
}

impl<'a> TraceCtx<'a> {
    pub fn new(graph: &'a mut FlowGraph, target: &'a dyn Target, config: LayoutConfig) -> Self {
        let n = graph.block_count();
        let uncond_jump_length = target.uncond_jump_length();
        Self {
            graph,
            target,
            config,
            bbd: vec![BlockScratch::default(); scratch_capacity(n)],
            traces: Vec::with_capacity(n),
            max_entry_frequency: 0,
            max_entry_count: 0,
            uncond_jump_length,
            n_duplicated: 0,
        }
    }

    /// Find all traces, chaining blocks through the layout side-band.
    pub fn find_traces(&mut self) {
        let number_of_rounds = if self.config.partition_hot_cold {
            N_ROUNDS
        } else {
            N_ROUNDS - 1
        };

        let mut heaps = RoundHeaps::default();

        // Seed with the function's entry points.
        let entry_succs = self.graph.entry().succs.clone();
        for e in entry_succs {
            let dest = self.graph.edge(e).dst;
            let key = self.bb_to_key(dest);
            heaps.current.insert(key, dest);
            self.bbd[dest.index()].in_heap = true;
            let block = self.graph.block(dest);
            if block.frequency as i64 > self.max_entry_frequency {
                self.max_entry_frequency = block.frequency as i64;
            }
            if block.count > self.max_entry_count {
                self.max_entry_count = block.count;
            }
        }

        for round in 0..number_of_rounds {
            debug!("trace formation round {}", round + 1);

            let count_th = if self.max_entry_count < u64::MAX / 1000 {
                self.max_entry_count * EXEC_THRESHOLD[round] as u64 / 1000
            } else {
                self.max_entry_count / 1000 * EXEC_THRESHOLD[round] as u64
            };

            self.find_traces_1_round(
                PROB_BASE as i64 * BRANCH_THRESHOLD[round] / 1000,
                self.max_entry_frequency * EXEC_THRESHOLD[round] / 1000,
                count_th,
                round,
                number_of_rounds,
                &mut heaps,
            );
        }

        if log::log_enabled!(log::Level::Debug) {
            for (i, t) in self.traces.iter().enumerate() {
                debug!(
                    "trace {} (round {}): {} .. {}, {} blocks",
                    i + 1,
                    t.round + 1,
                    t.first,
                    t.last,
                    t.length
                );
            }
        }
    }

    /// Heap key for a candidate seed; smaller sorts first.
    pub(crate) fn bb_to_key(&self, bb: BlockId) -> i64 {
        let block = self.graph.block(bb);

        // Never start a trace in code predicted dead.
        if block.partition == Partition::Cold || block.probably_never_executed() {
            return BB_FREQ_MAX as i64;
        }

        // Prefer blocks reachable from the end of an existing trace or
        // through a DFS back edge.
        let mut priority: i64 = 0;
        for &e in &block.preds {
            let edge = self.graph.edge(e);
            let continues_trace =
                !edge.src.is_entry() && self.bbd[edge.src.index()].end_of_trace.is_some();
            if continues_trace || edge.dfs_back {
                let edge_freq = self.graph.edge_frequency(e);
                if edge_freq > priority {
                    priority = edge_freq;
                }
            }
        }

        if priority > 0 {
            // Trace continuations must dominate fresh seeds, and the
            // incoming-edge frequency must dominate the tie-break on the
            // block's own frequency.
            -(100 * BB_FREQ_MAX as i64 + 100 * priority + block.frequency as i64)
        } else {
            -(block.frequency as i64)
        }
    }

    /// Whether a seed should wait for a later, less demanding round.
    fn push_to_next_round_p(
        &self,
        bb: BlockId,
        round: usize,
        number_of_rounds: usize,
        exec_th: i64,
        count_th: u64,
    ) -> bool {
        let there_exists_another_round = round < number_of_rounds - 1;

        let block = self.graph.block(bb);
        let cold_block = self.config.partition_hot_cold && block.partition == Partition::Cold;
        let block_not_hot_enough = (block.frequency as i64) < exec_th
            || block.count < count_th
            || block.probably_never_executed();

        there_exists_another_round && (cold_block || block_not_hot_enough)
    }

    /// Claim `bb` for a trace and drop it from whichever heap holds it.
    fn mark_bb_visited(&mut self, heaps: &mut RoundHeaps, bb: BlockId, trace_number: u32) {
        self.graph.block_mut(bb).layout.visited = trace_number;
        if self.bbd[bb.index()].in_heap {
            heaps.remove(bb);
            self.bbd[bb.index()].in_heap = false;
        }
    }

    /// One round of trace formation. Consumes the current-round heap and
    /// leaves the seeds for the following round in its place.
    fn find_traces_1_round(
        &mut self,
        branch_th: i64,
        exec_th: i64,
        count_th: u64,
        round: usize,
        number_of_rounds: usize,
        heaps: &mut RoundHeaps,
    ) {
        // Cold blocks may only join traces in the very last round.
        let last_round = N_ROUNDS - 1;

        while let Some((_, seed)) = heaps.current.extract_min() {
            self.bbd[seed.index()].in_heap = false;
            let mut bb = seed;
            debug!("getting {}", bb);

            if self.push_to_next_round_p(bb, round, number_of_rounds, exec_th, count_th) {
                let key = self.bb_to_key(bb);
                heaps.next.insert(key, bb);
                self.bbd[bb.index()].in_heap = true;
                debug!("  possible start point of next round: {} (key {})", bb, key);
                continue;
            }

            let trace_index = self.traces.len();
            let trace_number = trace_index as u32 + 1;
            self.traces.push(Trace {
                first: bb,
                last: bb,
                round,
                length: 0,
            });

            loop {
                let mut best_prob = i64::MIN / 2;
                let mut best_freq = i64::MIN / 2;
                let mut best_edge: Option<EdgeId> = None;

                self.mark_bb_visited(heaps, bb, trace_number);
                self.traces[trace_index].length += 1;
                trace!("{} visited in trace {}", bb, trace_number);

                // Select the successor placed after bb.
                let succs = self.graph.block(bb).succs.clone();
                for &e in &succs {
                    let edge = self.graph.edge(e);
                    assert!(!edge.fake, "fake edge {} out of {} during trace formation", e, bb);

                    let dst = edge.dst;
                    if dst.is_exit() {
                        continue;
                    }

                    let visited = self.graph.block(dst).layout.visited;
                    if visited != 0 && visited != trace_number {
                        continue;
                    }

                    if self.graph.block(dst).partition == Partition::Cold && round < last_round {
                        continue;
                    }

                    let edge = self.graph.edge(e);
                    let prob = edge.probability as i64;
                    let freq = self.graph.edge_frequency(e);

                    // Unsuitable: cannot fall through, or improbable or
                    // infrequent for this round.
                    if !edge.can_fallthru
                        || edge.complex
                        || prob < branch_th
                        || freq < exec_th
                        || edge.count < count_th
                    {
                        continue;
                    }

                    if self.better_edge_p(bb, e, prob, freq, best_prob, best_freq, best_edge) {
                        best_edge = Some(e);
                        best_prob = prob;
                        best_freq = freq;
                    }
                }

                // A destination with several predecessors that is cheaper to
                // copy than to jump to is left for the connector to
                // duplicate.
                if let Some(be) = best_edge {
                    let dst = self.graph.edge(be).dst;
                    if self.graph.block(dst).preds.len() >= 2 && self.copy_bb_p(dst, false) {
                        best_edge = None;
                    }
                }

                // Every successor that lost becomes a seed.
                for &e in &succs {
                    if Some(e) == best_edge {
                        continue;
                    }
                    let dst = self.graph.edge(e).dst;
                    if dst.is_exit() || self.graph.block(dst).layout.visited != 0 {
                        continue;
                    }

                    let key = self.bb_to_key(dst);

                    if self.bbd[dst.index()].in_heap {
                        if heaps.key_of(dst) != Some(key) {
                            trace!("changing key for {} to {}", dst, key);
                            heaps.replace_key(dst, key);
                        }
                    } else {
                        let edge = self.graph.edge(e);
                        let prob = edge.probability as i64;
                        let count = edge.count;
                        let freq = self.graph.edge_frequency(e);

                        let fails_thresholds = !edge.can_fallthru
                            || edge.complex
                            || prob < branch_th
                            || freq < exec_th
                            || count < count_th;
                        let to_next = fails_thresholds
                            && self.push_to_next_round_p(
                                dst,
                                round,
                                number_of_rounds,
                                exec_th,
                                count_th,
                            );

                        if to_next {
                            heaps.next.insert(key, dst);
                        } else {
                            heaps.current.insert(key, dst);
                        }
                        self.bbd[dst.index()].in_heap = true;
                        debug!(
                            "  possible start of {} round: {} (key {})",
                            if to_next { "next" } else { "this" },
                            dst,
                            key
                        );
                    }
                }

                let Some(mut be) = best_edge else { break };
                let best_dst = self.graph.edge(be).dst;

                if self.graph.block(best_dst).layout.visited == trace_number {
                    // The trace closed on itself. Single-block loops need no
                    // special handling.
                    if best_dst != bb {
                        if self.graph.edge_frequency(be)
                            > 4 * self.graph.block(best_dst).frequency as i64 / 5
                        {
                            // The loop iterates enough to be worth rotating,
                            // unless its header is the function's first block.
                            if Some(best_dst) != self.graph.entry().next_bb {
                                debug!("rotating loop {} - {}", best_dst, bb);
                                self.graph.block_mut(bb).layout.next = Some(best_dst);
                                bb = self.rotate_loop(be, trace_index, trace_number);
                            }
                        } else {
                            // Few iterations. If nothing else leaves bb,
                            // duplicating the header removes the back jump.
                            let has_other_edge =
                                self.graph.block(bb).succs.iter().any(|&x| x != be);
                            if !has_other_edge && self.copy_bb_p(best_dst, !self.config.optimize_size)
                            {
                                bb = self.copy_bb(best_dst, be, bb, trace_number);
                            }
                        }
                    }
                    break;
                }

                // Prefer A -> m -> C over the direct A -> C when m is an
                // unclaimed single-entry forwarder to C and
                // 2 * freq(m) >= edge_frequency(A -> C); laying out all
                // three in sequence wins.
                for &e in &succs {
                    if e == be {
                        continue;
                    }
                    let edge = self.graph.edge(e);
                    let m = edge.dst;
                    if !edge.can_fallthru || edge.complex || edge.crossing {
                        continue;
                    }
                    if self.graph.block(m).layout.visited != 0 {
                        continue;
                    }
                    if self.graph.block(m).preds.len() != 1 {
                        continue;
                    }
                    let Some(ms) = self.graph.single_succ(m) else {
                        continue;
                    };
                    let mse = self.graph.edge(ms);
                    if !mse.can_fallthru || mse.complex || mse.dst != best_dst {
                        continue;
                    }
                    if 2 * self.graph.block(m).frequency as i64 >= self.graph.edge_frequency(be) {
                        trace!("selecting forwarder {}", m);
                        be = e;
                        break;
                    }
                }

                let dst = self.graph.edge(be).dst;
                self.graph.block_mut(bb).layout.next = Some(dst);
                bb = dst;
            }

            self.traces[trace_index].last = bb;
            let first = self.traces[trace_index].first;
            self.bbd[first.index()].start_of_trace = Some(trace_index);
            self.bbd[bb.index()].end_of_trace = Some(trace_index);
            debug!(
                "trace {}: {} .. {} ({} blocks)",
                trace_number, first, bb, self.traces[trace_index].length
            );

            // The finished trace exposes a new trace end; successors of the
            // tail waiting in a heap may now deserve a better key.
            let succs = self.graph.block(bb).succs.clone();
            for &e in &succs {
                let dst = self.graph.edge(e).dst;
                if dst.is_exit() || self.graph.block(dst).layout.visited != 0 {
                    continue;
                }
                if self.bbd[dst.index()].in_heap {
                    let key = self.bb_to_key(dst);
                    if heaps.key_of(dst) != Some(key) {
                        trace!("changing key for {} to {}", dst, key);
                        heaps.replace_key(dst, key);
                    }
                }
            }
        }

        heaps.advance_round();
    }

    /// Edge comparison for successor selection. Probabilities (and
    /// frequencies) within a tenth of the current best count as equal.
    fn better_edge_p(
        &self,
        bb: BlockId,
        e: EdgeId,
        prob: i64,
        freq: i64,
        best_prob: i64,
        best_freq: i64,
        cur_best_edge: Option<EdgeId>,
    ) -> bool {
        let diff_prob = best_prob / 10;
        let diff_freq = best_freq / 10;

        let dst = self.graph.edge(e).dst;

        let mut is_better = if prob > best_prob + diff_prob {
            true
        } else if prob < best_prob - diff_prob {
            false
        } else if freq < best_freq - diff_freq {
            // Near-equal probabilities. A busier successor has some other
            // hot predecessor feeding it, so the quieter successor is the
            // better continuation.
            true
        } else if freq > best_freq + diff_freq {
            false
        } else {
            // Full tie: stay with the physical-order neighbour.
            self.graph.block(dst).prev_bb == Some(bb)
        };

        // With partitioning, any non-crossing edge beats any crossing edge.
        if !is_better && self.config.partition_hot_cold {
            if let Some(cb) = cur_best_edge {
                if self.graph.edge(cb).crossing && !self.graph.edge(e).crossing {
                    is_better = true;
                }
            }
        }

        is_better
    }

    /// Rotate the loop closed by `back_edge` so the source of the hottest
    /// edge leaving the loop becomes the trace tail. Returns the new tail.
    fn rotate_loop(&mut self, back_edge: EdgeId, trace_index: usize, trace_number: u32) -> BlockId {
        let head = self.graph.edge(back_edge).dst;

        let mut best_bb: Option<BlockId> = None;
        let mut best_freq: i64 = -1;
        let mut best_count: i64 = -1;
        // Destinations that are unvisited or start an existing trace are
        // preferred over everything else.
        let mut is_preferred = false;

        let mut bb = head;
        loop {
            let succs = self.graph.block(bb).succs.clone();
            for &e in &succs {
                let edge = self.graph.edge(e);
                let dst = edge.dst;
                if dst.is_exit()
                    || self.graph.block(dst).layout.visited == trace_number
                    || !edge.can_fallthru
                    || edge.complex
                {
                    continue;
                }

                let preferred_dest = self.graph.block(dst).layout.visited == 0
                    || self.bbd[dst.index()].start_of_trace.is_some();
                let freq = self.graph.edge_frequency(e);
                let count = self.graph.edge(e).count as i64;

                if is_preferred {
                    if preferred_dest && (freq > best_freq || count > best_count) {
                        best_freq = freq;
                        best_count = count;
                        best_bb = Some(bb);
                    }
                } else if preferred_dest {
                    is_preferred = true;
                    best_freq = freq;
                    best_count = count;
                    best_bb = Some(bb);
                } else if best_bb.is_none() || freq > best_freq || count > best_count {
                    best_freq = freq;
                    best_count = count;
                    best_bb = Some(bb);
                }
            }
            bb = self
                .graph
                .block(bb)
                .layout
                .next
                .expect("loop chain is circular during rotation");
            if bb == head {
                break;
            }
        }

        let tail = match best_bb {
            Some(best) => {
                if head == self.traces[trace_index].first {
                    self.traces[trace_index].first = self
                        .graph
                        .block(best)
                        .layout
                        .next
                        .expect("rotated tail has an in-loop successor");
                } else {
                    let mut prev = self.traces[trace_index].first;
                    while self.graph.block(prev).layout.next != Some(head) {
                        prev = self
                            .graph
                            .block(prev)
                            .layout
                            .next
                            .expect("loop head is on the trace chain");
                    }
                    let best_next = self.graph.block(best).layout.next;
                    self.graph.block_mut(prev).layout.next = best_next;

                    // The splice leaves prev jumping into the loop. If the
                    // jump lands on a small conditional-jump header,
                    // duplicate the header inline instead.
                    if let Some(se) = self.graph.single_succ(prev) {
                        let header = self.graph.edge(se).dst;
                        let ends_in_condjump = self
                            .graph
                            .block(header)
                            .last_insn()
                            .map_or(false, |i| i.is_any_condjump());
                        if ends_in_condjump && self.copy_bb_p(header, false) {
                            self.copy_bb(header, se, prev, trace_number);
                        }
                    }
                }
                best
            }
            // No suitable loop tail; keep the original one.
            None => self.graph.edge(back_edge).src,
        };

        self.graph.block_mut(tail).layout.next = None;
        tail
    }

    /// Duplicate `old_bb`, redirect `e` to the copy, and splice the copy
    /// into the trace chain after `after`.
    pub(crate) fn copy_bb(
        &mut self,
        old_bb: BlockId,
        e: EdgeId,
        after: BlockId,
        trace_number: u32,
    ) -> BlockId {
        let new_bb = self.graph.duplicate_block(old_bb, e);
        assert_eq!(
            self.graph.edge(e).dst,
            new_bb,
            "duplicate of {} is not the redirected edge destination",
            old_bb
        );
        assert_eq!(
            self.graph.block(new_bb).layout.visited,
            0,
            "fresh duplicate {} is already claimed by a trace",
            new_bb
        );

        self.graph.block_mut(new_bb).layout.visited = trace_number;
        let after_next = self.graph.block(after).layout.next;
        self.graph.block_mut(new_bb).layout.next = after_next;
        self.graph.block_mut(after).layout.next = Some(new_bb);
        self.n_duplicated += 1;

        if new_bb.index() >= self.bbd.len() {
            let new_size = scratch_capacity(self.graph.block_count().max(new_bb.index() + 1));
            self.bbd.resize(new_size, BlockScratch::default());
            debug!("growing block scratch to {} entries", new_size);
        }

        new_bb
    }

    /// Whether `bb` can and should be duplicated. `code_may_grow` relaxes
    /// the size limit for blocks worth growing the function for.
    pub(crate) fn copy_bb_p(&self, bb: BlockId, code_may_grow: bool) -> bool {
        let block = self.graph.block(bb);

        if block.frequency == 0 {
            return false;
        }
        if block.preds.len() < 2 {
            return false;
        }
        if !self.target.can_duplicate_block(self.graph, bb) {
            return false;
        }
        // Copying a block with many successors multiplies edges.
        if block.succs.len() > MAX_DUPLICATED_SUCCS {
            return false;
        }

        let mut max_size = self.uncond_jump_length;
        if code_may_grow && block.maybe_hot() {
            max_size *= 8;
        }

        let size = block.code_size();
        if size <= max_size {
            true
        } else {
            debug!("{} not duplicated: size {} over limit {}", bb, size, max_size);
            false
        }
    }
}
