//! Profile-guided basic-block layout for compiler back-ends.
//!
//! This crate implements the block-placement core of a compiler back-end:
//! it takes a control-flow graph whose edges carry branch probabilities and
//! execution counts and rearranges the linear order of basic blocks to
//! maximize fall-through frequency and instruction-cache locality.
//! Two cooperating passes are provided:
//!
//! - [`layout::reorder_basic_blocks`]: multi-round greedy trace formation
//!   ("software trace cache") followed by trace connection, producing a
//!   single linear chain of blocks linked through the layout side-band.
//! - [`layout::partition_hot_cold_basic_blocks`]: classifies blocks as hot
//!   or cold, then rewrites the CFG so that no fall-through edge crosses the
//!   section boundary and, on targets without long-range branches, every
//!   crossing branch is expanded into a form that can span arbitrary
//!   distance.
//!
//! The CFG model lives in [`cfg`]; host-compiler capabilities are abstracted
//! behind [`target::Target`]. The passes mutate the graph in place and are
//! strictly single-threaded.

pub mod cfg;
pub mod layout;
pub mod logging;
pub mod target;

pub use cfg::{
    BasicBlock, BlockId, CfgError, Edge, EdgeId, FlowGraph, FlowGraphBuilder, Insn, InsnKind,
    JumpTarget, LabelId, NoteKind, Partition, RegNote, BB_FREQ_MAX, PROB_BASE,
};
pub use layout::{
    partition_hot_cold_basic_blocks, reorder_basic_blocks, LayoutConfig, PartitionStats,
    ReorderStats,
};
pub use target::{HostTarget, Target};
