//! Control-flow edges
//!
//! Edges carry the branch probability and profile count that drive every
//! layout decision. Probabilities are fixed-point fractions of
//! [`PROB_BASE`](crate::cfg::PROB_BASE); the frequency contributed by an
//! edge is derived from its source block's frequency scaled by the edge
//! probability.

use super::BlockId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u32);

impl EdgeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A directed control-flow edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source block
    pub src: BlockId,

    /// Destination block
    pub dst: BlockId,

    /// Branch probability in [0, PROB_BASE]
    pub probability: u32,

    /// Absolute profile count of traversals
    pub count: u64,

    /// The destination could be laid out immediately after the source
    /// (the branch is absent or invertible)
    pub can_fallthru: bool,

    /// Abnormal control flow (exception or computed dispatch); never a
    /// layout candidate
    pub complex: bool,

    /// The destination currently falls through from the source
    pub fallthru: bool,

    /// Artificial edge added for analysis purposes only
    pub fake: bool,

    /// Back edge found by depth-first traversal (closes a loop)
    pub dfs_back: bool,

    /// Source and destination lie in different hot/cold partitions
    pub crossing: bool,
}

impl Edge {
    pub fn new(src: BlockId, dst: BlockId, probability: u32) -> Self {
        Self {
            src,
            dst,
            probability,
            count: 0,
            can_fallthru: false,
            complex: false,
            fallthru: false,
            fake: false,
            dfs_back: false,
            crossing: false,
        }
    }
}
