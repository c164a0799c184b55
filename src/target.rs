//! Host-compiler capability interface
//!
//! The layout passes are target-neutral; everything machine-specific is
//! asked of a [`Target`] implementation: whether jumps may be rewritten at
//! all, whether conditional/unconditional branches can span the whole
//! address space, whether a bare return instruction exists, which blocks
//! the code generator is able to duplicate, and how large an unconditional
//! jump encodes (the yardstick for duplication limits).

use crate::cfg::{BlockId, FlowGraph};

/// Machine capabilities consulted by the layout passes
pub trait Target {
    /// The target forbids rewriting jump instructions entirely
    /// (e.g. when branch delay slots have already been filled).
    fn cannot_modify_jumps(&self) -> bool {
        false
    }

    /// Conditional branches can reach any address.
    fn has_long_cond_branch(&self) -> bool;

    /// Unconditional branches can reach any address.
    fn has_long_uncond_branch(&self) -> bool;

    /// A bare return instruction exists.
    fn has_return(&self) -> bool {
        true
    }

    /// Whether the code generator can duplicate this block.
    fn can_duplicate_block(&self, graph: &FlowGraph, bb: BlockId) -> bool;

    /// Encoded size of an unconditional jump, in the same units as
    /// instruction lengths.
    fn uncond_jump_length(&self) -> u32;
}

/// A plain, configurable target description.
///
/// The defaults describe a conservative machine: short conditional and
/// unconditional branches (so partition surgery rewrites both), a return
/// instruction, and single-unit jumps.
#[derive(Debug, Clone, Copy)]
pub struct HostTarget {
    pub cannot_modify_jumps: bool,
    pub long_cond_branch: bool,
    pub long_uncond_branch: bool,
    pub has_return: bool,
    pub uncond_jump_length: u32,
}

impl Default for HostTarget {
    fn default() -> Self {
        Self {
            cannot_modify_jumps: false,
            long_cond_branch: false,
            long_uncond_branch: false,
            has_return: true,
            uncond_jump_length: 1,
        }
    }
}

impl Target for HostTarget {
    fn cannot_modify_jumps(&self) -> bool {
        self.cannot_modify_jumps
    }

    fn has_long_cond_branch(&self) -> bool {
        self.long_cond_branch
    }

    fn has_long_uncond_branch(&self) -> bool {
        self.long_uncond_branch
    }

    fn has_return(&self) -> bool {
        self.has_return
    }

    fn can_duplicate_block(&self, graph: &FlowGraph, bb: BlockId) -> bool {
        // Dispatch tables are address-anchored; their blocks cannot be
        // copied.
        !graph.block(bb).insns.iter().any(|i| i.is_tablejump())
    }

    fn uncond_jump_length(&self) -> u32 {
        self.uncond_jump_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{FlowGraphBuilder, Insn, LabelId};

    #[test]
    fn test_host_target_defaults() {
        let t = HostTarget::default();
        assert!(!t.cannot_modify_jumps());
        assert!(!t.has_long_cond_branch());
        assert!(!t.has_long_uncond_branch());
        assert!(t.has_return());
        assert_eq!(t.uncond_jump_length(), 1);
    }

    #[test]
    fn test_tablejump_blocks_are_not_duplicable() {
        let mut b = FlowGraphBuilder::new();
        let a = b.block(1000, 100);
        let c = b.block(1000, 100);
        b.insn(a, Insn::table_jump(LabelId(99)));
        b.ret(c);
        let g = b.finish();

        let t = HostTarget::default();
        assert!(!t.can_duplicate_block(&g, a));
        assert!(t.can_duplicate_block(&g, c));
    }
}
