//! Instruction chain model
//!
//! The layout passes do not interpret ordinary instructions; they only need
//! enough structure to recognize control transfers, synthesize jumps and
//! labels during partition surgery, and account for code size when deciding
//! whether a block is cheap to duplicate. Each basic block owns its
//! instruction list; barriers detached from the instruction stream live in
//! the block's layout footer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a code label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Where a jump transfers control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpTarget {
    /// Jump to a labelled location
    Label(LabelId),
    /// Jump directly to the function epilogue
    Return,
}

/// Kinds of notes carried in the instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteKind {
    /// Marks a block destined for the unlikely-executed object section
    UnlikelyExecutedCode,
}

/// Annotations attached to individual instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegNote {
    /// The jump's outgoing edge crosses the hot/cold partition boundary
    CrossingJump,
}

/// Instruction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsnKind {
    /// Branch target marker
    Label(LabelId),

    /// Informational marker, not executable
    Note(NoteKind),

    /// Ordinary non-control instruction (opaque to layout)
    Op,

    /// Unconditional direct jump
    Jump(JumpTarget),

    /// Conditional jump; the other arm falls through
    CondJump { target: JumpTarget },

    /// Indirect jump through a register
    IndirectJump { reg: u32 },

    /// Jump through a dispatch table
    TableJump { table: LabelId },

    /// Load the address of a label into a register
    LoadLabelAddr { reg: u32, label: LabelId },

    /// Return from the function
    Return,

    /// End of a straight-line run; nothing falls through past this
    Barrier,
}

/// A single instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insn {
    pub kind: InsnKind,

    /// Encoded size in target units; counted toward duplication limits
    pub length: u32,

    /// Annotations attached by the passes
    pub reg_notes: Vec<RegNote>,
}

impl Insn {
    fn with_kind(kind: InsnKind, length: u32) -> Self {
        Self {
            kind,
            length,
            reg_notes: Vec::new(),
        }
    }

    /// An ordinary instruction of the given encoded size.
    pub fn op(length: u32) -> Self {
        Self::with_kind(InsnKind::Op, length)
    }

    pub fn label(id: LabelId) -> Self {
        Self::with_kind(InsnKind::Label(id), 0)
    }

    pub fn note(kind: NoteKind) -> Self {
        Self::with_kind(InsnKind::Note(kind), 0)
    }

    pub fn jump(target: JumpTarget) -> Self {
        Self::with_kind(InsnKind::Jump(target), 1)
    }

    pub fn cond_jump(target: JumpTarget) -> Self {
        Self::with_kind(InsnKind::CondJump { target }, 1)
    }

    pub fn indirect_jump(reg: u32) -> Self {
        Self::with_kind(InsnKind::IndirectJump { reg }, 1)
    }

    pub fn table_jump(table: LabelId) -> Self {
        Self::with_kind(InsnKind::TableJump { table }, 1)
    }

    pub fn load_label_addr(reg: u32, label: LabelId) -> Self {
        Self::with_kind(InsnKind::LoadLabelAddr { reg, label }, 1)
    }

    pub fn ret() -> Self {
        Self::with_kind(InsnKind::Return, 1)
    }

    pub fn barrier() -> Self {
        Self::with_kind(InsnKind::Barrier, 0)
    }

    /// Whether this is a real (executable) instruction. Labels, notes and
    /// barriers are markers and do not count toward block size.
    pub fn is_real(&self) -> bool {
        !matches!(
            self.kind,
            InsnKind::Label(_) | InsnKind::Note(_) | InsnKind::Barrier
        )
    }

    /// Whether this instruction transfers control.
    pub fn is_jump(&self) -> bool {
        matches!(
            self.kind,
            InsnKind::Jump(_)
                | InsnKind::CondJump { .. }
                | InsnKind::IndirectJump { .. }
                | InsnKind::TableJump { .. }
                | InsnKind::Return
        )
    }

    pub fn is_any_condjump(&self) -> bool {
        matches!(self.kind, InsnKind::CondJump { .. })
    }

    pub fn is_computed_jump(&self) -> bool {
        matches!(self.kind, InsnKind::IndirectJump { .. })
    }

    pub fn is_tablejump(&self) -> bool {
        matches!(self.kind, InsnKind::TableJump { .. })
    }

    pub fn is_label(&self) -> bool {
        matches!(self.kind, InsnKind::Label(_))
    }

    pub fn is_note(&self) -> bool {
        matches!(self.kind, InsnKind::Note(_))
    }

    /// Attach a register note unless it is already present.
    pub fn add_reg_note(&mut self, note: RegNote) {
        if !self.reg_notes.contains(&note) {
            self.reg_notes.push(note);
        }
    }

    pub fn has_reg_note(&self, note: RegNote) -> bool {
        self.reg_notes.contains(&note)
    }
}
