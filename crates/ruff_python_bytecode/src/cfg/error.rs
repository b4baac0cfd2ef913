use crate::instruction::{Offset, Opcode};

/// The instruction stream is not something the interpreter could have
/// produced. Construction of the graph for that code unit is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CfgError {
    #[error("code unit contains no instructions")]
    EmptyCode,

    #[error("code unit starts at offset {0}, expected offset 0")]
    MissingEntry(Offset),

    #[error("`{opcode}` at offset {offset} falls off the end of the code unit")]
    FallsOffEnd { offset: Offset, opcode: Opcode },

    #[error("`{opcode}` at offset {offset} has no resolved jump target within the offset range")]
    MissingJumpTarget { offset: Offset, opcode: Opcode },

    #[error("`{opcode}` at offset {offset} has no enclosing loop on the block stack")]
    MissingScope { offset: Offset, opcode: Opcode },

    #[error(
        "predecessors of `{opcode}` at offset {offset} disagree on the innermost block: \
        {expected} (via {expected_from}) vs {found} (via {found_from})"
    )]
    InconsistentBlockStack {
        offset: Offset,
        opcode: Opcode,
        expected: String,
        expected_from: Offset,
        found: String,
        found_from: Offset,
    },

    #[error("edge {from} -> {to} targets an offset with no reachable instruction")]
    DanglingEdge { from: Offset, to: Offset },
}

/// A query against a graph or a block stack that has no answer. Unlike
/// [`CfgError`], these are expected outcomes the caller can recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("no node at offset {0}")]
    NodeNotFound(Offset),

    #[error("block stack is empty")]
    EmptyStack,

    #[error("block stack index {index} is out of range for a stack of depth {depth}")]
    StackIndexOutOfRange { index: usize, depth: usize },
}
