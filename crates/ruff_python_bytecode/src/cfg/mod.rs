//! # Overview
//! To build a control-flow graph, we step through each instruction of a code
//! unit in order of increasing offset. Every reachable instruction becomes its
//! own node: we never merge straight-line runs into basic blocks. Most
//! instructions simply fall through to the next one. The ones that invoke
//! control flow are exactly the following:
//!
//! | Branching           | Handler scopes  | Jumps           |
//! |---------------------|-----------------|-----------------|
//! | `POP_JUMP_IF_*`     | `SETUP_LOOP`    | `JUMP_FORWARD`  |
//! | `JUMP_IF_*_OR_POP`  | `SETUP_EXCEPT`  | `JUMP_ABSOLUTE` |
//! | `FOR_ITER`          | `SETUP_FINALLY` | `BREAK_LOOP`    |
//! |                     | `SETUP_WITH`    | `CONTINUE_LOOP` |
//! |                     | `POP_BLOCK`     | `RETURN_VALUE`  |
//! |                     | `POP_EXCEPT`    | `RAISE_VARARGS` |
//! |                     | `END_FINALLY`   |                 |
//!
//! Besides these, any instruction that can raise has an implicit edge to the
//! handler that would catch the exception.
//!
//! ## The block stack
//!
//! The interpreter keeps a stack of active blocks. `SETUP_*` pushes a block
//! that remembers where to go when the block is left abnormally: the loop
//! exit for a `SETUP_LOOP`, the handler for the others. We track the same
//! stack at every node, as a [`BlockStackView`] into a shared
//! [`ScopeArena`](block_stack::ScopeArena). Pushing allocates a new scope
//! whose parent is the previous top, so the views recorded at earlier nodes
//! are never disturbed.
//!
//! Rather than interpreting `POP_BLOCK` and friends, a scope is considered
//! left as soon as control reaches its exit offset: the view flowing into a
//! node drops every scope whose exit is at or before that node. The one
//! exception is a loop, whose `else` clause runs after its `POP_BLOCK` but
//! before its exit, so that `POP_BLOCK` pops it. For example,
//!
//! ```python
//! try:
//!     f()
//! finally:
//!     g()
//! ```
//!
//! compiles to
//!
//! ```text
//!  0 SETUP_FINALLY   10 (to 12)     []
//!  2 LOAD_GLOBAL      0 (f)         [finally at 0 (exit 12)]
//!  4 CALL_FUNCTION    0             [finally at 0 (exit 12)]
//!  6 POP_TOP                        [finally at 0 (exit 12)]
//!  8 POP_BLOCK                      [finally at 0 (exit 12)]
//! 10 LOAD_CONST       0 (None)      [finally at 0 (exit 12)]
//! 12 LOAD_GLOBAL      1 (g)         []
//!    ...
//! 18 END_FINALLY                    []
//! ```
//!
//! where the right column is the block stack when each instruction starts.
//!
//! ## Implicit jumps
//!
//! ### Raise
//!
//! An instruction that can raise gets an extra edge to the handler of the
//! innermost `except`, `finally` or `with` scope that still protects it.
//! Loops do not catch anything. An explicit `RAISE_VARARGS` that nothing
//! catches goes to the exit node.
//!
//! ### Return, break and continue
//!
//! These leave every scope between the instruction and their destination.
//! `except` scopes are dropped silently, but a `finally` or `with` scope
//! runs its handler first. The node records the pending jump in its
//! [`PathMetadata`], and the `END_FINALLY` that ends the handler resumes it:
//!
//! ```text
//!   RETURN_VALUE ──► finally handler ──► END_FINALLY ──► exit
//! ```
//!
//! If another `finally` is in the way, `END_FINALLY` hands the jump on to
//! that handler instead.
//!
//! # Implementation Details
//!
//! The builder takes a single, forward pass over the instructions. When an
//! instruction is reached, all of its predecessors except loop back-edges
//! have already been visited, so its block stack and metadata are the join of
//! theirs. A reachable instruction is one that some visited node has as a
//! successor. Jump targets are visited even without a visited predecessor,
//! unless the only jump to them was itself unreachable.
//!
//! Construction fails with a [`CfgError`] on input the interpreter could not
//! have produced, such as predecessors that disagree on the block stack.
pub mod block_stack;
pub mod builder;
pub mod error;
pub mod implementations;
pub mod metadata;
pub mod replay;
mod resolver;
pub mod visualize;

pub use block_stack::{BlockStackView, Scope, ScopeArena, ScopeId, ScopeKind};
pub use builder::ControlFlowGraph;
pub use error::{CfgError, LookupError};
pub use implementations::{build_cfg, Node, CFG};
pub use metadata::{PathFlags, PathMetadata};
pub use replay::{replay, PathFixture};
pub use resolver::Successors;
