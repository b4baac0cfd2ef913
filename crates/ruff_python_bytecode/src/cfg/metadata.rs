//! Facts about how control reached a program point.
//!
//! A `finally` handler is entered for several reasons (normal completion, an
//! exception, a `return`, a `break` or a `continue`), and where `END_FINALLY`
//! goes next depends on which. The builder unions these facts over every
//! predecessor of a node.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::cfg::block_stack::ScopeId;
use crate::instruction::Offset;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PathFlags: u8 {
        /// A `return` is pending on some incoming path.
        const RETURNED = 1 << 0;
        /// An exception was explicitly raised on some incoming path.
        const RAISED = 1 << 1;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PathMetadata {
    pub flags: PathFlags,
    /// Loops left through `break` on some incoming path. Sorted.
    broken_loops: SmallVec<[ScopeId; 2]>,
    /// `(loop, restart offset)` pairs for `continue`s deferred by a `finally`
    /// on some incoming path. Sorted.
    continued_loops: SmallVec<[(ScopeId, Offset); 1]>,
}

impl PathMetadata {
    pub fn returned(&self) -> bool {
        self.flags.contains(PathFlags::RETURNED)
    }

    pub fn raised(&self) -> bool {
        self.flags.contains(PathFlags::RAISED)
    }

    pub fn has_broken(&self, loop_scope: ScopeId) -> bool {
        self.broken_loops.binary_search(&loop_scope).is_ok()
    }

    pub fn broken_loops(&self) -> &[ScopeId] {
        &self.broken_loops
    }

    pub fn insert_broken(&mut self, loop_scope: ScopeId) {
        if let Err(index) = self.broken_loops.binary_search(&loop_scope) {
            self.broken_loops.insert(index, loop_scope);
        }
    }

    pub fn remove_broken(&mut self, loop_scope: ScopeId) {
        self.broken_loops.retain(|id| *id != loop_scope);
    }

    /// Restart offsets of the `continue`s pending for `loop_scope`.
    pub fn continue_targets(&self, loop_scope: ScopeId) -> impl Iterator<Item = Offset> + '_ {
        self.continued_loops
            .iter()
            .filter(move |(id, _)| *id == loop_scope)
            .map(|(_, restart)| *restart)
    }

    pub fn insert_continued(&mut self, loop_scope: ScopeId, restart: Offset) {
        let entry = (loop_scope, restart);
        if let Err(index) = self.continued_loops.binary_search(&entry) {
            self.continued_loops.insert(index, entry);
        }
    }

    pub fn remove_continued(&mut self, loop_scope: ScopeId) {
        self.continued_loops.retain(|(id, _)| *id != loop_scope);
    }

    /// Merges the facts of another incoming path into `self`.
    pub fn union(&mut self, other: &PathMetadata) {
        self.flags |= other.flags;
        for id in &other.broken_loops {
            self.insert_broken(*id);
        }
        for (id, restart) in &other.continued_loops {
            self.insert_continued(*id, *restart);
        }
    }

    /// Joins the metadata of every incoming path.
    pub fn join<'a>(paths: impl IntoIterator<Item = &'a PathMetadata>) -> PathMetadata {
        let mut joined = PathMetadata::default();
        for path in paths {
            joined.union(path);
        }
        joined
    }
}
