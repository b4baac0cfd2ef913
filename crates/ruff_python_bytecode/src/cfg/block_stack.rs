//! A persistent model of the interpreter's block stack.
//!
//! Every `SETUP_*` instruction pushes a [`Scope`] onto the block stack. Because
//! the two arms of a branch inside a protected region must not observe each
//! other's pushes, scopes are never mutated once created. A [`ScopeArena`] owns
//! every scope created while building one graph, and a [`BlockStackView`] is a
//! cursor naming the innermost scope active at a program point. Pushing
//! allocates a new scope whose parent is the current top; popping simply moves
//! the cursor to the parent.

use std::fmt;
use std::ops::Index;

use crate::cfg::error::LookupError;
use crate::instruction::Offset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(u32);

impl ScopeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// The instruction that created a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, is_macro::Is)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScopeKind {
    /// `SETUP_LOOP`
    Loop,
    /// `SETUP_EXCEPT`
    Except,
    /// `SETUP_FINALLY`
    Finally,
    /// `SETUP_WITH` and `SETUP_ASYNC_WITH`
    With,
}

impl ScopeKind {
    /// Whether the handler of this scope runs when a `return`, `break` or
    /// `continue` unwinds through it.
    pub const fn intercepts_unwinding(self) -> bool {
        matches!(self, Self::Finally | Self::With)
    }

    /// Whether an exception raised inside the protected region transfers
    /// control to the handler of this scope.
    pub const fn catches_exceptions(self) -> bool {
        !matches!(self, Self::Loop)
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Loop => "loop",
            Self::Except => "except",
            Self::Finally => "finally",
            Self::With => "with",
        })
    }
}

/// An immutable handler-scope record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub kind: ScopeKind,
    /// The offset following the protected region: the loop exit for loops, the
    /// handler entry for everything else.
    pub exit: Offset,
    /// The offset of the `SETUP_*` instruction that pushed this scope.
    pub origin: Offset,
    pub parent: Option<ScopeId>,
}

/// Append-only storage for every [`Scope`] created while building one graph.
#[derive(Debug, Default, Clone)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
}

impl ScopeArena {
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    fn alloc(&mut self, scope: Scope) -> ScopeId {
        debug_assert!(u32::try_from(self.scopes.len()).is_ok());
        #[allow(clippy::cast_possible_truncation)]
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(scope);
        id
    }
}

impl Index<ScopeId> for ScopeArena {
    type Output = Scope;

    fn index(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }
}

/// The scopes active at a program point, innermost first.
///
/// A view is only meaningful together with the [`ScopeArena`] it was created
/// from, which is passed explicitly to every operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockStackView {
    top: Option<ScopeId>,
}

impl BlockStackView {
    pub const EMPTY: BlockStackView = BlockStackView { top: None };

    pub const fn top(self) -> Option<ScopeId> {
        self.top
    }

    pub const fn is_empty(self) -> bool {
        self.top.is_none()
    }

    /// Returns a view with a new scope on top. `self` is left untouched.
    #[must_use]
    pub fn push(
        self,
        arena: &mut ScopeArena,
        kind: ScopeKind,
        exit: Offset,
        origin: Offset,
    ) -> Self {
        let id = arena.alloc(Scope {
            kind,
            exit,
            origin,
            parent: self.top,
        });
        Self { top: Some(id) }
    }

    pub fn pop(self, arena: &ScopeArena) -> Result<Self, LookupError> {
        let top = self.top.ok_or(LookupError::EmptyStack)?;
        Ok(Self {
            top: arena[top].parent,
        })
    }

    /// Returns the scope `index` levels below the top (`0` is the top).
    pub fn peek(self, arena: &ScopeArena, index: usize) -> Result<&Scope, LookupError> {
        self.iter(arena)
            .nth(index)
            .map(|(_, scope)| scope)
            .ok_or(LookupError::StackIndexOutOfRange {
                index,
                depth: self.depth(arena),
            })
    }

    /// Discards every scope that has already been exited by the time control
    /// reaches `offset`, i.e. scopes whose exit is at or before `offset`.
    #[must_use]
    pub fn pop_until(self, arena: &ScopeArena, offset: Offset) -> Self {
        let mut current = self.top;
        while let Some(id) = current {
            let scope = &arena[id];
            if scope.exit > offset {
                break;
            }
            current = scope.parent;
        }
        Self { top: current }
    }

    pub(crate) const fn from_top(top: Option<ScopeId>) -> Self {
        Self { top }
    }

    pub fn iter(self, arena: &ScopeArena) -> Scopes<'_> {
        Scopes {
            arena,
            next: self.top,
        }
    }

    pub fn depth(self, arena: &ScopeArena) -> usize {
        self.iter(arena).count()
    }

    pub fn display(self, arena: &ScopeArena) -> DisplayBlockStack<'_> {
        DisplayBlockStack { view: self, arena }
    }
}

/// Iterates the scopes of a view from the innermost outwards.
pub struct Scopes<'a> {
    arena: &'a ScopeArena,
    next: Option<ScopeId>,
}

impl<'a> Iterator for Scopes<'a> {
    type Item = (ScopeId, &'a Scope);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let scope = &self.arena[id];
        self.next = scope.parent;
        Some((id, scope))
    }
}

pub struct DisplayBlockStack<'a> {
    view: BlockStackView,
    arena: &'a ScopeArena,
}

impl fmt::Display for DisplayBlockStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (_, scope)) in self.view.iter(self.arena).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{} at {} (exit {})",
                scope.kind, scope.origin, scope.exit
            )?;
        }
        f.write_str("]")
    }
}
