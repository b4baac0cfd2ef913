//! Successor computation for a single instruction.
//!
//! Given an instruction, the block stack active when it executes, and the
//! metadata of the paths that reach it, [`Resolver::resolve`] returns every
//! offset control can reach next, together with the block stack and metadata
//! those successors inherit.
//!
//! The interpreter transfers control implicitly in three situations, and each
//! is modeled by walking the block stack from the innermost scope outwards:
//!
//! - an exception jumps to the handler of the innermost `except`, `finally` or
//!   `with` scope whose protected region contains the instruction;
//! - `return`, `break` and `continue` silently discard `except` scopes but are
//!   intercepted by the innermost `finally` or `with` scope, whose handler runs
//!   first and resumes the jump at `END_FINALLY`;
//! - `END_FINALLY` re-raises a live exception, or resumes a pending return,
//!   break or continue.

use smallvec::SmallVec;

use crate::cfg::block_stack::{BlockStackView, ScopeArena, ScopeId, ScopeKind};
use crate::cfg::error::CfgError;
use crate::cfg::metadata::{PathFlags, PathMetadata};
use crate::instruction::{Instruction, Offset, OpcodeClass};

pub type Successors = SmallVec<[Offset; 2]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolution {
    pub(crate) successors: Successors,
    pub(crate) block_stack: BlockStackView,
    pub(crate) metadata: PathMetadata,
}

/// Where a `break` or `continue` goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unwind {
    /// Straight to the loop: nothing between the instruction and the loop
    /// intercepts the jump.
    Direct { loop_scope: ScopeId },
    /// Into the handler of an intervening `finally` or `with` scope. The jump
    /// resumes when that handler reaches `END_FINALLY`.
    Detour { loop_scope: ScopeId, handler: Offset },
}

pub(crate) struct Resolver<'a> {
    scopes: &'a mut ScopeArena,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(scopes: &'a mut ScopeArena) -> Self {
        Self { scopes }
    }

    /// Computes the successors of `instruction`. `next` is the offset of the
    /// following instruction in the code unit, if any.
    pub(crate) fn resolve(
        &mut self,
        instruction: &Instruction,
        next: Option<Offset>,
        block_stack: BlockStackView,
        mut metadata: PathMetadata,
    ) -> Result<Resolution, CfgError> {
        let offset = instruction.offset;
        let opcode = instruction.opcode;
        let fallthrough = || next.ok_or(CfgError::FallsOffEnd { offset, opcode });
        let jump_target = || {
            instruction
                .jump_target()
                .ok_or(CfgError::MissingJumpTarget { offset, opcode })
        };

        let mut successors = Successors::new();
        let mut propagated = block_stack;

        match opcode.class() {
            OpcodeClass::Sequential => {
                push_unique(&mut successors, fallthrough()?);
                if let Some(handler) = self.exception_target(offset, block_stack) {
                    push_unique(&mut successors, handler);
                }
            }
            OpcodeClass::Jump => {
                push_unique(&mut successors, jump_target()?);
            }
            OpcodeClass::ConditionalJump => {
                push_unique(&mut successors, fallthrough()?);
                push_unique(&mut successors, jump_target()?);
            }
            OpcodeClass::Break => match self.unwind(instruction, block_stack)? {
                Unwind::Direct { loop_scope } => {
                    metadata.insert_broken(loop_scope);
                    let scope = self.scopes[loop_scope];
                    propagated = BlockStackView::from_top(scope.parent);
                    push_unique(&mut successors, scope.exit);
                }
                Unwind::Detour {
                    loop_scope,
                    handler,
                } => {
                    metadata.insert_broken(loop_scope);
                    push_unique(&mut successors, handler);
                }
            },
            OpcodeClass::Continue => {
                let restart = jump_target()?;
                match self.unwind(instruction, block_stack)? {
                    Unwind::Direct { .. } => {
                        push_unique(&mut successors, restart);
                    }
                    Unwind::Detour {
                        loop_scope,
                        handler,
                    } => {
                        metadata.insert_continued(loop_scope, restart);
                        push_unique(&mut successors, handler);
                    }
                }
            }
            OpcodeClass::SetupScope(kind) => {
                push_unique(&mut successors, fallthrough()?);
                propagated = block_stack.push(self.scopes, kind, jump_target()?, offset);
            }
            OpcodeClass::PopBlock => {
                push_unique(&mut successors, fallthrough()?);
                // The `else` clause of a loop runs between its `POP_BLOCK` and
                // its exit, outside of the loop. Other scopes are left at their
                // exit offset.
                if let Some(id) = block_stack.top() {
                    if self.scopes[id].kind.is_loop() {
                        propagated = BlockStackView::from_top(self.scopes[id].parent);
                    }
                }
            }
            OpcodeClass::PopExcept => {
                push_unique(&mut successors, fallthrough()?);
            }
            OpcodeClass::Return => {
                metadata.flags.insert(PathFlags::RETURNED);
                push_unique(&mut successors, self.return_target(offset, block_stack));
            }
            OpcodeClass::Raise => {
                metadata.flags.insert(PathFlags::RAISED);
                if let Some(next) = next {
                    push_unique(&mut successors, next);
                }
                let handler = self
                    .exception_target(offset, block_stack)
                    .unwrap_or(Offset::EXIT);
                push_unique(&mut successors, handler);
            }
            OpcodeClass::EndFinally => {
                if let Some(next) = next {
                    push_unique(&mut successors, next);
                }
                if let Some(handler) = self.exception_target(offset, block_stack) {
                    push_unique(&mut successors, handler);
                }
                self.resume_deferred(offset, block_stack, &mut metadata, &mut successors);
            }
        }

        Ok(Resolution {
            successors,
            block_stack: propagated,
            metadata,
        })
    }

    /// Adds the edges taken when `END_FINALLY` resumes a `return`, `break` or
    /// `continue` that an enclosing handler intercepted.
    fn resume_deferred(
        &self,
        offset: Offset,
        block_stack: BlockStackView,
        metadata: &mut PathMetadata,
        successors: &mut Successors,
    ) {
        if metadata.returned() {
            let target = self.return_target(offset, block_stack);
            push_unique(successors, target);
            if target.is_exit() {
                metadata.flags.remove(PathFlags::RETURNED);
            }
        }

        let Some((loop_scope, loop_record)) = block_stack
            .iter(self.scopes)
            .find(|(_, scope)| scope.kind.is_loop())
        else {
            return;
        };
        let detour = self.intercepting_handler(offset, block_stack, loop_scope);

        if metadata.has_broken(loop_scope) {
            push_unique(successors, detour.unwrap_or(loop_record.exit));
            if detour.is_none() {
                metadata.remove_broken(loop_scope);
            }
        }

        let restarts: SmallVec<[Offset; 1]> = metadata.continue_targets(loop_scope).collect();
        if !restarts.is_empty() {
            match detour {
                Some(handler) => push_unique(successors, handler),
                None => {
                    for restart in restarts {
                        push_unique(successors, restart);
                    }
                    metadata.remove_continued(loop_scope);
                }
            }
        }
    }

    /// Returns the handler entry an exception raised at `offset` transfers
    /// control to, or `None` if it propagates out of the function.
    pub(crate) fn exception_target(
        &self,
        offset: Offset,
        block_stack: BlockStackView,
    ) -> Option<Offset> {
        let mut current = block_stack;
        loop {
            let id = current.top()?;
            let scope = &self.scopes[id];
            // An exception inside a handler propagates to the enclosing scope.
            if scope.kind.catches_exceptions() && offset < scope.exit {
                return Some(scope.exit);
            }
            current = current.pop(self.scopes).ok()?;
        }
    }

    /// Returns the first place a `return` at `offset` transfers control to:
    /// the innermost `finally` or `with` handler that has not started yet, or
    /// the function exit.
    fn return_target(&self, offset: Offset, block_stack: BlockStackView) -> Offset {
        block_stack
            .iter(self.scopes)
            .find(|(_, scope)| scope.kind.intercepts_unwinding() && offset < scope.exit)
            .map_or(Offset::EXIT, |(_, scope)| scope.exit)
    }

    /// Returns the handler of the innermost `finally` or `with` scope between
    /// `offset` and `loop_scope` that intercepts a jump out of it.
    fn intercepting_handler(
        &self,
        offset: Offset,
        block_stack: BlockStackView,
        loop_scope: ScopeId,
    ) -> Option<Offset> {
        block_stack
            .iter(self.scopes)
            .take_while(|(id, _)| *id != loop_scope)
            .find(|(_, scope)| scope.kind.intercepts_unwinding() && offset < scope.exit)
            .map(|(_, scope)| scope.exit)
    }

    fn unwind(
        &self,
        instruction: &Instruction,
        block_stack: BlockStackView,
    ) -> Result<Unwind, CfgError> {
        let (loop_scope, _) = block_stack
            .iter(self.scopes)
            .find(|(_, scope)| scope.kind == ScopeKind::Loop)
            .ok_or(CfgError::MissingScope {
                offset: instruction.offset,
                opcode: instruction.opcode,
            })?;

        Ok(
            match self.intercepting_handler(instruction.offset, block_stack, loop_scope) {
                Some(handler) => Unwind::Detour {
                    loop_scope,
                    handler,
                },
                None => Unwind::Direct { loop_scope },
            },
        )
    }
}

fn push_unique(successors: &mut Successors, offset: Offset) {
    if !successors.contains(&offset) {
        successors.push(offset);
    }
}
