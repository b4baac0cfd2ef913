use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::cfg::block_stack::{BlockStackView, ScopeArena};
use crate::cfg::error::CfgError;
use crate::cfg::implementations::{Node, CFG};
use crate::cfg::metadata::PathMetadata;
use crate::cfg::resolver::Resolver;
use crate::instruction::{Instruction, Offset, OpcodeClass};

pub trait ControlFlowGraph {
    type Node: Copy;

    fn initial(&self) -> Self::Node;

    fn terminal(&self) -> Self::Node;

    fn num_nodes(&self) -> usize;

    /// All nodes, in a stable order.
    fn node_ids(&self) -> impl Iterator<Item = Self::Node>;

    /// Get the targets of the outgoing edges of a node
    fn out(&self, node: Self::Node) -> &[Self::Node];
}

/// Builds a [`CFG`] in a single forward pass over an instruction stream.
///
/// Instructions are visited in ascending offset order. Since protected regions
/// are properly nested, every predecessor that can influence the block stack of
/// an instruction has been visited by the time the instruction itself is: the
/// only edges from later instructions are loop back-edges, and those never
/// change the block stack at the loop header.
#[derive(Debug)]
pub struct CFGConstructor {
    nodes: Vec<Node>,
    index: FxHashMap<Offset, usize>,
    predecessors: FxHashMap<Offset, SmallVec<[Offset; 2]>>,
    scopes: ScopeArena,
    reachable: FxHashSet<Offset>,
    unreachable: FxHashSet<Offset>,
    /// The block stack in effect before each `SETUP_*` instruction, keyed by
    /// the handler entry it declares.
    handler_entries: FxHashMap<Offset, BlockStackView>,
}

impl CFGConstructor {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut reachable = FxHashSet::default();
        reachable.insert(Offset::ENTRY);

        Self {
            nodes: Vec::with_capacity(capacity + 1),
            index: FxHashMap::default(),
            predecessors: FxHashMap::default(),
            scopes: ScopeArena::default(),
            reachable,
            unreachable: FxHashSet::default(),
            handler_entries: FxHashMap::default(),
        }
    }

    /// Creates a node for every reachable instruction.
    pub fn process_instructions(&mut self, instructions: &[Instruction]) -> Result<(), CfgError> {
        let first = instructions.first().ok_or(CfgError::EmptyCode)?;
        if first.offset != Offset::ENTRY {
            return Err(CfgError::MissingEntry(first.offset));
        }

        for (position, instruction) in instructions.iter().enumerate() {
            if !self.is_live(instruction) {
                tracing::debug!(
                    offset = %instruction.offset,
                    opcode = %instruction.opcode,
                    "skipping unreachable instruction"
                );
                // Whatever a dead jump targets is not reachable through it.
                if let Some(target) = instruction.jump_target() {
                    self.unreachable.insert(target);
                }
                continue;
            }

            let next = instructions.get(position + 1).map(|next| next.offset);
            self.process_instruction(instruction, next)?;
        }

        Ok(())
    }

    fn is_live(&self, instruction: &Instruction) -> bool {
        self.reachable.contains(&instruction.offset)
            || (instruction.is_jump_target && !self.unreachable.contains(&instruction.offset))
    }

    fn process_instruction(
        &mut self,
        instruction: &Instruction,
        next: Option<Offset>,
    ) -> Result<(), CfgError> {
        let offset = instruction.offset;
        let (block_stack, metadata) = self.join(instruction)?;

        if let OpcodeClass::SetupScope(_) = instruction.opcode.class() {
            if let Some(handler) = instruction.jump_target() {
                self.handler_entries.entry(handler).or_insert(block_stack);
            }
        }

        let resolution =
            Resolver::new(&mut self.scopes).resolve(instruction, next, block_stack, metadata.clone())?;

        tracing::trace!(
            %offset,
            opcode = %instruction.opcode,
            successors = ?resolution.successors,
            block_stack = %block_stack.display(&self.scopes),
            "resolved instruction"
        );

        for successor in &resolution.successors {
            self.reachable.insert(*successor);
            self.predecessors.entry(*successor).or_default().push(offset);
        }

        self.index.insert(offset, self.nodes.len());
        self.nodes.push(Node {
            offset,
            instruction: Some(*instruction),
            successors: resolution.successors,
            block_stack,
            metadata,
            out_block_stack: resolution.block_stack,
            out_metadata: resolution.metadata,
        });

        Ok(())
    }

    /// Computes the block stack and path metadata at `instruction` from its
    /// already-visited predecessors.
    fn join(&self, instruction: &Instruction) -> Result<(BlockStackView, PathMetadata), CfgError> {
        let offset = instruction.offset;
        let predecessors = self
            .predecessors
            .get(&offset)
            .map(|predecessors| predecessors.as_slice())
            .unwrap_or_default();
        let processed = |predecessor: &Offset| &self.nodes[self.index[predecessor]];

        let mut joined: Option<(BlockStackView, Offset)> = None;
        for predecessor in predecessors {
            // Scopes whose region ends at or before this offset were left on the
            // way here.
            let block_stack = processed(predecessor)
                .out_block_stack
                .pop_until(&self.scopes, offset);

            match joined {
                None => joined = Some((block_stack, *predecessor)),
                Some((expected, expected_from)) if expected.top() != block_stack.top() => {
                    return Err(CfgError::InconsistentBlockStack {
                        offset,
                        opcode: instruction.opcode,
                        expected: expected.display(&self.scopes).to_string(),
                        expected_from,
                        found: block_stack.display(&self.scopes).to_string(),
                        found_from: *predecessor,
                    });
                }
                Some(_) => {}
            }
        }

        let metadata = PathMetadata::join(
            predecessors
                .iter()
                .map(|predecessor| &processed(predecessor).out_metadata),
        );

        if let Some((block_stack, _)) = joined {
            return Ok((block_stack, metadata));
        }

        // A handler nothing can raise into is still entered with the block
        // stack its `SETUP_*` instruction saw.
        if let Some(block_stack) = self.handler_entries.get(&offset) {
            tracing::debug!(%offset, "handler entry has no predecessors");
            return Ok((block_stack.pop_until(&self.scopes, offset), metadata));
        }

        if offset != Offset::ENTRY {
            tracing::debug!(%offset, "jump target has no visited predecessors");
        }
        Ok((BlockStackView::EMPTY, metadata))
    }

    pub fn build(mut self) -> Result<CFG, CfgError> {
        self.index.insert(Offset::EXIT, self.nodes.len());
        self.nodes.push(Node::exit());

        for node in &self.nodes {
            for successor in &node.successors {
                if !self.index.contains_key(successor) {
                    return Err(CfgError::DanglingEdge {
                        from: node.offset,
                        to: *successor,
                    });
                }
            }
        }

        Ok(CFG {
            nodes: self.nodes,
            index: self.index,
            predecessors: self.predecessors,
            scopes: self.scopes,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use test_case::test_case;

    use super::*;
    use crate::cfg::block_stack::ScopeKind;
    use crate::cfg::implementations::build_cfg;
    use crate::instruction::Opcode;
    use crate::listing::parse_listing;

    fn fixture(name: &str) -> CFG {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("resources/test/fixtures/cfg")
            .join(name);
        let source = std::fs::read_to_string(&path).unwrap();
        let instructions = parse_listing(&source).unwrap();
        build_cfg(&instructions).unwrap()
    }

    fn offsets(values: &[i32]) -> Vec<Offset> {
        values.iter().copied().map(Offset::new).collect()
    }

    fn successors(cfg: &CFG, offset: i32) -> Vec<i32> {
        cfg.successors(Offset::new(offset))
            .unwrap()
            .iter()
            .map(|successor| successor.as_i32())
            .collect()
    }

    fn node_offsets(cfg: &CFG) -> Vec<i32> {
        cfg.nodes().map(|node| node.offset().as_i32()).collect()
    }

    #[test_case("for_break.txt")]
    #[test_case("nested_loops.txt")]
    #[test_case("try_finally_return.txt")]
    #[test_case("loop_try_finally_break.txt")]
    #[test_case("try_except.txt")]
    #[test_case("try_except_raise.txt")]
    #[test_case("with_try_return.txt")]
    #[test_case("while_continue_finally.txt")]
    #[test_case("for_else_break.txt")]
    #[test_case("while_else.txt")]
    #[test_case("loop_nested_finally_break.txt")]
    #[test_case("loop_with_continue.txt")]
    fn all_successors_exist(name: &str) {
        let cfg = fixture(name);
        for node in cfg.nodes() {
            for successor in node.successors() {
                assert!(
                    successor.is_exit() || cfg.contains(*successor),
                    "{name}: {} -> {successor}",
                    node.offset()
                );
            }
        }
    }

    #[test_case("for_break.txt")]
    #[test_case("try_except.txt")]
    #[test_case("with_try_return.txt")]
    fn single_entry_and_exit(name: &str) {
        let cfg = fixture(name);
        let entries: Vec<Offset> = cfg
            .nodes()
            .filter(|node| cfg.predecessors(node.offset()).is_empty())
            .map(Node::offset)
            .collect();
        assert_eq!(entries, [Offset::ENTRY]);
        assert!(cfg.node(Offset::EXIT).unwrap().successors().is_empty());
        assert_eq!(cfg.nodes().last().unwrap().offset(), Offset::EXIT);
    }

    #[test_case("loop_try_finally_break.txt")]
    #[test_case("with_try_return.txt")]
    fn construction_is_deterministic(name: &str) {
        let first = fixture(name);
        let second = fixture(name);
        assert!(first.nodes().eq(second.nodes()));
    }

    #[test]
    fn for_loop_with_conditional_break() {
        let cfg = fixture("for_break.txt");

        // `FOR_ITER` enters the body or leaves the loop.
        assert_eq!(successors(&cfg, 10), [12, 34]);
        assert_eq!(successors(&cfg, 28), [30, 10]);
        // `BREAK_LOOP` jumps straight past the `POP_BLOCK`.
        assert_eq!(successors(&cfg, 30), [36]);
        assert_eq!(successors(&cfg, 38), [-1]);

        assert_eq!(cfg.predecessors(Offset::new(10)), offsets(&[8, 28]));
        assert_eq!(cfg.predecessors(Offset::new(34)), offsets(&[10]));
        assert_eq!(cfg.predecessors(Offset::new(36)), offsets(&[30, 34]));
        assert_eq!(cfg.edge_number(Offset::new(8), Offset::new(10)), Some(0));
        assert_eq!(cfg.edge_number(Offset::new(28), Offset::new(10)), Some(1));

        let loop_exit = cfg.node(Offset::new(36)).unwrap();
        assert!(loop_exit.block_stack().is_empty());
        let body = cfg.node(Offset::new(30)).unwrap();
        assert_eq!(
            body.block_stack().peek(cfg.scopes(), 0).unwrap().kind,
            ScopeKind::Loop
        );
    }

    #[test]
    fn dead_code_is_pruned() {
        let cfg = fixture("for_break.txt");

        // The `JUMP_ABSOLUTE` after `BREAK_LOOP` can never run.
        assert!(!cfg.contains(Offset::new(32)));
        assert_eq!(
            node_offsets(&cfg),
            [0, 2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 22, 24, 26, 28, 30, 34, 36, 38, -1]
        );
    }

    #[test]
    fn inner_break_exits_the_inner_loop_only() {
        let cfg = fixture("nested_loops.txt");

        assert_eq!(successors(&cfg, 20), [26]);
        assert!(!cfg.contains(Offset::new(22)));
        assert_eq!(successors(&cfg, 26), [6]);
        assert_eq!(cfg.predecessors(Offset::new(30)), offsets(&[28]));
        for node in cfg.nodes() {
            if node.offset() != Offset::new(28) {
                assert!(!node.successors().contains(&Offset::new(30)));
            }
        }

        // Both ways into the inner loop's exit agree that only the outer loop
        // is still active.
        let inner_exit = cfg.node(Offset::new(26)).unwrap();
        assert_eq!(inner_exit.block_stack().depth(cfg.scopes()), 1);
    }

    #[test]
    fn finally_intercepts_return() {
        let cfg = fixture("try_finally_return.txt");

        // The `try` body's return runs the `finally` first.
        assert_eq!(successors(&cfg, 4), [10]);
        assert_eq!(successors(&cfg, 2), [4, 10]);
        assert_eq!(successors(&cfg, 12), [-1]);
        assert_eq!(cfg.predecessors(Offset::EXIT), offsets(&[12]));
        assert_eq!(node_offsets(&cfg), [0, 2, 4, 10, 12, -1]);

        let finally = cfg.node(Offset::new(10)).unwrap();
        assert!(finally.metadata().returned());
        assert!(finally.block_stack().is_empty());
    }

    #[test]
    fn break_inside_finally_is_deferred() {
        let cfg = fixture("loop_try_finally_break.txt");

        assert_eq!(successors(&cfg, 24), [30]);
        assert_eq!(successors(&cfg, 22), [24, 26]);
        // `END_FINALLY` resumes the break.
        assert_eq!(successors(&cfg, 38), [40, 44]);
        assert_eq!(cfg.predecessors(Offset::new(44)), offsets(&[38, 42]));

        let end_finally = cfg.node(Offset::new(38)).unwrap();
        assert_eq!(end_finally.metadata().broken_loops().len(), 1);
        let after = cfg.node(Offset::new(40)).unwrap();
        assert!(after.metadata().broken_loops().is_empty());
    }

    #[test]
    fn try_except_paths_rejoin() {
        let cfg = fixture("try_except.txt");

        for offset in [2, 4] {
            assert_eq!(successors(&cfg, offset), [offset + 2, 10]);
        }
        // `POP_BLOCK` cannot raise.
        assert_eq!(successors(&cfg, 6), [8]);
        // A bare `except` never re-raises, so the `END_FINALLY` is dead.
        assert!(!cfg.contains(Offset::new(28)));
        assert_eq!(cfg.predecessors(Offset::new(30)), offsets(&[8, 26]));
        // The handler runs outside of the protected region.
        assert_eq!(successors(&cfg, 20), [22]);
        assert!(cfg.node(Offset::new(10)).unwrap().block_stack().is_empty());
    }

    #[test]
    fn reraise_inside_handler() {
        let cfg = fixture("try_except_raise.txt");

        assert_eq!(successors(&cfg, 24), [26, -1]);
        assert!(cfg.node(Offset::new(26)).unwrap().metadata().raised());
        // Nothing encloses the handler, so `END_FINALLY` only falls through.
        assert_eq!(successors(&cfg, 30), [32]);
        assert_eq!(cfg.predecessors(Offset::new(32)), offsets(&[8, 28, 30]));
    }

    #[test]
    fn return_inside_with_runs_cleanup() {
        let cfg = fixture("with_try_return.txt");

        assert_eq!(successors(&cfg, 42), [54]);
        assert_eq!(successors(&cfg, 18), [20, 26]);
        assert_eq!(successors(&cfg, 26), [28, 54]);
        assert_eq!(successors(&cfg, 48), [50, 54]);
        assert_eq!(successors(&cfg, 58), [60, -1]);
        assert!(!cfg.contains(Offset::new(44)));
        assert!(!cfg.contains(Offset::new(46)));

        let cleanup = cfg.node(Offset::new(54)).unwrap();
        assert!(cleanup.metadata().returned());
        assert!(cleanup.block_stack().is_empty());
        assert!(!cfg.node(Offset::new(60)).unwrap().metadata().returned());

        let pop_block = cfg.node(Offset::new(50)).unwrap();
        assert_eq!(
            pop_block.block_stack().peek(cfg.scopes(), 0).unwrap().kind,
            ScopeKind::With
        );
    }

    #[test]
    fn continue_inside_finally_is_deferred() {
        let cfg = fixture("while_continue_finally.txt");

        assert_eq!(successors(&cfg, 8), [14]);
        assert_eq!(successors(&cfg, 14), [16, 2]);
        assert_eq!(cfg.predecessors(Offset::new(2)), offsets(&[0, 14, 16]));
        assert!(!cfg.contains(Offset::new(10)));
        assert!(!cfg.contains(Offset::new(12)));
    }

    #[test_case("for_else_break.txt", 24, &[30]; "break in for else leaves the outer loop")]
    #[test_case("while_else.txt", 6, &[18]; "break in while skips the else")]
    #[test_case("loop_nested_finally_break.txt", 26, &[28, 32]; "inner end finally defers to outer finally")]
    #[test_case("loop_nested_finally_break.txt", 38, &[40, 44]; "outer end finally resumes the break")]
    #[test_case("loop_with_continue.txt", 16, &[22]; "continue enters with cleanup")]
    #[test_case("loop_with_continue.txt", 26, &[28, 6]; "with cleanup resumes the continue")]
    fn unwinding_edges(name: &str, offset: i32, expected: &[i32]) {
        let cfg = fixture(name);
        assert_eq!(successors(&cfg, offset), expected);
    }

    #[test]
    fn loop_else_runs_outside_the_loop() {
        let cfg = fixture("for_else_break.txt");

        // The inner loop's `POP_BLOCK` leaves the outer loop on top.
        let break_in_else = cfg.node(Offset::new(24)).unwrap();
        assert_eq!(break_in_else.block_stack().depth(cfg.scopes()), 1);
        assert_eq!(
            break_in_else.block_stack().peek(cfg.scopes(), 0).unwrap().exit,
            Offset::new(30)
        );
        assert_eq!(cfg.predecessors(Offset::new(30)), offsets(&[24, 28]));
        assert!(cfg.node(Offset::new(30)).unwrap().block_stack().is_empty());

        let cfg = fixture("while_else.txt");
        assert!(!cfg.contains(Offset::new(8)));
        assert!(cfg.node(Offset::new(12)).unwrap().block_stack().is_empty());
        assert_eq!(cfg.predecessors(Offset::new(18)), offsets(&[6, 16]));
    }

    #[test]
    fn break_through_nested_finally_blocks() {
        let cfg = fixture("loop_nested_finally_break.txt");

        assert_eq!(successors(&cfg, 14), [20]);
        assert!(!cfg.contains(Offset::new(16)));
        assert!(!cfg.contains(Offset::new(18)));

        let outer_finally = cfg.node(Offset::new(32)).unwrap();
        assert_eq!(
            cfg.predecessors(Offset::new(32)),
            offsets(&[20, 22, 24, 26, 30])
        );
        assert_eq!(outer_finally.metadata().broken_loops().len(), 1);
        assert_eq!(
            outer_finally.block_stack().peek(cfg.scopes(), 0).unwrap().kind,
            ScopeKind::Loop
        );

        let after_loop = cfg.node(Offset::new(44)).unwrap();
        assert_eq!(cfg.predecessors(Offset::new(44)), offsets(&[38, 42]));
        assert!(after_loop.block_stack().is_empty());
        assert!(after_loop.metadata().broken_loops().is_empty());
    }

    #[test]
    fn continue_through_with_is_deferred() {
        let cfg = fixture("loop_with_continue.txt");

        let cleanup = cfg.node(Offset::new(22)).unwrap();
        assert_eq!(cfg.predecessors(Offset::new(22)), offsets(&[14, 16]));
        let loop_scope = cleanup.block_stack().top().unwrap();
        assert_eq!(
            cleanup.metadata().continue_targets(loop_scope).collect::<Vec<_>>(),
            offsets(&[6])
        );

        let end_finally = cfg.node(Offset::new(26)).unwrap();
        assert_eq!(end_finally.metadata().continue_targets(loop_scope).count(), 1);
        assert_eq!(end_finally.out_metadata().continue_targets(loop_scope).count(), 0);
        assert_eq!(cfg.predecessors(Offset::new(6)), offsets(&[4, 26, 28]));
        assert!(!cfg.contains(Offset::new(18)));
    }

    #[test]
    fn empty_code_is_malformed() {
        assert_eq!(build_cfg(&[]).unwrap_err(), CfgError::EmptyCode);
    }

    #[test]
    fn code_must_start_at_offset_zero() {
        let instructions = [Instruction::new(Opcode::ReturnValue, Offset::new(2), None)];
        assert_eq!(
            build_cfg(&instructions).unwrap_err(),
            CfgError::MissingEntry(Offset::new(2))
        );
    }

    #[test]
    fn break_outside_loop_is_malformed() {
        let instructions = parse_listing(
            "
            0 BREAK_LOOP
            2 LOAD_CONST 0
            4 RETURN_VALUE
            ",
        )
        .unwrap();
        assert_eq!(
            build_cfg(&instructions).unwrap_err(),
            CfgError::MissingScope {
                offset: Offset::ENTRY,
                opcode: Opcode::BreakLoop
            }
        );
    }

    #[test]
    fn disagreeing_block_stacks_are_malformed() {
        // Offset 8 is reached both inside and outside of the loop.
        let instructions = parse_listing(
            "
            0 LOAD_FAST 0
            2 POP_JUMP_IF_FALSE 8
            4 SETUP_LOOP 8 (to 14)
            6 JUMP_FORWARD 0 (to 8)
            8 LOAD_CONST 0
            10 RETURN_VALUE
            ",
        )
        .unwrap();
        let error = build_cfg(&instructions).unwrap_err();
        assert_eq!(
            error,
            CfgError::InconsistentBlockStack {
                offset: Offset::new(8),
                opcode: Opcode::LoadConst,
                expected: "[]".to_string(),
                expected_from: Offset::new(2),
                found: "[loop at 4 (exit 14)]".to_string(),
                found_from: Offset::new(6),
            }
        );
        assert_eq!(
            error.to_string(),
            "predecessors of `LOAD_CONST` at offset 8 disagree on the innermost block: \
            [] (via 2) vs [loop at 4 (exit 14)] (via 6)"
        );
    }

    #[test]
    fn falling_off_the_end_is_malformed() {
        let instructions = parse_listing("0 LOAD_CONST 0").unwrap();
        assert_eq!(
            build_cfg(&instructions).unwrap_err(),
            CfgError::FallsOffEnd {
                offset: Offset::ENTRY,
                opcode: Opcode::LoadConst
            }
        );
    }

    #[test]
    fn jump_to_missing_instruction_is_malformed() {
        let instructions = parse_listing(
            "
            0 JUMP_ABSOLUTE 6
            2 LOAD_CONST 0
            4 RETURN_VALUE
            ",
        )
        .unwrap();
        assert_eq!(
            build_cfg(&instructions).unwrap_err(),
            CfgError::DanglingEdge {
                from: Offset::ENTRY,
                to: Offset::new(6)
            }
        );
    }

    #[test]
    fn unreachable_handler_keeps_its_block_stack() {
        // while True:
        //     try:
        //         pass
        //     except:
        //         pass
        let instructions = parse_listing(
            "
            0 SETUP_LOOP 20 (to 22)
            2 SETUP_EXCEPT 4 (to 8)
            4 POP_BLOCK
            6 JUMP_FORWARD 8 (to 16)
            8 POP_TOP
            10 POP_TOP
            12 POP_TOP
            14 POP_EXCEPT
            16 JUMP_ABSOLUTE 2
            18 POP_BLOCK
            20 LOAD_CONST 0
            22 LOAD_CONST 0
            24 RETURN_VALUE
            ",
        )
        .unwrap();
        let cfg = build_cfg(&instructions).unwrap();

        let handler = cfg.node(Offset::new(8)).unwrap();
        assert!(cfg.predecessors(Offset::new(8)).is_empty());
        assert_eq!(
            handler.block_stack().peek(cfg.scopes(), 0).unwrap().kind,
            ScopeKind::Loop
        );
        assert_eq!(successors(&cfg, 14), [16]);
        // `POP_EXCEPT` falls into the jump that was also reached from the
        // `try` body.
        assert_eq!(cfg.predecessors(Offset::new(16)), offsets(&[6, 14]));
    }
}
