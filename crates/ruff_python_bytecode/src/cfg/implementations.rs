use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::cfg::block_stack::{BlockStackView, ScopeArena};
use crate::cfg::builder::{CFGConstructor, ControlFlowGraph};
use crate::cfg::error::{CfgError, LookupError};
use crate::cfg::metadata::PathMetadata;
use crate::cfg::resolver::Successors;
use crate::instruction::{Instruction, Offset};

/// Builds the control-flow graph of one code unit.
///
/// `instructions` must be in ascending offset order, starting at offset 0.
pub fn build_cfg(instructions: &[Instruction]) -> Result<CFG, CfgError> {
    let mut builder = CFGConstructor::with_capacity(instructions.len());
    builder.process_instructions(instructions)?;
    builder.build()
}

/// One reachable instruction and its outgoing edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub(crate) offset: Offset,
    pub(crate) instruction: Option<Instruction>,
    pub(crate) successors: Successors,
    /// The block stack when the instruction starts executing.
    pub(crate) block_stack: BlockStackView,
    /// Facts about the paths reaching the instruction.
    pub(crate) metadata: PathMetadata,
    /// What the successors inherit from this node.
    pub(crate) out_block_stack: BlockStackView,
    pub(crate) out_metadata: PathMetadata,
}

impl Node {
    pub(crate) fn exit() -> Self {
        Self {
            offset: Offset::EXIT,
            instruction: None,
            successors: Successors::new(),
            block_stack: BlockStackView::EMPTY,
            metadata: PathMetadata::default(),
            out_block_stack: BlockStackView::EMPTY,
            out_metadata: PathMetadata::default(),
        }
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// The instruction at this node. `None` for the function-exit sentinel.
    pub fn instruction(&self) -> Option<&Instruction> {
        self.instruction.as_ref()
    }

    pub fn successors(&self) -> &[Offset] {
        &self.successors
    }

    pub fn block_stack(&self) -> BlockStackView {
        self.block_stack
    }

    pub fn metadata(&self) -> &PathMetadata {
        &self.metadata
    }

    /// Facts about the paths leaving the instruction.
    pub fn out_metadata(&self) -> &PathMetadata {
        &self.out_metadata
    }

    pub fn is_exit(&self) -> bool {
        self.offset.is_exit()
    }
}

/// A control-flow graph at single-instruction granularity.
///
/// Nodes are stored in ascending offset order, followed by the function-exit
/// sentinel at offset `-1`.
#[derive(Debug, Clone)]
pub struct CFG {
    pub(crate) nodes: Vec<Node>,
    pub(crate) index: FxHashMap<Offset, usize>,
    pub(crate) predecessors: FxHashMap<Offset, SmallVec<[Offset; 2]>>,
    pub(crate) scopes: ScopeArena,
}

impl CFG {
    pub fn node(&self, offset: Offset) -> Result<&Node, LookupError> {
        self.get(offset).ok_or(LookupError::NodeNotFound(offset))
    }

    pub fn get(&self, offset: Offset) -> Option<&Node> {
        self.index.get(&offset).map(|&index| &self.nodes[index])
    }

    pub fn contains(&self, offset: Offset) -> bool {
        self.index.contains_key(&offset)
    }

    /// Iterates nodes in ascending offset order. The exit sentinel comes last.
    pub fn nodes(&self) -> impl ExactSizeIterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn successors(&self, offset: Offset) -> Result<&[Offset], LookupError> {
        self.node(offset).map(Node::successors)
    }

    /// Offsets of the nodes with an edge to `offset`, in ascending order.
    pub fn predecessors(&self, offset: Offset) -> &[Offset] {
        self.predecessors
            .get(&offset)
            .map(|preds| preds.as_slice())
            .unwrap_or_default()
    }

    /// The position of `to` in the successor list of `from`.
    pub fn edge_number(&self, from: Offset, to: Offset) -> Option<usize> {
        self.get(from)?
            .successors
            .iter()
            .position(|successor| *successor == to)
    }

    /// The scopes referenced by the block stacks of this graph's nodes.
    pub fn scopes(&self) -> &ScopeArena {
        &self.scopes
    }
}

impl ControlFlowGraph for CFG {
    type Node = Offset;

    fn initial(&self) -> Offset {
        Offset::ENTRY
    }

    fn terminal(&self) -> Offset {
        Offset::EXIT
    }

    fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn node_ids(&self) -> impl Iterator<Item = Offset> {
        self.nodes.iter().map(Node::offset)
    }

    fn out(&self, node: Offset) -> &[Offset] {
        self.get(node).map(Node::successors).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Opcode;

    fn offset(value: i32) -> Offset {
        Offset::new(value)
    }

    /// `def empty(): pass`
    fn empty_function() -> Vec<Instruction> {
        vec![
            Instruction::new(Opcode::LoadConst, offset(0), Some(0)),
            Instruction::new(Opcode::ReturnValue, offset(2), None),
        ]
    }

    #[test]
    fn test_empty_function() {
        let cfg = build_cfg(&empty_function()).unwrap();

        // Two instructions and the exit sentinel.
        assert_eq!(cfg.num_nodes(), 3);

        let initial = cfg.node(cfg.initial()).unwrap();
        assert_eq!(initial.instruction().unwrap().opcode, Opcode::LoadConst);
        assert_eq!(initial.successors(), &[offset(2)]);

        let ret = cfg.node(offset(2)).unwrap();
        assert_eq!(ret.successors(), &[cfg.terminal()]);
        assert!(!ret.metadata().returned());
        assert!(ret.out_metadata().returned());

        let exit = cfg.node(cfg.terminal()).unwrap();
        assert!(exit.is_exit());
        assert!(exit.instruction().is_none());
        assert!(exit.successors().is_empty());
    }

    #[test]
    fn test_lookups() {
        let cfg = build_cfg(&empty_function()).unwrap();

        assert_eq!(
            cfg.node(offset(4)).unwrap_err(),
            LookupError::NodeNotFound(offset(4))
        );
        assert!(cfg.successors(offset(7)).is_err());
        assert_eq!(cfg.predecessors(offset(2)), &[offset(0)]);
        assert_eq!(cfg.predecessors(Offset::EXIT), &[offset(2)]);
        assert!(cfg.predecessors(offset(0)).is_empty());
        assert_eq!(cfg.edge_number(offset(2), Offset::EXIT), Some(0));
        assert_eq!(cfg.edge_number(offset(0), Offset::EXIT), None);
    }

    #[test]
    fn test_node_order() {
        let cfg = build_cfg(&empty_function()).unwrap();
        let offsets: Vec<i32> = cfg.nodes().map(|node| node.offset().as_i32()).collect();
        assert_eq!(offsets, [0, 2, -1]);
    }
}
