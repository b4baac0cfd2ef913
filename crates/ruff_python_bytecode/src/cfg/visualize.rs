//! Rendering of control-flow graphs as Mermaid flowcharts and Graphviz DOT.
use std::fmt::{self, Display};

use crate::cfg::builder::ControlFlowGraph;
use crate::cfg::implementations::CFG;
use crate::instruction::Offset;

#[derive(Debug, Default)]
pub enum MermaidNodeShape {
    #[default]
    Rectangle,
    /// Instructions with more than one successor.
    Rhombus,
    /// The function exit.
    Stadium,
}

impl MermaidNodeShape {
    fn open_close(&self) -> (&'static str, &'static str) {
        match self {
            Self::Rectangle => ("[", "]"),
            Self::Rhombus => ("{", "}"),
            Self::Stadium => ("([", "])"),
        }
    }
}

pub struct MermaidNode {
    shape: MermaidNodeShape,
    content: String,
}

impl MermaidNode {
    pub fn with_content(content: String) -> Self {
        Self {
            shape: MermaidNodeShape::default(),
            content,
        }
    }

    #[must_use]
    pub fn with_shape(mut self, shape: MermaidNodeShape) -> Self {
        self.shape = shape;
        self
    }

    fn mermaid_write_quoted_str(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
        let mut parts = value.split('"');
        if let Some(v) = parts.next() {
            write!(f, "{v}")?;
        }
        for v in parts {
            write!(f, "#quot;{v}")?;
        }
        Ok(())
    }
}

impl Display for MermaidNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (open, close) = self.shape.open_close();
        write!(f, "{open}\"")?;
        if self.content.is_empty() {
            write!(f, "empty")?;
        } else {
            MermaidNode::mermaid_write_quoted_str(f, &self.content)?;
        }
        write!(f, "\"{close}")
    }
}

#[derive(Debug)]
pub enum MermaidEdgeKind {
    Arrow,
    /// Edges into the function exit.
    DottedArrow,
}

impl Display for MermaidEdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MermaidEdgeKind::Arrow => write!(f, "-->"),
            MermaidEdgeKind::DottedArrow => write!(f, "-.->"),
        }
    }
}

#[derive(Debug)]
pub struct MermaidEdge {
    kind: MermaidEdgeKind,
    content: String,
}

impl MermaidEdge {
    pub fn new(kind: MermaidEdgeKind) -> Self {
        Self {
            kind,
            content: String::new(),
        }
    }

    #[must_use]
    pub fn with_content(mut self, content: String) -> Self {
        self.content = content;
        self
    }
}

impl Display for MermaidEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.content.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}|\"{}\"|", self.kind, self.content)
        }
    }
}

pub trait MermaidGraph: ControlFlowGraph {
    /// The Mermaid identifier of a node.
    fn node_name(&self, node: Self::Node) -> String;

    fn draw_node(&self, node: Self::Node) -> MermaidNode;

    fn draw_edges(&self, node: Self::Node) -> impl Iterator<Item = (Self::Node, MermaidEdge)>;

    fn draw_graph(&self) -> String {
        let mut graph = Vec::new();

        // Begin mermaid graph.
        graph.push("flowchart TD".to_string());

        // Draw nodes
        for node in self.node_ids() {
            graph.push(format!(
                "    {}{}",
                self.node_name(node),
                &self.draw_node(node)
            ));
        }

        // Draw edges
        for node in self.node_ids() {
            graph.extend(self.draw_edges(node).map(|(target, edge)| {
                format!(
                    "    {}{}{}",
                    self.node_name(node),
                    edge,
                    self.node_name(target)
                )
            }));
        }
        graph.join("\n")
    }
}

impl MermaidGraph for CFG {
    fn node_name(&self, node: Offset) -> String {
        if node.is_exit() {
            "exit".to_string()
        } else {
            format!("node{node}")
        }
    }

    fn draw_node(&self, node: Offset) -> MermaidNode {
        match self.get(node).and_then(|node| node.instruction()) {
            Some(instruction) => {
                let shape = if self.out(node).len() > 1 {
                    MermaidNodeShape::Rhombus
                } else {
                    MermaidNodeShape::Rectangle
                };
                MermaidNode::with_content(instruction.to_string()).with_shape(shape)
            }
            None => {
                MermaidNode::with_content("EXIT".to_string()).with_shape(MermaidNodeShape::Stadium)
            }
        }
    }

    /// Edges are numbered in successor order when there is more than one.
    fn draw_edges(&self, node: Offset) -> impl Iterator<Item = (Offset, MermaidEdge)> {
        let successors = self.out(node);
        let numbered = successors.len() > 1;
        successors.iter().enumerate().map(move |(index, target)| {
            let kind = if target.is_exit() {
                MermaidEdgeKind::DottedArrow
            } else {
                MermaidEdgeKind::Arrow
            };
            let edge = MermaidEdge::new(kind);
            let edge = if numbered {
                edge.with_content(index.to_string())
            } else {
                edge
            };
            (*target, edge)
        })
    }
}

impl CFG {
    /// Renders the graph as a Mermaid flowchart.
    pub fn draw_graph(&self) -> String {
        MermaidGraph::draw_graph(self)
    }

    /// Renders the graph in Graphviz DOT format.
    pub fn to_dot(&self) -> String {
        let mut dot = vec![
            "digraph cfg {".to_string(),
            "    node [shape=box, fontname=monospace];".to_string(),
        ];

        for node in self.nodes() {
            let label = match node.instruction() {
                Some(instruction) => instruction.to_string().replace('"', "\\\""),
                None => "EXIT".to_string(),
            };
            let shape = if node.is_exit() { ", shape=oval" } else { "" };
            dot.push(format!(
                "    \"{}\" [label=\"{label}\"{shape}];",
                node.offset()
            ));
        }

        for node in self.nodes() {
            dot.extend(
                node.successors()
                    .iter()
                    .enumerate()
                    .map(|(index, successor)| {
                        format!(
                            "    \"{}\" -> \"{successor}\" [label=\"{index}\"];",
                            node.offset()
                        )
                    }),
            );
        }

        dot.push("}".to_string());
        dot.join("\n")
    }
}
