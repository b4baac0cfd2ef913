//! Options for verifying observed paths against a graph.

use std::fmt;

/// How [`replay`](crate::cfg::replay::replay) treats an offset that appears twice in a
/// row in an observed path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum SelfLoopPolicy {
    /// Accept the repetition only if the node has an edge to itself.
    #[default]
    Reject,
    /// Treat the repetition as a single visit. Tracers may report the same
    /// offset twice when an instruction is re-entered without a jump.
    Collapse,
}

impl fmt::Display for SelfLoopPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject => f.write_str("reject"),
            Self::Collapse => f.write_str("collapse"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default, rename_all = "kebab-case")
)]
pub struct ReplayOptions {
    pub self_loops: SelfLoopPolicy,
}

impl ReplayOptions {
    #[must_use]
    pub fn with_self_loops(mut self, self_loops: SelfLoopPolicy) -> Self {
        self.self_loops = self_loops;
        self
    }
}
