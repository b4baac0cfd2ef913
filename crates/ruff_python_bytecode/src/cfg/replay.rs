//! Checking observed execution paths against a graph.
//!
//! A path recorded by tracing the interpreter must be a walk in the graph:
//! every step from one offset to the next has to be an edge. A missing edge is
//! reported together with what the graph believed about the source node.
use crate::cfg::implementations::CFG;
use crate::instruction::{Instruction, Offset};
use crate::listing::{parse_listing, ListingError};
use crate::settings::{ReplayOptions, SelfLoopPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("observed offset {0} has no node in the graph")]
    MissingNode(Offset),

    #[error(
        "there should be an edge {from} -> {to}\n  \
        instruction: {instruction}\n  \
        successors of {from}: {}\n  \
        block stack of {from}: {block_stack}",
        display_offsets(.successors)
    )]
    MissingEdge {
        from: Offset,
        to: Offset,
        instruction: String,
        successors: Vec<Offset>,
        block_stack: String,
    },
}

fn display_offsets(offsets: &[Offset]) -> String {
    let offsets: Vec<String> = offsets.iter().map(ToString::to_string).collect();
    format!("[{}]", offsets.join(", "))
}

/// Follows `path` through `cfg`, failing at the first step that is not an
/// edge of the graph.
pub fn replay(cfg: &CFG, path: &[Offset], options: &ReplayOptions) -> Result<(), ReplayError> {
    if let Some(first) = path.first() {
        if !cfg.contains(*first) {
            return Err(ReplayError::MissingNode(*first));
        }
    }

    for window in path.windows(2) {
        let [from, to] = [window[0], window[1]];
        let node = cfg.node(from).map_err(|_| ReplayError::MissingNode(from))?;

        if node.successors().contains(&to) {
            continue;
        }

        if from == to && options.self_loops == SelfLoopPolicy::Collapse {
            tracing::debug!(offset = %from, "collapsing repeated offset");
            continue;
        }

        if !cfg.contains(to) {
            return Err(ReplayError::MissingNode(to));
        }

        return Err(ReplayError::MissingEdge {
            from,
            to,
            instruction: node
                .instruction()
                .map(ToString::to_string)
                .unwrap_or_default(),
            successors: node.successors().to_vec(),
            block_stack: node.block_stack().display(cfg.scopes()).to_string(),
        });
    }

    Ok(())
}

/// Separates the code listing of a fixture from its observed path.
const FIXTURE_BOUNDARY: &str = "\n\n\n---162b4a78-0bc7-4966-a4e7-59aa1f784c39\n\n\n";

/// The tracer records each offset one instruction ahead of the instruction
/// that ran.
const TRACE_BIAS: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FixtureError {
    #[error("fixture has no path section")]
    MissingBoundary,

    #[error(transparent)]
    Listing(#[from] ListingError),

    #[error("path line {line}: expected `<offset> <opname>`, found `{text}`")]
    InvalidPathLine { line: usize, text: String },

    #[error("fixture contains no path")]
    EmptyPath,
}

/// A code listing together with a path observed while running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFixture {
    pub instructions: Vec<Instruction>,
    pub path: Vec<Offset>,
}

impl PathFixture {
    pub fn parse(source: &str) -> Result<Self, FixtureError> {
        let (listing, path) = source
            .split_once(FIXTURE_BOUNDARY)
            .ok_or(FixtureError::MissingBoundary)?;

        let instructions = parse_listing(listing)?;

        let path = path
            .trim()
            .lines()
            .enumerate()
            .map(|(index, text)| parse_path_line(index + 1, text))
            .collect::<Result<Vec<_>, _>>()?;
        if path.is_empty() {
            return Err(FixtureError::EmptyPath);
        }

        Ok(Self { instructions, path })
    }
}

fn parse_path_line(line: usize, text: &str) -> Result<Offset, FixtureError> {
    let invalid = || FixtureError::InvalidPathLine {
        line,
        text: text.to_string(),
    };

    let mut tokens = text.split_whitespace();
    let (Some(offset), Some(_opname), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(invalid());
    };
    let offset: i32 = offset.parse().map_err(|_| invalid())?;
    let offset = offset.checked_sub(TRACE_BIAS).ok_or_else(invalid)?;
    Ok(Offset::new(offset))
}
