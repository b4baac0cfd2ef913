//! Control-flow graphs for CPython 3.7 bytecode.
//!
//! [`cfg::build_cfg`] turns the instructions of one code unit into a graph with
//! a node per reachable instruction, including the implicit edges taken when
//! an exception is raised or a `finally` handler intercepts a `return`,
//! `break` or `continue`.
pub mod cfg;
pub mod instruction;
pub mod listing;
pub mod settings;
