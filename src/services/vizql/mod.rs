//! VizQL Agent Graph (spec.md §4.4-§4.11): the single-agent state machine
//! that turns a natural-language question plus an enriched schema into a
//! validated VDS query, an execution result, and a natural-language
//! summary.

pub mod cache;
pub mod context;
pub mod graph;
mod nodes;

pub use context::{ContextCompressor, ParsedIntent};
pub use graph::{GraphError, GraphRuntime, GraphStep, RunContext};
