//! Node functions for the VizQL agent graph (spec.md §4.5-§4.10). Each node
//! is `async fn(&VizQLGraphState, &RunContext) -> Result<VizQLGraphState, GraphError>`,
//! wired together by `services::vizql::graph::GraphRuntime`.

mod extract_json;

pub mod query_builder;
pub mod pre_validation;
pub mod validator;
pub mod executor;
pub mod summarizer;
pub mod error_handler;
