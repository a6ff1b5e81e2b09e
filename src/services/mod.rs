//! Service layer: BI-Client Facade, LLM Facade, Schema Enricher, the
//! VizQL agent graph, the multi-agent orchestrator, and the streaming
//! gateway.

pub mod bi;
pub mod llm;
pub mod orchestrator;
pub mod schema;
pub mod streaming;
pub mod vizql;
