//! VizQL Agent Runtime Library
//!
//! Core modules for the natural-language-to-VizQL multi-agent query
//! runtime: BI-Client Facade, LLM Facade, Schema Enricher, the VizQL agent
//! graph, the multi-agent orchestrator, and the streaming gateway that
//! wraps them for HTTP.

use std::sync::Arc;

use sqlx::SqlitePool;

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::bi::{BiClient, SharedBiClient, TableauVdsClient, TokenCache};
pub use services::llm::{LLMError, LLMProviderInfo, LLMService, LLMServiceImpl};
pub use services::orchestrator::{Orchestrator, OrchestratorError, TurnOutcome};
pub use services::schema::SchemaEnricher;
pub use services::vizql::cache::FingerprintCache;
pub use services::vizql::{GraphError, GraphRuntime, RunContext};

/// Application shared state. All services are wrapped in `Arc` for cheap
/// cloning and thread safety; Rust's type system is the DI container, not
/// a service-locator pattern.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<Config>,

    pub llm_service: Arc<LLMServiceImpl>,
    pub bi_client: SharedBiClient,
    pub schema_enricher: Arc<SchemaEnricher>,
    pub orchestrator: Arc<Orchestrator>,
    pub fingerprint_cache: FingerprintCache,
}
