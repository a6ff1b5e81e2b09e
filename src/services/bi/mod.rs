//! BI-Client Facade (spec.md §4.1) - uniform schema/metadata/execute
//! access over the Tableau VizQL Data Service, with implicit token
//! lifecycle management except for PAT/password sessions.

mod client;
mod models;
mod token_cache;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::vizql::{FieldRole, QueryResult, RawSchema, VDSQuery};

pub use client::TableauVdsClient;
pub use models::{AuthMode, BiServerConfig};
pub use token_cache::TokenCache;

/// Field-level statistics fetched via small dedicated VDS queries
/// (spec.md §4.3): MIN/MAX/MEDIAN for numeric measures, top-N value counts
/// + COUNTD for dimensions.
#[derive(Debug, Clone, Default)]
pub struct FieldStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    pub cardinality: Option<u64>,
    pub sample_values: Vec<String>,
    pub value_counts: Option<Vec<crate::models::vizql::ValueCount>>,
    pub null_percentage: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum BiError {
    #[error("BI session expired or not connected")]
    AuthExpired,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream error: {0}")]
    UpstreamError(String),
}

impl BiError {
    /// Transport and 5xx are retried; 4xx (including AuthExpired/NotFound)
    /// surface immediately (spec.md §4.1, §7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, BiError::Transport(_))
    }
}

/// Uniform facade over the BI server, used by the Schema Enricher and the
/// Executor node. State (the draft query, results) never holds a client -
/// it is resolved from `RunContext`/`AppState` at call time (§9).
#[async_trait]
pub trait BiClient: Send + Sync {
    async fn read_metadata(&self, datasource_id: &str) -> Result<RawSchema, BiError>;

    /// Secondary role source (metadata GraphQL); best-effort, used to
    /// override the heuristic role classification when available.
    async fn read_metadata_roles(&self, datasource_id: &str) -> Result<HashMap<String, FieldRole>, BiError>;

    /// Dedicated small VDS queries for per-field statistics (spec.md §4.3):
    /// MIN/MAX/MEDIAN for `FieldRole::Measure`, top-N value counts + COUNTD
    /// for `FieldRole::Dimension`. The role is passed explicitly since the
    /// right query shape (and hence the fields actually populated on
    /// `FieldStatistics`) depends on it.
    async fn field_statistics(&self, datasource_id: &str, field_caption: &str, role: FieldRole) -> Result<FieldStatistics, BiError>;

    /// Executes a VDS query. Implementations MUST force
    /// `options.returnFormat = OBJECTS` and MUST NOT forward any
    /// client-supplied `options.limit` (not a valid upstream key).
    async fn execute_vds(&self, query: &VDSQuery) -> Result<QueryResult, BiError>;
}

pub type SharedBiClient = Arc<dyn BiClient>;
