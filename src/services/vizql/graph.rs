//! VizQL Graph Runtime (spec.md §4.11). Wires the node functions together
//! per the fixed edge set, owning the two independent retry budgets
//! (`build_attempt`/`MaxBuild`, `execution_attempt`/`MaxExec`) and the
//! non-serializable resources every node needs but `VizQLGraphState` must
//! never hold (§9).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::GraphBudgetsConfig;
use crate::models::vizql::VizQLGraphState;
use crate::services::bi::SharedBiClient;
use crate::services::llm::LLMService;
use crate::services::schema::SchemaEnricher;

use super::cache::FingerprintCache;
use super::nodes;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("query build failed: {0}")]
    BuildFailed(String),
    #[error("summarization failed: {0}")]
    SummarizationFailed(String),
    #[error("graph execution cancelled")]
    Cancelled,
    #[error("graph execution timed out after {0:?}")]
    TimedOut(Duration),
}

/// Non-serializable resources shared by every node in a single run. Built
/// once per request by the caller (handler/orchestrator) and threaded
/// through by reference; never stored on `VizQLGraphState`.
#[derive(Clone)]
pub struct RunContext {
    pub bi: SharedBiClient,
    pub llm: Arc<dyn LLMService>,
    pub schema: Arc<SchemaEnricher>,
    pub cache: FingerprintCache,
    pub budgets: GraphBudgetsConfig,
    pub cancellation: CancellationToken,
}

impl RunContext {
    pub fn new(
        bi: SharedBiClient,
        llm: Arc<dyn LLMService>,
        schema: Arc<SchemaEnricher>,
        cache: FingerprintCache,
        budgets: GraphBudgetsConfig,
    ) -> Self {
        Self { bi, llm, schema, cache, budgets, cancellation: CancellationToken::new() }
    }
}

/// One step the runtime took, surfaced to the streaming gateway as a
/// `reasoning` chunk (spec.md §4.13). `step_index` is monotonically
/// increasing across the whole run, not per-node.
#[derive(Debug, Clone)]
pub struct GraphStep {
    pub step_index: usize,
    pub state: VizQLGraphState,
}

pub struct GraphRuntime;

impl GraphRuntime {
    /// Runs the graph to completion, yielding every intermediate state via
    /// `on_step` as it is produced (the streaming gateway turns each into a
    /// `reasoning` chunk) and returning the final state.
    pub async fn run(
        initial: VizQLGraphState,
        ctx: &RunContext,
        mut on_step: impl FnMut(GraphStep),
    ) -> Result<VizQLGraphState, GraphError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(ctx.budgets.graph_timeout_secs);
        let mut state = initial;
        let mut step_index = 0usize;

        let emit = |state: &VizQLGraphState, step_index: &mut usize, on_step: &mut dyn FnMut(GraphStep)| {
            on_step(GraphStep { step_index: *step_index, state: state.clone() });
            *step_index += 1;
        };

        // Schema enrichment (spec.md §4.3) runs once, outside both retry
        // budgets: the schema does not change across build/execution
        // attempts, so it is not itself a routable, retried node - it is
        // memoized on the state the rest of the graph operates on.
        if state.enriched_schema.is_none()
            && let Some(datasource_id) = state.context_datasources.first().cloned()
        {
            let enriched = ctx.schema.enrich(&datasource_id).await;
            state.push_reasoning("schema_enrichment", format!("Enriched schema for datasource {}", datasource_id));
            state.enriched_schema = Some(enriched);
            emit(&state, &mut step_index, &mut on_step);
        }

        loop {
            if ctx.cancellation.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(GraphError::TimedOut(Duration::from_secs(ctx.budgets.graph_timeout_secs)));
            }

            state = Self::run_step(nodes::query_builder::run(&state, ctx)).await?;
            emit(&state, &mut step_index, &mut on_step);

            if state.query_draft.is_none() {
                state = Self::run_step(nodes::error_handler::run(&state, ctx)).await?;
                emit(&state, &mut step_index, &mut on_step);
                return Ok(state);
            }

            state = Self::run_step(nodes::pre_validation::run(&state, ctx)).await?;
            emit(&state, &mut step_index, &mut on_step);

            state = Self::run_step(nodes::validator::run(&state, ctx)).await?;
            emit(&state, &mut step_index, &mut on_step);

            if state.is_valid != Some(true) {
                if state.build_attempt < ctx.budgets.max_build_attempts {
                    continue;
                }
                state = Self::run_step(nodes::error_handler::run(&state, ctx)).await?;
                emit(&state, &mut step_index, &mut on_step);
                return Ok(state);
            }

            state = Self::run_step(nodes::executor::run(&state, ctx)).await?;
            emit(&state, &mut step_index, &mut on_step);

            if state.query_results.is_some() {
                state = Self::run_step(nodes::summarizer::run(&state, ctx)).await?;
                emit(&state, &mut step_index, &mut on_step);
                return Ok(state);
            }

            if state.execution_attempt < ctx.budgets.max_exec_attempts {
                // Entering build_query after an execution failure resets
                // build_attempt and clears error (spec.md §4.11 invariants).
                // build_query itself increments build_attempt on entry, so
                // reset to 0 here such that the next build attempt lands on 1.
                state.build_attempt = 0;
                state.execution_attempt += 1;
                state.error = None;
                continue;
            }

            state = Self::run_step(nodes::error_handler::run(&state, ctx)).await?;
            emit(&state, &mut step_index, &mut on_step);
            return Ok(state);
        }
    }

    async fn run_step(
        fut: impl std::future::Future<Output = Result<VizQLGraphState, GraphError>>,
    ) -> Result<VizQLGraphState, GraphError> {
        fut.await
    }
}

#[cfg(test)]
pub mod test_support {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use futures_util::Stream;
    use std::pin::Pin;

    use crate::models::vizql::{FieldRole, QueryResult, RawColumn, RawSchema, VDSQuery};
    use crate::services::bi::{BiClient, BiError, FieldStatistics};
    use crate::services::llm::{ChatChunk, ChatCompletion, ChatMessage, ChatOptions, LLMError, LLMService, LLMProviderInfo, CreateProviderRequest, UpdateProviderRequest, LLMProvider, TestConnectionResponse};

    use super::{FingerprintCache, RunContext};
    use std::time::Duration;

    pub struct DummyBiClient;

    #[async_trait]
    impl BiClient for DummyBiClient {
        async fn read_metadata(&self, datasource_id: &str) -> Result<RawSchema, BiError> {
            Ok(RawSchema {
                datasource_id: datasource_id.to_string(),
                columns: vec![RawColumn {
                    name: "Sales".to_string(),
                    data_type: Some("REAL".to_string()),
                    column_class: Some("MEASURE".to_string()),
                    default_aggregation: Some("SUM".to_string()),
                    formula: None,
                    description: None,
                }],
            })
        }

        async fn read_metadata_roles(&self, _datasource_id: &str) -> Result<HashMap<String, FieldRole>, BiError> {
            Ok(HashMap::new())
        }

        async fn field_statistics(&self, _datasource_id: &str, _field_caption: &str, _role: FieldRole) -> Result<FieldStatistics, BiError> {
            Ok(FieldStatistics::default())
        }

        async fn execute_vds(&self, query: &VDSQuery) -> Result<QueryResult, BiError> {
            if query.query.fields.iter().any(|f| f.field_caption == "FAIL_ME") {
                return Err(BiError::UpstreamError("simulated upstream failure".to_string()));
            }
            let columns: Vec<String> = query.query.fields.iter().map(|f| f.field_caption.clone()).collect();
            Ok(QueryResult {
                columns,
                data: vec![vec![serde_json::json!(100)]],
                row_count: 1,
                dimension_values: HashMap::new(),
            })
        }
    }

    pub struct DummyLLMService;

    #[async_trait]
    impl LLMService for DummyLLMService {
        fn is_available(&self) -> bool {
            true
        }

        async fn chat(&self, _messages: &[ChatMessage], _options: &ChatOptions) -> Result<ChatCompletion, LLMError> {
            Ok(ChatCompletion {
                content: r#"{"datasource": {"datasourceLuid": "ds1"}, "query": {"fields": [{"fieldCaption": "Sales", "function": "SUM"}]}}"#
                    .to_string(),
                tokens_used: 10,
                prompt_tokens: 5,
                completion_tokens: 5,
                finish_reason: Some("stop".to_string()),
                function_call: None,
            })
        }

        async fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> Result<Pin<Box<dyn Stream<Item = Result<ChatChunk, LLMError>> + Send>>, LLMError> {
            unimplemented!("not exercised by node unit tests")
        }

        async fn list_providers(&self) -> Result<Vec<LLMProviderInfo>, LLMError> {
            Ok(Vec::new())
        }

        async fn get_provider(&self, _id: i64) -> Result<Option<LLMProviderInfo>, LLMError> {
            Ok(None)
        }

        async fn get_active_provider(&self) -> Result<Option<LLMProviderInfo>, LLMError> {
            Ok(None)
        }

        async fn create_provider(&self, _req: CreateProviderRequest) -> Result<LLMProvider, LLMError> {
            unimplemented!("not exercised by node unit tests")
        }

        async fn update_provider(&self, _id: i64, _req: UpdateProviderRequest) -> Result<LLMProvider, LLMError> {
            unimplemented!("not exercised by node unit tests")
        }

        async fn delete_provider(&self, _id: i64) -> Result<(), LLMError> {
            Ok(())
        }

        async fn activate_provider(&self, _provider_id: i64) -> Result<(), LLMError> {
            Ok(())
        }

        async fn deactivate_provider(&self, _provider_id: i64) -> Result<(), LLMError> {
            Ok(())
        }

        async fn test_connection(&self, _provider_id: i64) -> Result<TestConnectionResponse, LLMError> {
            Ok(TestConnectionResponse { success: true, message: "ok".to_string(), latency_ms: Some(1) })
        }
    }

    pub fn dummy_run_context() -> RunContext {
        let bi: std::sync::Arc<dyn crate::services::bi::BiClient> = std::sync::Arc::new(DummyBiClient);
        RunContext::new(
            bi.clone(),
            std::sync::Arc::new(DummyLLMService),
            std::sync::Arc::new(crate::services::schema::SchemaEnricher::new(bi, &crate::config::CacheConfig::default())),
            FingerprintCache::new(Duration::from_secs(60)),
            crate::config::GraphBudgetsConfig::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vizql::VizQLGraphState;

    #[tokio::test]
    async fn successful_run_reaches_a_final_answer() {
        let ctx = test_support::dummy_run_context();
        let mut state = VizQLGraphState::new("total sales", vec!["ds1".into()], vec![]);
        state.enriched_schema = Some(crate::models::vizql::EnrichedSchema::new(
            "ds1",
            vec![crate::models::vizql::EnrichedField {
                caption: "Sales".to_string(),
                logical_name: "Sales".to_string(),
                data_type: crate::models::vizql::DataType::Real,
                role: crate::models::vizql::FieldRole::Measure,
                default_aggregation: Some("SUM".to_string()),
                formula: None,
                cardinality: None,
                sample_values: Vec::new(),
                value_counts: None,
                min: None,
                max: None,
                median: None,
                null_percentage: None,
                description: None,
            }],
        ));

        let mut steps = 0;
        let result = GraphRuntime::run(state, &ctx, |_| steps += 1).await.unwrap();
        assert!(result.final_answer.is_some());
        assert!(steps > 0);
    }

    #[tokio::test]
    async fn missing_schema_is_enriched_automatically_before_the_retry_loop() {
        let ctx = test_support::dummy_run_context();
        let state = VizQLGraphState::new("total sales", vec!["ds1".into()], vec![]);

        let mut steps = Vec::new();
        let result = GraphRuntime::run(state, &ctx, |s| steps.push(s)).await.unwrap();

        assert!(result.enriched_schema.is_some());
        assert!(steps.iter().any(|s| s.state.reasoning_steps.iter().any(|r| r.node == "schema_enrichment")));
    }

    /// Validation failure on the first draft must retry build_query with
    /// `build_attempt` incrementing 1, 2 (spec.md §4.11, §8 scenario 2), not
    /// stall on a counter that only failure-in-build_query itself advances.
    #[tokio::test]
    async fn validation_retry_increments_build_attempt_across_attempts() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::pin::Pin;
        use async_trait::async_trait;
        use futures_util::Stream;
        use crate::services::llm::{
            ChatChunk, ChatCompletion, ChatMessage, ChatOptions, CreateProviderRequest, LLMError, LLMProvider, LLMProviderInfo, LLMService,
            TestConnectionResponse, UpdateProviderRequest,
        };

        struct FlakyFieldNameLLM {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl LLMService for FlakyFieldNameLLM {
            fn is_available(&self) -> bool {
                true
            }

            async fn chat(&self, _messages: &[ChatMessage], _options: &ChatOptions) -> Result<ChatCompletion, LLMError> {
                let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
                let field = if attempt == 0 { "Saless" } else { "Sales" };
                Ok(ChatCompletion {
                    content: format!(r#"{{"datasource": {{"datasourceLuid": "ds1"}}, "query": {{"fields": [{{"fieldCaption": "{}", "function": "SUM"}}]}}}}"#, field),
                    tokens_used: 10,
                    prompt_tokens: 5,
                    completion_tokens: 5,
                    finish_reason: Some("stop".to_string()),
                    function_call: None,
                })
            }

            async fn stream_chat(
                &self,
                _messages: &[ChatMessage],
                _options: &ChatOptions,
            ) -> Result<Pin<Box<dyn Stream<Item = Result<ChatChunk, LLMError>> + Send>>, LLMError> {
                unimplemented!("not exercised by this test")
            }

            async fn list_providers(&self) -> Result<Vec<LLMProviderInfo>, LLMError> {
                Ok(Vec::new())
            }

            async fn get_provider(&self, _id: i64) -> Result<Option<LLMProviderInfo>, LLMError> {
                Ok(None)
            }

            async fn get_active_provider(&self) -> Result<Option<LLMProviderInfo>, LLMError> {
                Ok(None)
            }

            async fn create_provider(&self, _req: CreateProviderRequest) -> Result<LLMProvider, LLMError> {
                unimplemented!("not exercised by this test")
            }

            async fn update_provider(&self, _id: i64, _req: UpdateProviderRequest) -> Result<LLMProvider, LLMError> {
                unimplemented!("not exercised by this test")
            }

            async fn delete_provider(&self, _id: i64) -> Result<(), LLMError> {
                Ok(())
            }

            async fn activate_provider(&self, _provider_id: i64) -> Result<(), LLMError> {
                Ok(())
            }

            async fn deactivate_provider(&self, _provider_id: i64) -> Result<(), LLMError> {
                Ok(())
            }

            async fn test_connection(&self, _provider_id: i64) -> Result<TestConnectionResponse, LLMError> {
                Ok(TestConnectionResponse { success: true, message: "ok".to_string(), latency_ms: Some(1) })
            }
        }

        let bi: Arc<dyn crate::services::bi::BiClient> = Arc::new(test_support::DummyBiClient);
        let ctx = RunContext::new(
            bi.clone(),
            Arc::new(FlakyFieldNameLLM { calls: AtomicUsize::new(0) }),
            Arc::new(crate::services::schema::SchemaEnricher::new(bi, &crate::config::CacheConfig::default())),
            FingerprintCache::new(Duration::from_secs(60)),
            crate::config::GraphBudgetsConfig::default(),
        );

        let mut state = VizQLGraphState::new("total sales", vec!["ds1".into()], vec![]);
        state.enriched_schema = Some(crate::models::vizql::EnrichedSchema::new(
            "ds1",
            vec![crate::models::vizql::EnrichedField {
                caption: "Sales".to_string(),
                logical_name: "Sales".to_string(),
                data_type: crate::models::vizql::DataType::Real,
                role: crate::models::vizql::FieldRole::Measure,
                default_aggregation: Some("SUM".to_string()),
                formula: None,
                cardinality: None,
                sample_values: Vec::new(),
                value_counts: None,
                min: None,
                max: None,
                median: None,
                null_percentage: None,
                description: None,
            }],
        ));

        let mut build_attempts_seen = Vec::new();
        let result = GraphRuntime::run(state, &ctx, |s| {
            if let Some(step) = s.state.reasoning_steps.last() {
                if step.node == "build_query" {
                    build_attempts_seen.push(step.build_attempt.unwrap());
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(build_attempts_seen, vec![1, 2]);
        assert!(result.final_answer.is_some());
    }
}
