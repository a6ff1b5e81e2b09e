//! Error Handler Node (spec.md §4.10). Terminal node reached when either
//! retry budget is exhausted. Composes a human-readable message from the
//! attempt counts and the last errors/suggestions recorded on state - no
//! LLM call, no I/O.

use crate::models::vizql::VizQLGraphState;

use super::super::graph::{GraphError, RunContext};

pub async fn run(state: &VizQLGraphState, _ctx: &RunContext) -> Result<VizQLGraphState, GraphError> {
    let mut next = state.clone();
    // `query_draft` in `step_metadata` is only carried on build/pre_validation
    // reasoning chunks (spec.md §4.5); clear it here so it doesn't leak into
    // this node's reasoning chunk.
    next.step_metadata.query_draft = None;

    let message = compose_message(&next);
    next.final_answer = Some(message.clone());
    next.push_reasoning("error_handler", message);

    Ok(next)
}

fn compose_message(state: &VizQLGraphState) -> String {
    let mut out = format!(
        "I wasn't able to produce a reliable answer after {} build attempt(s) and {} execution attempt(s).",
        state.build_attempt, state.execution_attempt
    );

    if let Some(last) = state.execution_errors.last() {
        out.push_str(&format!("\n\nThe last execution error was: {}", last));
    } else if let Some(last) = state.validation_errors.last() {
        out.push_str(&format!("\n\nThe last validation error was: {}", last));
    }

    if !state.validation_suggestions.is_empty() {
        out.push_str("\n\nSuggestions:\n");
        for s in &state.validation_suggestions {
            out.push_str(&format!("- {}\n", s));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn message_includes_attempt_counts_and_last_error() {
        let mut state = VizQLGraphState::new("anything", vec!["ds1".into()], vec![]);
        state.build_attempt = 3;
        state.execution_attempt = 2;
        state.execution_errors = vec!["upstream timeout".to_string()];

        let ctx = super::super::super::graph::test_support::dummy_run_context();
        let next = run(&state, &ctx).await.unwrap();
        let answer = next.final_answer.unwrap();
        assert!(answer.contains("3 build attempt"));
        assert!(answer.contains("upstream timeout"));
    }
}
