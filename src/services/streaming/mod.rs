//! Streaming Gateway (spec.md §4.13). Wraps a single graph run, translating
//! each `GraphStep` into the SSE chunk sequence the HTTP surface sends:
//! `reasoning* metadata? final_answer+ (error)? progress[DONE]`.
//!
//! Cleanup contract: the gateway owns the BI client handle for the
//! stream's lifetime. A `BiHandleGuard` released when the driving task
//! ends - on normal completion, client disconnect (detected by a failed
//! send on the output channel), or error - stands in for the
//! `finally`-equivalent block spec.md calls for.

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::models::vizql::VizQLGraphState;
use crate::services::bi::SharedBiClient;
use crate::services::vizql::{GraphRuntime, GraphStep, RunContext};

/// Holds the BI client handle for the lifetime of one stream. Its `Drop`
/// is the release point spec.md's cleanup contract requires; nothing else
/// in the gateway needs to remember to release it.
struct BiHandleGuard(#[allow(dead_code)] SharedBiClient);

impl Drop for BiHandleGuard {
    fn drop(&mut self) {
        tracing::debug!("releasing BI client handle at end of stream");
    }
}

/// Runs the graph and returns a stream of pre-serialized SSE payloads
/// (`(event_type, json_data)` pairs), in emission order, always ending in
/// a `progress` `[DONE]` chunk.
pub fn stream_turn(initial: VizQLGraphState, ctx: RunContext) -> UnboundedReceiverStream<(&'static str, Value)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let guard = BiHandleGuard(ctx.bi.clone());

    tokio::spawn(async move {
        let _guard = guard;
        let send = |event: &'static str, data: Value| tx.send((event, data)).is_ok();

        let mut last_answer_sent = String::new();
        let mut final_state: Option<VizQLGraphState> = None;
        let mut last_seen_state: Option<VizQLGraphState> = None;

        let on_step = |step: GraphStep| {
            last_seen_state = Some(step.state.clone());
            if !send("reasoning", reasoning_payload(&step)) {
                ctx.cancellation.cancel();
            }
        };

        match GraphRuntime::run(initial, &ctx, on_step).await {
            Ok(state) => {
                send("metadata", metadata_payload(&state));
                if let Some(answer) = &state.final_answer {
                    send("final_answer", final_answer_payload(answer));
                    last_answer_sent = answer.clone();
                }
                final_state = Some(state);
            },
            Err(e) => {
                // Best-effort metadata chunk even on a failed run (spec.md
                // §4.13, §7): whatever query draft the last emitted
                // reasoning step carried is better than nothing.
                if let Some(state) = &last_seen_state {
                    send("metadata", metadata_payload(state));
                }
                // Cancellation skips the (optional) error chunk per spec.md
                // §7 but still reaches `[DONE]` below.
                if !matches!(e, crate::services::vizql::GraphError::Cancelled) {
                    send("error", error_payload(&e.to_string()));
                }
            },
        }

        let _ = last_answer_sent;
        let _ = final_state;
        send("progress", done_payload());
    });

    UnboundedReceiverStream::new(rx)
}

fn reasoning_payload(step: &GraphStep) -> Value {
    let last = step.state.reasoning_steps.last();
    let step_name = last.map(|s| s.node.clone()).unwrap_or_default();

    json!({
        "type": "reasoning",
        "content": { "type": "text", "data": step.state.current_thought },
        "step_name": step_name,
        "step_index": step.step_index,
        "timestamp": Utc::now().to_rfc3339(),
        "metadata": step.state.step_metadata,
    })
}

fn metadata_payload(state: &VizQLGraphState) -> Value {
    json!({
        "type": "metadata",
        "content": { "type": "json", "data": { "vizql_query": state.query_draft } },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

fn final_answer_payload(text: &str) -> Value {
    json!({
        "type": "final_answer",
        "content": { "type": "text", "data": text },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

fn error_payload(message: &str) -> Value {
    json!({
        "type": "error",
        "content": { "type": "text", "data": message },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

fn done_payload() -> Value {
    json!({
        "type": "progress",
        "content": { "type": "text", "data": "[DONE]" },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::vizql::graph::test_support::dummy_run_context;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn stream_ends_with_done_and_contains_final_answer() {
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

        let ctx = dummy_run_context();
        let mut stream = stream_turn(state, ctx);

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        assert_eq!(events.last().unwrap().0, "progress");
        assert!(events.iter().any(|(kind, _)| *kind == "final_answer"));
        assert!(events.iter().any(|(kind, _)| *kind == "reasoning"));
    }
}
