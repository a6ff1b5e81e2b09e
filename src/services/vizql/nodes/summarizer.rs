//! Summarizer Node (spec.md §4.9). Calls the LLM Facade with the query and
//! a result-table preview; the prompt instructs the model to emit natural
//! language followed by a `---CONTEXT---` fence containing
//! `{"shown_entities": {...}}` JSON. For small result sets, distinct
//! dimension values are instead extracted directly from the data rather
//! than trusting the LLM's self-report.

use std::collections::HashMap;

use crate::models::vizql::VizQLGraphState;
use crate::services::llm::{ChatMessage, ChatOptions};

use super::super::graph::{GraphError, RunContext};

const CONTEXT_FENCE: &str = "---CONTEXT---";
/// Below this row count, dimension values are read straight out of the
/// result table instead of trusting the summarizer's self-report.
const SMALL_RESULT_ROW_THRESHOLD: usize = 100;

pub async fn run(state: &VizQLGraphState, ctx: &RunContext) -> Result<VizQLGraphState, GraphError> {
    let mut next = state.clone();
    // `query_draft` in `step_metadata` is only carried on build/pre_validation
    // reasoning chunks (spec.md §4.5); clear it here so it doesn't leak into
    // this node's reasoning chunk.
    next.step_metadata.query_draft = None;

    let Some(results) = next.query_results.clone() else {
        next.final_answer = Some("No results were produced for this query.".to_string());
        next.push_reasoning("summarize", "Nothing to summarize: no query results");
        return Ok(next);
    };

    let preview = render_preview(&results);
    let messages = vec![
        ChatMessage::system(
            "You summarize VizQL query results in plain language for a business user. After your answer, \
             on its own line write `---CONTEXT---` followed by JSON: {\"shown_entities\": {\"<dimension>\": [\"<value>\", ...]}} \
             listing the distinct dimension values you actually discussed.",
        ),
        ChatMessage::user(format!("Question: {}\n\nResult preview:\n{}", next.user_query, preview)),
    ];

    let completion = ctx
        .llm
        .chat(&messages, &ChatOptions::default())
        .await
        .map_err(|e| GraphError::SummarizationFailed(e.to_string()))?;

    let (answer, llm_shown_entities) = split_context_fence(&completion.content);

    next.final_answer = Some(answer);
    next.shown_entities = if results.row_count < SMALL_RESULT_ROW_THRESHOLD {
        extract_dimension_values_from_data(&results)
    } else {
        llm_shown_entities
    };

    next.push_reasoning("summarize", "Generated final answer");
    Ok(next)
}

fn render_preview(results: &crate::models::vizql::QueryResult) -> String {
    let mut out = results.columns.join(" | ");
    out.push('\n');
    for row in results.data.iter().take(20) {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        out.push_str(&cells.join(" | "));
        out.push('\n');
    }
    if results.row_count > 20 {
        out.push_str(&format!("... ({} total rows)\n", results.row_count));
    }
    out
}

fn split_context_fence(content: &str) -> (String, HashMap<String, Vec<String>>) {
    let Some((answer, rest)) = content.split_once(CONTEXT_FENCE) else {
        return (content.trim().to_string(), HashMap::new());
    };

    let shown_entities = serde_json::from_str::<serde_json::Value>(rest.trim())
        .ok()
        .and_then(|v| v.get("shown_entities").cloned())
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    (answer.trim().to_string(), shown_entities)
}

fn extract_dimension_values_from_data(results: &crate::models::vizql::QueryResult) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (col_idx, column) in results.columns.iter().enumerate() {
        let mut seen = Vec::new();
        for row in &results.data {
            let Some(value) = row.get(col_idx) else { continue };
            if let Some(s) = value.as_str() {
                if !seen.contains(&s.to_string()) {
                    seen.push(s.to_string());
                }
            }
        }
        if !seen.is_empty() {
            out.insert(column.clone(), seen);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vizql::QueryResult;
    use serde_json::json;

    #[test]
    fn context_fence_is_parsed_out_of_the_answer() {
        let content = format!(
            "Sales were highest in the West region.\n{}\n{}",
            CONTEXT_FENCE,
            json!({"shown_entities": {"Region": ["West"]}})
        );
        let (answer, entities) = split_context_fence(&content);
        assert_eq!(answer, "Sales were highest in the West region.");
        assert_eq!(entities.get("Region").unwrap(), &vec!["West".to_string()]);
    }

    #[test]
    fn missing_context_fence_falls_back_to_full_content() {
        let (answer, entities) = split_context_fence("Just an answer, no fence.");
        assert_eq!(answer, "Just an answer, no fence.");
        assert!(entities.is_empty());
    }

    #[test]
    fn small_results_extract_distinct_values_directly() {
        let results = QueryResult {
            columns: vec!["Region".to_string()],
            data: vec![vec![json!("West")], vec![json!("East")], vec![json!("West")]],
            row_count: 3,
            dimension_values: Default::default(),
        };
        let extracted = extract_dimension_values_from_data(&results);
        assert_eq!(extracted.get("Region").unwrap().len(), 2);
    }
}
