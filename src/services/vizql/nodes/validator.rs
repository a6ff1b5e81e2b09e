//! Validator Node (spec.md §4.7). Local, pure function of
//! `(query_draft, enriched_schema)` - no LLM call, no I/O.

use crate::models::vizql::{EnrichedSchema, VDSFilter, VDSQuery, VizQLGraphState};
use crate::utils::similarity::close_matches;

use super::super::graph::{GraphError, RunContext};

const VALID_FUNCTIONS: &[&str] = &[
    "SUM", "AVG", "MIN", "MAX", "COUNT", "COUNTD", "MEDIAN", "STDEV", "VAR", "ATTR", "TRUNC_YEAR", "TRUNC_QUARTER",
    "TRUNC_MONTH", "TRUNC_WEEK", "TRUNC_DAY", "YEAR", "QUARTER", "MONTH", "WEEK", "DAY",
];

pub async fn run(state: &VizQLGraphState, _ctx: &RunContext) -> Result<VizQLGraphState, GraphError> {
    let mut next = state.clone();
    // `query_draft` in `step_metadata` is only carried on build/pre_validation
    // reasoning chunks (spec.md §4.5); clear it here so a stale draft from
    // the pre_validation step doesn't leak into this node's reasoning chunk.
    next.step_metadata.query_draft = None;

    let Some(draft) = next.query_draft.clone() else {
        next.is_valid = Some(false);
        next.validation_errors = vec!["no query draft to validate".to_string()];
        next.push_reasoning("validate_query", "Validation failed: no draft");
        return Ok(next);
    };

    let Some(schema) = next.enriched_schema.clone() else {
        next.is_valid = Some(false);
        next.validation_errors = vec!["no enriched schema available to validate against".to_string()];
        next.push_reasoning("validate_query", "Validation failed: no schema");
        return Ok(next);
    };

    let (errors, suggestions) = validate(&draft, &schema);
    next.is_valid = Some(errors.is_empty());
    next.validation_errors = errors;
    next.validation_suggestions = suggestions;

    let summary =
        if next.is_valid == Some(true) { "Query is valid".to_string() } else { format!("Validation failed: {} error(s)", next.validation_errors.len()) };
    next.push_reasoning("validate_query", summary);

    Ok(next)
}

fn validate(draft: &VDSQuery, schema: &EnrichedSchema) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut suggestions = Vec::new();
    let all_captions: Vec<&str> = schema.fields.iter().map(|f| f.caption.as_str()).collect();

    if draft.query.fields.is_empty() {
        errors.push("query must select at least one field".to_string());
    }

    for field in &draft.query.fields {
        if field.calculation.is_some() {
            continue;
        }

        let Some(resolved) = schema.lookup(&field.field_caption) else {
            errors.push(format!("unknown field '{}'", field.field_caption));
            let matches = close_matches(&field.field_caption, all_captions.iter().copied(), 3);
            if !matches.is_empty() {
                suggestions.push(format!("did you mean {} for '{}'?", matches.join(" or "), field.field_caption));
            }
            continue;
        };

        if resolved.formula_has_aggregation() && field.function.is_some() {
            errors.push(format!(
                "'{}' is a calculated field whose formula already aggregates and must not carry a function",
                field.field_caption
            ));
        }

        if let Some(func) = &field.function {
            if !VALID_FUNCTIONS.contains(&func.as_str()) {
                errors.push(format!("unknown aggregation function '{}' on '{}'", func, field.field_caption));
            }
        }
    }

    for filter in &draft.query.filters {
        let caption = filter.field_caption();
        if caption.is_empty() {
            if let VDSFilter::Top { field_to_measure, .. } = filter {
                if field_to_measure.calculation.is_none() {
                    errors.push("TOP filter is missing a field to measure".to_string());
                }
            }
            continue;
        }
        if schema.lookup(caption).is_none() {
            errors.push(format!("unknown filter field '{}'", caption));
            let matches = close_matches(caption, all_captions.iter().copied(), 3);
            if !matches.is_empty() {
                suggestions.push(format!("did you mean {} for filter '{}'?", matches.join(" or "), caption));
            }
        }
    }

    (errors, suggestions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vizql::{DataType, EnrichedField, FieldRole, VDSField};

    fn measure(caption: &str, formula: Option<&str>) -> EnrichedField {
        EnrichedField {
            caption: caption.to_string(),
            logical_name: caption.to_string(),
            data_type: DataType::Real,
            role: FieldRole::Measure,
            default_aggregation: Some("SUM".to_string()),
            formula: formula.map(str::to_string),
            cardinality: None,
            sample_values: Vec::new(),
            value_counts: None,
            min: None,
            max: None,
            median: None,
            null_percentage: None,
            description: None,
        }
    }

    #[test]
    fn unknown_field_surfaces_a_suggestion() {
        let schema = EnrichedSchema::new("ds1", vec![measure("Sales", None)]);
        let mut query = VDSQuery::new("ds1");
        query.query.fields.push(VDSField { field_caption: "Sals".to_string(), function: Some("SUM".to_string()), calculation: None });

        let (errors, suggestions) = validate(&query, &schema);
        assert!(!errors.is_empty());
        assert!(suggestions.iter().any(|s| s.contains("Sales")));
    }

    #[test]
    fn calculated_field_with_self_aggregating_formula_rejects_function() {
        let schema = EnrichedSchema::new("ds1", vec![measure("Profit Ratio", Some("SUM([Profit])/SUM([Sales])"))]);
        let mut query = VDSQuery::new("ds1");
        query.query.fields.push(VDSField { field_caption: "Profit Ratio".to_string(), function: Some("SUM".to_string()), calculation: None });

        let (errors, _) = validate(&query, &schema);
        assert!(errors.iter().any(|e| e.contains("already aggregates")));
    }

    #[test]
    fn valid_query_passes() {
        let schema = EnrichedSchema::new("ds1", vec![measure("Sales", None)]);
        let mut query = VDSQuery::new("ds1");
        query.query.fields.push(VDSField { field_caption: "Sales".to_string(), function: Some("SUM".to_string()), calculation: None });

        let (errors, _) = validate(&query, &schema);
        assert!(errors.is_empty());
    }
}
