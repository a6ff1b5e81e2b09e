//! Pre-Validation Rewriter (spec.md §4.6). Deterministic, no LLM call:
//! applies a fixed set of rewrites to the query draft between building and
//! validating it, recording each one that fired into
//! `pre_validation_changes`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::vizql::{EnrichedSchema, VDSFilter, VizQLGraphState};

use super::super::graph::{GraphError, RunContext};

const DATE_TRUNC_KEYWORDS: &[(&str, &str)] =
    &[("year", "TRUNC_YEAR"), ("quarter", "TRUNC_QUARTER"), ("month", "TRUNC_MONTH"), ("week", "TRUNC_WEEK"), ("day", "TRUNC_DAY")];
const DISTINCT_KEYWORDS: &[&str] = &["distinct", "unique"];
const CONTEXT_KEYWORDS: &[&str] = &["context filter", "as context", "use as filter context"];

/// Word-boundary matchers for the date-truncation keywords, in
/// `DATE_TRUNC_KEYWORDS` order. Built once per process - a plain
/// `.contains("month")` would also fire on "monthly" or "by the month's
/// end", misfiring the rewrite.
static BY_KEYWORD_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    DATE_TRUNC_KEYWORDS
        .iter()
        .map(|(keyword, _)| Regex::new(&format!(r"\bby\s+{}\b", regex::escape(keyword))).unwrap())
        .collect()
});

static DISTINCT_KEYWORD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"\b({})\b", DISTINCT_KEYWORDS.join("|"))).unwrap());

pub async fn run(state: &VizQLGraphState, _ctx: &RunContext) -> Result<VizQLGraphState, GraphError> {
    let mut next = state.clone();
    let Some(mut draft) = next.query_draft.clone() else {
        next.push_reasoning("pre_validation", "No query draft to rewrite");
        return Ok(next);
    };

    let mut changes = Vec::new();
    let query_lower = next.user_query.to_lowercase();

    apply_date_truncation(&mut draft, &query_lower, &mut changes);
    apply_distinct_count(&mut draft, &query_lower, &mut changes);
    apply_context_filters(&mut draft, &query_lower, &mut changes);
    if let Some(schema) = &next.enriched_schema {
        canonicalize_set_filter_values(&mut draft, schema, &mut changes);
        rename_colliding_calculated_fields(&mut draft, schema, &mut changes);
    }
    strip_caption_from_calculated_filters(&mut draft, &mut changes);

    next.pre_validation_changes = changes.clone();
    next.query_draft = Some(draft);
    next.step_metadata.query_draft = next.query_draft.clone();

    let summary = if changes.is_empty() { "No rewrites applied".to_string() } else { format!("Applied {} rewrite(s)", changes.len()) };
    next.push_reasoning("pre_validation", summary);

    Ok(next)
}

fn apply_date_truncation(draft: &mut crate::models::vizql::VDSQuery, query_lower: &str, changes: &mut Vec<String>) {
    for ((keyword, trunc_fn), pattern) in DATE_TRUNC_KEYWORDS.iter().zip(BY_KEYWORD_PATTERNS.iter()) {
        if !pattern.is_match(query_lower) {
            continue;
        }
        for field in &mut draft.query.fields {
            let is_date_like = field.field_caption.to_lowercase().contains("date") || field.field_caption.to_lowercase().contains(keyword);
            if is_date_like && field.function.as_deref() != Some(*trunc_fn) {
                field.function = Some(trunc_fn.to_string());
                changes.push(format!("set {} function on '{}' (date-truncation intent)", trunc_fn, field.field_caption));
            }
        }
    }
}

fn apply_distinct_count(draft: &mut crate::models::vizql::VDSQuery, query_lower: &str, changes: &mut Vec<String>) {
    if !DISTINCT_KEYWORD_PATTERN.is_match(query_lower) {
        return;
    }
    for field in &mut draft.query.fields {
        if field.function.as_deref() == Some("COUNT") {
            field.function = Some("COUNTD".to_string());
            changes.push(format!("rewrote COUNT -> COUNTD on '{}' (distinct intent)", field.field_caption));
        }
    }
}

fn apply_context_filters(draft: &mut crate::models::vizql::VDSQuery, query_lower: &str, changes: &mut Vec<String>) {
    if !CONTEXT_KEYWORDS.iter().any(|kw| query_lower.contains(kw)) {
        return;
    }
    for filter in &mut draft.query.filters {
        if let VDSFilter::CategoricalSet { field_caption, values, .. } = filter {
            let field_caption = field_caption.clone();
            let values = std::mem::take(values);
            *filter = VDSFilter::Context { field_caption: field_caption.clone(), values };
            changes.push(format!("marked filter on '{}' as a context filter", field_caption));
        }
    }
}

/// Matches SET filter values against a dimension's known `sample_values`,
/// first case-insensitive exact, then with punctuation/whitespace stripped
/// (spec.md §4.6).
fn canonicalize_set_filter_values(draft: &mut crate::models::vizql::VDSQuery, schema: &EnrichedSchema, changes: &mut Vec<String>) {
    for filter in &mut draft.query.filters {
        let Some((field_caption, values)) = filter.as_categorical_set_mut() else { continue };
        let Some(field) = schema.lookup(field_caption) else { continue };
        if field.sample_values.is_empty() {
            continue;
        }

        for value in values.iter_mut() {
            if field.sample_values.iter().any(|s| s == value) {
                continue;
            }
            if let Some(exact) = field.sample_values.iter().find(|s| s.eq_ignore_ascii_case(value)) {
                changes.push(format!("canonicalized filter value '{}' -> '{}' on '{}'", value, exact, field_caption));
                *value = exact.clone();
                continue;
            }
            let normalized = |s: &str| s.chars().filter(|c| c.is_alphanumeric()).collect::<String>().to_lowercase();
            let target = normalized(value);
            if let Some(matched) = field.sample_values.iter().find(|s| normalized(s) == target) {
                changes.push(format!("canonicalized filter value '{}' -> '{}' on '{}'", value, matched, field_caption));
                *value = matched.clone();
            }
        }
    }
}

fn rename_colliding_calculated_fields(draft: &mut crate::models::vizql::VDSQuery, schema: &EnrichedSchema, changes: &mut Vec<String>) {
    for field in &mut draft.query.fields {
        if field.calculation.is_none() {
            continue;
        }
        if schema.contains(&field.field_caption) {
            let renamed = format!("{} (calc)", field.field_caption);
            changes.push(format!("renamed calculated field '{}' -> '{}' to avoid a schema collision", field.field_caption, renamed));
            field.field_caption = renamed;
        }
    }
}

fn strip_caption_from_calculated_filters(draft: &mut crate::models::vizql::VDSQuery, changes: &mut Vec<String>) {
    for filter in &mut draft.query.filters {
        if let VDSFilter::Top { field_to_measure, .. } = filter {
            if field_to_measure.calculation.is_some() && !field_to_measure.field_caption.is_empty() {
                changes.push("cleared fieldCaption on a TOP filter's calculated measure".to_string());
                field_to_measure.field_caption.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vizql::{EnrichedField, DataType, FieldRole, VDSField, VDSQuery};

    fn dimension(caption: &str, samples: Vec<&str>) -> EnrichedField {
        EnrichedField {
            caption: caption.to_string(),
            logical_name: caption.to_string(),
            data_type: DataType::String,
            role: FieldRole::Dimension,
            default_aggregation: None,
            formula: None,
            cardinality: None,
            sample_values: samples.into_iter().map(String::from).collect(),
            value_counts: None,
            min: None,
            max: None,
            median: None,
            null_percentage: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn distinct_keyword_rewrites_count_to_countd() {
        let mut query = VDSQuery::new("ds1");
        query.query.fields.push(VDSField { field_caption: "Customer ID".to_string(), function: Some("COUNT".to_string()), calculation: None });

        let mut state = VizQLGraphState::new("how many distinct customers", vec!["ds1".into()], vec![]);
        state.query_draft = Some(query);

        let ctx = super::super::super::graph::test_support::dummy_run_context();
        let next = run(&state, &ctx).await.unwrap();
        assert_eq!(next.query_draft.unwrap().query.fields[0].function.as_deref(), Some("COUNTD"));
        assert!(!next.pre_validation_changes.is_empty());
    }

    #[tokio::test]
    async fn by_month_applies_month_truncation() {
        let mut query = VDSQuery::new("ds1");
        query.query.fields.push(VDSField { field_caption: "Order Date".to_string(), function: None, calculation: None });

        let mut state = VizQLGraphState::new("sales by month", vec!["ds1".into()], vec![]);
        state.query_draft = Some(query);

        let ctx = super::super::super::graph::test_support::dummy_run_context();
        let next = run(&state, &ctx).await.unwrap();
        assert_eq!(next.query_draft.unwrap().query.fields[0].function.as_deref(), Some("TRUNC_MONTH"));
    }

    #[tokio::test]
    async fn by_monthly_does_not_falsely_trigger_month_truncation() {
        let mut query = VDSQuery::new("ds1");
        query.query.fields.push(VDSField { field_caption: "Order Date".to_string(), function: None, calculation: None });

        let mut state = VizQLGraphState::new("sales by monthly revenue trend", vec!["ds1".into()], vec![]);
        state.query_draft = Some(query);

        let ctx = super::super::super::graph::test_support::dummy_run_context();
        let next = run(&state, &ctx).await.unwrap();
        assert_eq!(next.query_draft.unwrap().query.fields[0].function, None);
    }

    #[tokio::test]
    async fn set_filter_value_canonicalized_case_insensitively() {
        let mut query = VDSQuery::new("ds1");
        query.query.filters.push(VDSFilter::CategoricalSet {
            field_caption: "Region".to_string(),
            values: vec!["west".to_string()],
            exclude: false,
        });

        let schema = EnrichedSchema::new("ds1", vec![dimension("Region", vec!["West", "East"])]);
        let mut state = VizQLGraphState::new("sales in west region", vec!["ds1".into()], vec![]);
        state.query_draft = Some(query);
        state.enriched_schema = Some(schema);

        let ctx = super::super::super::graph::test_support::dummy_run_context();
        let next = run(&state, &ctx).await.unwrap();
        let VDSFilter::CategoricalSet { values, .. } = &next.query_draft.unwrap().query.filters[0] else { panic!("expected SET filter") };
        assert_eq!(values[0], "West");
    }
}
