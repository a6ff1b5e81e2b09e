//! Context Compressor (spec.md §4.4) - turns an `EnrichedSchema` plus the
//! user query (and any parsed intent) into a compact, deterministic text
//! block for the Query Builder's single LLM completion.

use std::fmt::Write as _;

use crate::models::vizql::{EnrichedField, EnrichedSchema, FieldRole};

const CALCULATION_KEYWORDS: &[&str] =
    &["calculate", "calculation", "formula", "ratio", "margin", "percentage", "divide", "divided by"];
const BIN_KEYWORDS: &[&str] = &["bin", "bins", "bucket", "buckets", "group by range"];

/// Structured hints extracted from the user query (and, for multi-agent
/// plans, from a planner step) that bias query construction without
/// constraining it outright.
#[derive(Debug, Clone, Default)]
pub struct ParsedIntent {
    pub measures: Vec<String>,
    pub dimensions: Vec<String>,
    pub filters: Vec<String>,
    pub top_n: Option<u32>,
    pub sorting: Option<String>,
}

impl ParsedIntent {
    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
            && self.dimensions.is_empty()
            && self.filters.is_empty()
            && self.top_n.is_none()
            && self.sorting.is_none()
    }
}

pub struct ContextCompressor;

impl ContextCompressor {
    /// Builds the compact prompt context. Calculated fields and bins are
    /// suppressed unless the user query contains their triggering keywords
    /// - this keeps the prompt small and deterministic (spec.md §4.4).
    pub fn compress(schema: &EnrichedSchema, user_query: &str, intent: Option<&ParsedIntent>) -> String {
        let query_lower = user_query.to_lowercase();
        let wants_calculations = CALCULATION_KEYWORDS.iter().any(|kw| query_lower.contains(kw));
        let wants_bins = BIN_KEYWORDS.iter().any(|kw| query_lower.contains(kw));

        let mut out = String::new();

        Self::write_available_fields(&mut out, schema, wants_calculations, wants_bins);
        Self::write_construction_hints(&mut out, schema);
        Self::write_matching_hints(&mut out, schema, user_query);
        if let Some(intent) = intent.filter(|i| !i.is_empty()) {
            Self::write_parsed_intent(&mut out, intent);
        }

        out
    }

    fn write_available_fields(out: &mut String, schema: &EnrichedSchema, wants_calculations: bool, wants_bins: bool) {
        let _ = writeln!(out, "## Available Fields");

        let _ = writeln!(out, "\n### Measures");
        for field in &schema.measures {
            if field.is_calculated() && !wants_calculations {
                continue;
            }
            Self::write_field_line(out, field);
        }

        let _ = writeln!(out, "\n### Dimensions");
        for field in &schema.dimensions {
            let looks_like_bin = field.caption.to_lowercase().contains("bin") || field.caption.to_lowercase().contains("bucket");
            if looks_like_bin && !wants_bins {
                continue;
            }
            Self::write_field_line(out, field);
        }
        out.push('\n');
    }

    fn write_field_line(out: &mut String, field: &EnrichedField) {
        let mut parts = vec![format!("- **{}**", field.caption)];
        parts.push(format!("type={:?}", field.data_type));
        if let Some(agg) = &field.default_aggregation {
            parts.push(format!("default_agg={}", agg));
        }
        if let Some(formula) = &field.formula {
            parts.push(format!("calc=`{}`", formula));
        }
        if let (Some(min), Some(max)) = (field.min, field.max) {
            parts.push(format!("range=[{:.2}, {:.2}]", min, max));
        }
        if let Some(cardinality) = field.cardinality {
            parts.push(format!("cardinality={}", cardinality));
        }
        if !field.sample_values.is_empty() {
            let preview: Vec<&str> = field.sample_values.iter().take(5).map(String::as_str).collect();
            parts.push(format!("samples=[{}]", preview.join(", ")));
        }
        let _ = writeln!(out, "{}", parts.join(", "));
    }

    fn write_construction_hints(out: &mut String, schema: &EnrichedSchema) {
        let _ = writeln!(out, "## Query Construction Hints");
        let _ = writeln!(out, "- Every non-calculated fieldCaption must match a field listed above exactly (case-insensitive).");
        let _ = writeln!(out, "- Calculated fields (those with a `calc=` formula shown) must never carry a `function` if their formula already aggregates.");
        let _ = writeln!(out, "- Use TRUNC_YEAR/TRUNC_QUARTER/TRUNC_MONTH/TRUNC_WEEK/TRUNC_DAY for \"by year/quarter/month/week/day\" requests.");
        let _ = writeln!(out, "- Use COUNTD for \"distinct\"/\"unique\" count requests.");
        if schema.dimensions.iter().any(|d| d.cardinality.map(|c| c > 1000).unwrap_or(false)) {
            let _ = writeln!(out, "- This datasource has high-cardinality dimensions; prefer a TOP filter over an unbounded fetch.");
        }
        out.push('\n');
    }

    /// Fuzzy field-name lookups for terms in the user query that don't
    /// exactly match a caption, helping the LLM disambiguate near-miss
    /// phrasing before it ever produces a draft.
    fn write_matching_hints(out: &mut String, schema: &EnrichedSchema, user_query: &str) {
        let _ = writeln!(out, "## Field Matching Hints");
        let tokens: Vec<String> = user_query
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|t| t.len() > 2)
            .collect();

        let captions: Vec<&str> = schema.fields.iter().map(|f| f.caption.as_str()).collect();
        let mut any = false;
        for token in &tokens {
            if schema.contains(token) {
                continue;
            }
            let matches = crate::utils::similarity::close_matches(token, captions.iter().copied(), 2);
            if !matches.is_empty() {
                any = true;
                let _ = writeln!(out, "- \"{}\" may refer to: {}", token, matches.join(" or "));
            }
        }
        if !any {
            let _ = writeln!(out, "- (none)");
        }
        out.push('\n');
    }

    fn write_parsed_intent(out: &mut String, intent: &ParsedIntent) {
        let _ = writeln!(out, "## Parsed Intent");
        if !intent.measures.is_empty() {
            let _ = writeln!(out, "- Required measures: {}", intent.measures.join(", "));
        }
        if !intent.dimensions.is_empty() {
            let _ = writeln!(out, "- Required dimensions: {}", intent.dimensions.join(", "));
        }
        if !intent.filters.is_empty() {
            let _ = writeln!(out, "- Required filters: {}", intent.filters.join(", "));
        }
        if let Some(top_n) = intent.top_n {
            let _ = writeln!(out, "- Top N: {}", top_n);
        }
        if let Some(sorting) = &intent.sorting {
            let _ = writeln!(out, "- Sorting: {}", sorting);
        }
    }

    /// Role-filtered view, used when the builder only needs one axis
    /// (e.g. meta-selector classification).
    pub fn role_captions(schema: &EnrichedSchema, role: FieldRole) -> Vec<String> {
        schema.fields.iter().filter(|f| f.role == role).map(|f| f.caption.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vizql::{DataType, EnrichedField};

    fn field(caption: &str, role: FieldRole, formula: Option<&str>) -> EnrichedField {
        EnrichedField {
            caption: caption.to_string(),
            logical_name: caption.to_string(),
            data_type: DataType::Real,
            role,
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
    fn calculated_fields_suppressed_without_trigger_keyword() {
        let schema = EnrichedSchema::new(
            "ds1",
            vec![field("Sales", FieldRole::Measure, None), field("Profit Ratio", FieldRole::Measure, Some("SUM([Profit])/SUM([Sales])"))],
        );
        let context = ContextCompressor::compress(&schema, "show total sales", None);
        assert!(context.contains("Sales"));
        assert!(!context.contains("Profit Ratio"));
    }

    #[test]
    fn calculated_fields_shown_with_trigger_keyword() {
        let schema = EnrichedSchema::new(
            "ds1",
            vec![field("Profit Ratio", FieldRole::Measure, Some("SUM([Profit])/SUM([Sales])"))],
        );
        let context = ContextCompressor::compress(&schema, "show me the profit margin ratio", None);
        assert!(context.contains("Profit Ratio"));
    }

    #[test]
    fn parsed_intent_section_only_when_present() {
        let schema = EnrichedSchema::new("ds1", vec![field("Sales", FieldRole::Measure, None)]);
        let without = ContextCompressor::compress(&schema, "sales", None);
        assert!(!without.contains("Parsed Intent"));

        let intent = ParsedIntent { measures: vec!["Sales".to_string()], ..Default::default() };
        let with = ContextCompressor::compress(&schema, "sales", Some(&intent));
        assert!(with.contains("Parsed Intent"));
    }
}
