//! Core data model for the VizQL agent graph (spec.md §3).
//!
//! Every record here is a plain, serde-serializable Rust struct rather than
//! a dynamic map: node functions take `&VizQLGraphState` and return a
//! `StateDelta` that the graph runtime merges field-by-field (§9 REDESIGN).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ============================================================================
// Schema model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Integer,
    Real,
    String,
    Boolean,
    Date,
    DateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldRole {
    Measure,
    Dimension,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueCount {
    pub value: String,
    pub count: u64,
}

/// A single field's metadata, enriched with statistics where available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedField {
    pub caption: String,
    pub logical_name: String,
    pub data_type: DataType,
    pub role: FieldRole,
    pub default_aggregation: Option<String>,
    /// Present for calculated fields; the calculation formula text.
    pub formula: Option<String>,
    pub cardinality: Option<u64>,
    pub sample_values: Vec<String>,
    pub value_counts: Option<Vec<ValueCount>>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub median: Option<f64>,
    pub null_percentage: Option<f64>,
    pub description: Option<String>,
}

impl EnrichedField {
    pub fn is_calculated(&self) -> bool {
        self.formula.is_some()
    }

    /// Whether the field's formula already performs its own aggregation
    /// (SUM(...), AVG(...), ...) and therefore must not carry a `function`
    /// on top (spec.md §4.7).
    pub fn formula_has_aggregation(&self) -> bool {
        let Some(formula) = &self.formula else { return false };
        let upper = formula.to_uppercase();
        const PATTERNS: &[&str] = &[
            "SUM(", "AVG(", "AVERAGE(", "COUNT(", "COUNTD(", "MIN(", "MAX(", "MEDIAN(", "STDEV(", "VAR(",
        ];
        PATTERNS.iter().any(|p| upper.contains(p))
    }
}

/// Enriched schema for a single datasource, with precomputed measure/
/// dimension views and a case-insensitive caption lookup (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedSchema {
    pub datasource_id: String,
    pub fields: Vec<EnrichedField>,
    pub measures: Vec<EnrichedField>,
    pub dimensions: Vec<EnrichedField>,
    /// Lowercased caption (and lowercased last dot-segment of any
    /// fully-qualified name) -> field. Built once in `new`.
    pub field_map: HashMap<String, EnrichedField>,
}

impl EnrichedSchema {
    pub fn new(datasource_id: impl Into<String>, fields: Vec<EnrichedField>) -> Self {
        let measures: Vec<EnrichedField> =
            fields.iter().filter(|f| f.role == FieldRole::Measure).cloned().collect();
        let dimensions: Vec<EnrichedField> =
            fields.iter().filter(|f| f.role == FieldRole::Dimension).cloned().collect();

        let mut field_map = HashMap::new();
        for field in &fields {
            field_map.insert(field.caption.to_lowercase(), field.clone());
            if let Some((_, last)) = field.caption.rsplit_once('.') {
                field_map.entry(last.to_lowercase()).or_insert_with(|| field.clone());
            }
        }

        Self { datasource_id: datasource_id.into(), fields, measures, dimensions, field_map }
    }

    /// Case-insensitive lookup, matching either the full caption or its
    /// fully-qualified last segment.
    pub fn lookup(&self, caption: &str) -> Option<&EnrichedField> {
        self.field_map.get(&caption.to_lowercase())
    }

    pub fn contains(&self, caption: &str) -> bool {
        self.lookup(caption).is_some()
    }
}

// ============================================================================
// VDS query model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReturnFormat {
    Objects,
    Arrays,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VDSDatasource {
    #[serde(rename = "datasourceLuid")]
    pub datasource_luid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VDSField {
    #[serde(rename = "fieldCaption")]
    pub field_caption: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum TopDirection {
    Top,
    Bottom,
}

/// A VDS filter. Tagged by `filterType` the way the upstream wire format
/// expects; field names follow the upstream's camelCase convention.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "filterType")]
pub enum VDSFilter {
    #[serde(rename = "QUANTITATIVE_NUMERICAL")]
    Quantitative {
        #[serde(rename = "fieldCaption")]
        field_caption: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    #[serde(rename = "SET")]
    CategoricalSet {
        #[serde(rename = "fieldCaption")]
        field_caption: String,
        values: Vec<String>,
        #[serde(default, rename = "exclude")]
        exclude: bool,
    },
    #[serde(rename = "TOP")]
    Top {
        #[serde(rename = "fieldCaption")]
        field_caption: String,
        #[serde(rename = "howMany")]
        how_many: u32,
        direction: TopDirection,
        #[serde(rename = "fieldToMeasure")]
        field_to_measure: VDSField,
    },
    #[serde(rename = "MATCH")]
    Match {
        #[serde(rename = "fieldCaption")]
        field_caption: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        contains: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        #[serde(rename = "startsWith")]
        starts_with: Option<String>,
    },
    #[serde(rename = "DATE")]
    Date {
        #[serde(rename = "fieldCaption")]
        field_caption: String,
        #[serde(rename = "periodType")]
        period_type: String,
        #[serde(rename = "dateRangeType")]
        date_range_type: String,
    },
    #[serde(rename = "CONTEXT")]
    Context {
        #[serde(rename = "fieldCaption")]
        field_caption: String,
        values: Vec<String>,
    },
}

impl VDSFilter {
    pub fn field_caption(&self) -> &str {
        match self {
            VDSFilter::Quantitative { field_caption, .. }
            | VDSFilter::CategoricalSet { field_caption, .. }
            | VDSFilter::Top { field_caption, .. }
            | VDSFilter::Match { field_caption, .. }
            | VDSFilter::Date { field_caption, .. }
            | VDSFilter::Context { field_caption, .. } => field_caption,
        }
    }

    /// True for SET filters, the only variant the pre-validation rewriter
    /// canonicalizes values for (spec.md §4.6).
    pub fn as_categorical_set_mut(&mut self) -> Option<(&str, &mut Vec<String>)> {
        match self {
            VDSFilter::CategoricalSet { field_caption, values, .. } => Some((field_caption.as_str(), values)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VDSOptions {
    #[serde(rename = "returnFormat")]
    pub return_format: ReturnFormat,
    pub disaggregate: bool,
}

impl Default for VDSOptions {
    fn default() -> Self {
        Self { return_format: ReturnFormat::Objects, disaggregate: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VDSQueryBody {
    pub fields: Vec<VDSField>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<VDSFilter>,
}

/// The draft VDS JSON query, as built by the Query Builder node and
/// executed by the Executor node (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VDSQuery {
    pub datasource: VDSDatasource,
    pub query: VDSQueryBody,
    #[serde(default)]
    pub options: VDSOptions,
}

impl VDSQuery {
    pub fn new(datasource_luid: impl Into<String>) -> Self {
        Self {
            datasource: VDSDatasource { datasource_luid: datasource_luid.into() },
            query: VDSQueryBody::default(),
            options: VDSOptions::default(),
        }
    }
}

// ============================================================================
// Query result model
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QueryResult {
    pub columns: Vec<String>,
    #[schema(value_type = Vec<Vec<Object>>)]
    pub data: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    #[serde(default)]
    pub dimension_values: HashMap<String, Vec<String>>,
}

// ============================================================================
// Raw schema (as read from the BI metadata API, before enrichment)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawColumn {
    pub name: String,
    pub data_type: Option<String>,
    pub column_class: Option<String>,
    pub default_aggregation: Option<String>,
    pub formula: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSchema {
    pub datasource_id: String,
    pub columns: Vec<RawColumn>,
}

// ============================================================================
// Reasoning / streaming
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub node: String,
    pub timestamp: DateTime<Utc>,
    pub thought: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_draft: Option<VDSQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-reasoning-step metadata surfaced to the streaming gateway
/// (tool calls, token counts, the in-flight query draft). `query_draft` is
/// populated only for build/pre-validation steps and cleared by the time
/// the validate/execute steps run (spec.md §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_draft: Option<VDSQuery>,
}

// ============================================================================
// Conversation replay interface (thin; real persistence is external, §1)
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vizql_query: Option<VDSQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_results: Option<QueryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub extra_metadata: TurnMetadata,
}

// ============================================================================
// Graph state
// ============================================================================

/// Full per-request graph state (spec.md §3). Created once per request,
/// mutated only by node functions returning a `StateDelta` merged by the
/// runtime, and dropped when the stream terminates. Every field is plain
/// data - non-serializable resources (BI/LLM clients) never live here;
/// see `RunContext` in `services::vizql::graph`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VizQLGraphState {
    pub user_query: String,
    #[serde(default)]
    pub context_datasources: Vec<String>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,

    pub schema: Option<RawSchema>,
    pub enriched_schema: Option<EnrichedSchema>,

    pub query_draft: Option<VDSQuery>,
    pub query_version: u32,

    pub build_attempt: u32,
    pub execution_attempt: u32,

    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub validation_suggestions: Vec<String>,
    #[serde(default)]
    pub execution_errors: Vec<String>,
    #[serde(default)]
    pub pre_validation_changes: Vec<String>,

    pub is_valid: Option<bool>,

    pub query_results: Option<QueryResult>,
    #[serde(default)]
    pub shown_entities: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub reasoning_steps: Vec<ReasoningStep>,
    #[serde(default)]
    pub current_thought: String,
    #[serde(default)]
    pub step_metadata: StepMetadata,

    pub final_answer: Option<String>,
    pub error: Option<String>,
}

impl VizQLGraphState {
    pub fn new(user_query: impl Into<String>, context_datasources: Vec<String>, messages: Vec<ConversationMessage>) -> Self {
        Self {
            user_query: user_query.into(),
            context_datasources,
            messages,
            schema: None,
            enriched_schema: None,
            query_draft: None,
            query_version: 0,
            build_attempt: 0,
            execution_attempt: 1,
            validation_errors: Vec::new(),
            validation_suggestions: Vec::new(),
            execution_errors: Vec::new(),
            pre_validation_changes: Vec::new(),
            is_valid: None,
            query_results: None,
            shown_entities: HashMap::new(),
            reasoning_steps: Vec::new(),
            current_thought: String::new(),
            step_metadata: StepMetadata::default(),
            final_answer: None,
            error: None,
        }
    }

    pub fn push_reasoning(&mut self, node: &str, thought: impl Into<String>) {
        let thought = thought.into();
        self.current_thought = thought.clone();
        self.reasoning_steps.push(ReasoningStep {
            node: node.to_string(),
            timestamp: Utc::now(),
            thought,
            action: None,
            tool_calls: Vec::new(),
            build_attempt: if node == "build_query" || node == "pre_validation" {
                Some(self.build_attempt)
            } else {
                None
            },
            query_draft: if node == "build_query" || node == "pre_validation" {
                self.query_draft.clone()
            } else {
                None
            },
            error: None,
        });
    }
}

// ============================================================================
// Multi-agent orchestration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Vizql,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub agent_type: AgentType,
    pub action: String,
    #[serde(default)]
    pub depends_on: Option<Vec<usize>>,
    #[serde(default)]
    pub input_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiAgentPlan {
    pub steps: Vec<PlanStep>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measure(caption: &str) -> EnrichedField {
        EnrichedField {
            caption: caption.to_string(),
            logical_name: caption.to_string(),
            data_type: DataType::Real,
            role: FieldRole::Measure,
            default_aggregation: Some("SUM".to_string()),
            formula: None,
            cardinality: None,
            sample_values: Vec::new(),
            value_counts: None,
            min: Some(0.0),
            max: Some(100.0),
            median: Some(50.0),
            null_percentage: Some(0.0),
            description: None,
        }
    }

    #[test]
    fn field_map_is_case_insensitive() {
        let schema = EnrichedSchema::new("ds1", vec![measure("Sales")]);
        assert!(schema.contains("sales"));
        assert!(schema.contains("SALES"));
        assert!(schema.contains("Sales"));
        assert!(!schema.contains("profit"));
    }

    #[test]
    fn measures_and_dimensions_are_subsets_of_fields() {
        let mut dim = measure("Region");
        dim.role = FieldRole::Dimension;
        dim.default_aggregation = None;
        let schema = EnrichedSchema::new("ds1", vec![measure("Sales"), dim]);
        assert_eq!(schema.measures.len(), 1);
        assert_eq!(schema.dimensions.len(), 1);
        assert!(schema.measures.iter().all(|f| schema.fields.iter().any(|g| g.caption == f.caption)));
        assert!(schema.dimensions.iter().all(|f| schema.fields.iter().any(|g| g.caption == f.caption)));
    }

    #[test]
    fn formula_with_aggregation_is_detected() {
        let mut field = measure("Profit Ratio");
        field.formula = Some("SUM([Profit]) / SUM([Sales])".to_string());
        assert!(field.formula_has_aggregation());

        let mut plain_calc = measure("Margin");
        plain_calc.formula = Some("[Profit] / [Sales]".to_string());
        assert!(!plain_calc.formula_has_aggregation());
    }

    #[test]
    fn new_state_starts_at_attempt_zero_build_one_exec() {
        let state = VizQLGraphState::new("show sales", vec!["ds1".into()], vec![]);
        assert_eq!(state.build_attempt, 0);
        assert_eq!(state.execution_attempt, 1);
        assert_eq!(state.query_version, 0);
    }
}
