//! Schema Enricher (spec.md §4.3). Merges raw metadata, per-field
//! statistics, and metadata-graph descriptions/formulas into an
//! `EnrichedSchema`, falling back gracefully if any source fails - partial
//! enrichment beats failure.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::models::vizql::{DataType, EnrichedField, EnrichedSchema, FieldRole, RawColumn};
use crate::services::bi::BiClient;

/// Builds `EnrichedSchema` for a datasource. Holds only a `BiClient` handle
/// and cache sizing config - it is stateless beyond that and safe to share
/// across requests.
pub struct SchemaEnricher {
    bi: Arc<dyn BiClient>,
    cardinality_threshold: u64,
}

impl SchemaEnricher {
    pub fn new(bi: Arc<dyn BiClient>, cache_config: &CacheConfig) -> Self {
        Self { bi, cardinality_threshold: cache_config.cardinality_threshold }
    }

    pub async fn enrich(&self, datasource_id: &str) -> EnrichedSchema {
        let raw = match self.bi.read_metadata(datasource_id).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("read_metadata failed for {}: {}; returning empty schema", datasource_id, e);
                return EnrichedSchema::new(datasource_id, Vec::new());
            },
        };

        let roles = match self.bi.read_metadata_roles(datasource_id).await {
            Ok(roles) => roles,
            Err(e) => {
                tracing::warn!("read_metadata_roles failed for {}: {}; falling back to columnClass/heuristic", datasource_id, e);
                HashMap::new()
            },
        };

        let mut fields = Vec::with_capacity(raw.columns.len());
        for column in raw.columns {
            let role = Self::resolve_role(&column, &roles);
            let data_type = Self::resolve_data_type(&column);
            let mut field = EnrichedField {
                caption: column.name.clone(),
                logical_name: column.name.clone(),
                data_type,
                role,
                default_aggregation: column.default_aggregation,
                formula: column.formula,
                cardinality: None,
                sample_values: Vec::new(),
                value_counts: None,
                min: None,
                max: None,
                median: None,
                null_percentage: None,
                description: column.description,
            };

            if matches!(role, FieldRole::Measure) {
                self.enrich_measure_statistics(datasource_id, &mut field).await;
            } else {
                self.enrich_dimension_statistics(datasource_id, &mut field).await;
            }

            fields.push(field);
        }

        EnrichedSchema::new(datasource_id, fields)
    }

    /// Role priority: metadata-API role > `columnClass` > heuristic
    /// (numeric + default aggregation ⇒ measure) (spec.md §4.3).
    fn resolve_role(column: &RawColumn, roles: &HashMap<String, FieldRole>) -> FieldRole {
        if let Some(role) = roles.get(&column.name) {
            return *role;
        }
        if let Some(class) = &column.column_class {
            return match class.as_str() {
                "MEASURE" => FieldRole::Measure,
                "COLUMN" | "BIN" | "GROUP" => FieldRole::Dimension,
                _ => Self::heuristic_role(column),
            };
        }
        Self::heuristic_role(column)
    }

    fn heuristic_role(column: &RawColumn) -> FieldRole {
        let numeric = matches!(column.data_type.as_deref(), Some("INTEGER") | Some("REAL"));
        if numeric && column.default_aggregation.is_some() { FieldRole::Measure } else { FieldRole::Dimension }
    }

    fn resolve_data_type(column: &RawColumn) -> DataType {
        match column.data_type.as_deref() {
            Some("INTEGER") => DataType::Integer,
            Some("REAL") => DataType::Real,
            Some("BOOLEAN") => DataType::Boolean,
            Some("DATE") => DataType::Date,
            Some("DATETIME") => DataType::DateTime,
            _ => DataType::String,
        }
    }

    /// MIN/MAX/MEDIAN for numeric measures (spec.md §4.3). Best-effort -
    /// statistics failures leave the field partially enriched, not failed.
    async fn enrich_measure_statistics(&self, datasource_id: &str, field: &mut EnrichedField) {
        if !matches!(field.data_type, DataType::Integer | DataType::Real) {
            return;
        }
        match self.bi.field_statistics(datasource_id, &field.caption, FieldRole::Measure).await {
            Ok(stats) => {
                field.min = stats.min;
                field.max = stats.max;
                field.median = stats.median;
                field.null_percentage = stats.null_percentage;
            },
            Err(e) => {
                tracing::warn!("field_statistics failed for measure '{}': {}; leaving stats unset", field.caption, e);
            },
        }
    }

    /// Top-N value counts + COUNTD for dimensions. Cardinality is computed
    /// only when the dimension's sample size is small enough to merit it
    /// (spec.md §4.3) - a cheap guard against running an expensive COUNTD
    /// against a high-cardinality identifier column.
    async fn enrich_dimension_statistics(&self, datasource_id: &str, field: &mut EnrichedField) {
        match self.bi.field_statistics(datasource_id, &field.caption, FieldRole::Dimension).await {
            Ok(stats) => {
                if let Some(cardinality) = stats.cardinality {
                    if cardinality <= self.cardinality_threshold {
                        field.cardinality = Some(cardinality);
                    }
                }
                field.sample_values = stats.sample_values;
                field.value_counts = stats.value_counts;
                field.null_percentage = stats.null_percentage;
            },
            Err(e) => {
                tracing::warn!("field_statistics failed for dimension '{}': {}; leaving stats unset", field.caption, e);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vizql::RawColumn;

    fn column(name: &str, data_type: &str, class: Option<&str>, agg: Option<&str>) -> RawColumn {
        RawColumn {
            name: name.to_string(),
            data_type: Some(data_type.to_string()),
            column_class: class.map(str::to_string),
            default_aggregation: agg.map(str::to_string),
            formula: None,
            description: None,
        }
    }

    #[test]
    fn column_class_measure_wins_over_heuristic() {
        let col = column("Weird", "STRING", Some("MEASURE"), None);
        assert_eq!(SchemaEnricher::resolve_role(&col, &HashMap::new()), FieldRole::Measure);
    }

    #[test]
    fn heuristic_requires_numeric_and_aggregation() {
        let numeric_no_agg = column("Order ID", "INTEGER", None, None);
        assert_eq!(SchemaEnricher::resolve_role(&numeric_no_agg, &HashMap::new()), FieldRole::Dimension);

        let numeric_with_agg = column("Sales", "REAL", None, Some("SUM"));
        assert_eq!(SchemaEnricher::resolve_role(&numeric_with_agg, &HashMap::new()), FieldRole::Measure);
    }

    #[test]
    fn metadata_api_role_overrides_everything() {
        let col = column("Sales", "REAL", Some("COLUMN"), Some("SUM"));
        let mut roles = HashMap::new();
        roles.insert("Sales".to_string(), FieldRole::Dimension);
        assert_eq!(SchemaEnricher::resolve_role(&col, &roles), FieldRole::Dimension);
    }
}
