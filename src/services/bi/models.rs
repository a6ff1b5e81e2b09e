//! Wire types for the BI VizQL Data Service and Metadata GraphQL APIs
//! (spec.md §6 Upstream Contracts).

use serde::{Deserialize, Serialize};

use crate::models::vizql::{QueryResult, RawColumn, RawSchema, VDSQuery};

/// Authentication mode for a BI server config (spec.md §3 lifecycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Pat,
    Password,
    ConnectedApp,
}

impl AuthMode {
    pub fn from_config_str(s: &str) -> Self {
        match s {
            "password" => Self::Password,
            "connected_app" | "jwt" => Self::ConnectedApp,
            _ => Self::Pat,
        }
    }

    /// PAT/password sessions demand explicit re-authentication on expiry
    /// rather than an implicit refresh (spec.md §3, §4.1).
    pub fn requires_manual_reauth(&self) -> bool {
        matches!(self, Self::Pat | Self::Password)
    }
}

#[derive(Debug, Clone)]
pub struct BiServerConfig {
    pub server_url: String,
    pub site_name: String,
    pub auth_mode: AuthMode,
    pub api_version: String,
}

// ---------------------------------------------------------------------------
// read-metadata response
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MetadataResponse {
    pub data: Vec<MetadataColumn>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataColumn {
    #[serde(rename = "fieldName")]
    pub field_name: String,
    #[serde(rename = "dataType")]
    pub data_type: Option<String>,
    #[serde(rename = "columnClass")]
    pub column_class: Option<String>,
    #[serde(rename = "defaultAggregation")]
    pub default_aggregation: Option<String>,
    pub formula: Option<String>,
    pub description: Option<String>,
}

impl From<MetadataResponse> for Vec<RawColumn> {
    fn from(resp: MetadataResponse) -> Self {
        resp.data
            .into_iter()
            .map(|c| RawColumn {
                name: c.field_name,
                data_type: c.data_type,
                column_class: c.column_class,
                default_aggregation: c.default_aggregation,
                formula: c.formula,
                description: c.description,
            })
            .collect()
    }
}

pub fn build_raw_schema(datasource_id: &str, resp: MetadataResponse) -> RawSchema {
    RawSchema { datasource_id: datasource_id.to_string(), columns: resp.into() }
}

// ---------------------------------------------------------------------------
// query-datasource response
// ---------------------------------------------------------------------------

/// The upstream `query-datasource` response. Column order is carried in
/// `data[].columnName` when present (OBJECTS format); if the upstream ever
/// returns bare arrays (no per-row keys), the facade falls back to the
/// query's own field order and logs a correctness warning (spec.md §4.1).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum VdsQueryResponse {
    Objects { data: Vec<serde_json::Map<String, serde_json::Value>> },
    Arrays { data: Vec<Vec<serde_json::Value>> },
}

pub fn build_query_result(response: VdsQueryResponse, requested_fields: &[String]) -> QueryResult {
    match response {
        VdsQueryResponse::Objects { data } => {
            let mut columns: Vec<String> = Vec::new();
            if let Some(first) = data.first() {
                columns = first.keys().cloned().collect();
            }
            if columns.is_empty() {
                columns = requested_fields.to_vec();
            }
            let rows: Vec<Vec<serde_json::Value>> = data
                .into_iter()
                .map(|mut row| {
                    columns.iter().map(|c| row.remove(c).unwrap_or(serde_json::Value::Null)).collect()
                })
                .collect();
            let row_count = rows.len();
            QueryResult { columns, data: rows, row_count, dimension_values: Default::default() }
        },
        VdsQueryResponse::Arrays { data } => {
            tracing::warn!(
                "VDS response returned bare arrays with no column metadata; inferring column order from the \
                 request's field order. This is a correctness risk if the upstream ever reorders columns."
            );
            let row_count = data.len();
            QueryResult { columns: requested_fields.to_vec(), data, row_count, dimension_values: Default::default() }
        },
    }
}

#[derive(Debug, Serialize)]
pub struct VdsExecuteRequest<'a> {
    pub datasource: &'a crate::models::vizql::VDSDatasource,
    pub query: &'a crate::models::vizql::VDSQueryBody,
    pub options: crate::models::vizql::VDSOptions,
}

impl<'a> VdsExecuteRequest<'a> {
    /// Forces `options.returnFormat = OBJECTS` and drops the request's own
    /// `options`-level `limit` key if present - `limit` is not a valid
    /// upstream VDS option and must never be forwarded (spec.md §4.1, §6).
    pub fn from_query(query: &'a VDSQuery) -> Self {
        let mut options = query.options.clone();
        options.return_format = crate::models::vizql::ReturnFormat::Objects;
        Self { datasource: &query.datasource, query: &query.query, options }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_response_falls_back_to_requested_field_order() {
        let resp = VdsQueryResponse::Arrays { data: vec![vec![serde_json::json!(1), serde_json::json!("x")]] };
        let result = build_query_result(resp, &["Sales".to_string(), "Region".to_string()]);
        assert_eq!(result.columns, vec!["Sales".to_string(), "Region".to_string()]);
        assert_eq!(result.row_count, 1);
    }

    #[test]
    fn objects_response_reconstructs_column_order_from_first_row() {
        let mut row = serde_json::Map::new();
        row.insert("Region".to_string(), serde_json::json!("West"));
        row.insert("Sales".to_string(), serde_json::json!(100));
        let resp = VdsQueryResponse::Objects { data: vec![row] };
        let result = build_query_result(resp, &[]);
        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.data[0].len(), 2);
    }
}
