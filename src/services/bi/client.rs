//! `TableauVdsClient` - reqwest-based `BiClient` implementation against the
//! Tableau VizQL Data Service and Metadata GraphQL, modeled on the
//! teacher's `StarRocksClient`/`MySQLClient` HTTP-session idiom and on
//! `tableau/client.py`'s endpoint shapes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::BiConfig;
use crate::models::vizql::{FieldRole, RawSchema, VDSQuery, QueryResult};

use super::models::{build_query_result, build_raw_schema, MetadataResponse, VdsExecuteRequest, VdsQueryResponse};
use super::token_cache::TokenCache;
use super::{AuthMode, BiClient, BiError, BiServerConfig, FieldStatistics};

/// Cap on the grouped value-count query used to enrich a dimension's
/// `sample_values`/`value_counts` (spec.md §4.3's "top-N value counts").
const TOP_N_VALUE_COUNTS: u32 = 20;

pub struct TableauVdsClient {
    http: Client,
    config: BiServerConfig,
    tokens: TokenCache,
    /// Identity this client authenticates as; used as the token-cache key
    /// alongside the server config name.
    user: String,
    pat_name: Option<String>,
    pat_secret: Option<String>,
}

impl TableauVdsClient {
    pub fn new(bi_config: &BiConfig, user: impl Into<String>, tokens: TokenCache) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(bi_config.request_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("failed to build BI HTTP client: {}; falling back to default", e);
                Client::default()
            });

        Self {
            http,
            config: BiServerConfig {
                server_url: bi_config.server_url.clone(),
                site_name: bi_config.site_name.clone(),
                auth_mode: AuthMode::from_config_str(&bi_config.auth_mode),
                api_version: bi_config.api_version.clone(),
            },
            tokens,
            user: user.into(),
            pat_name: None,
            pat_secret: None,
        }
    }

    pub fn with_pat_credentials(mut self, name: impl Into<String>, secret: impl Into<String>) -> Self {
        self.pat_name = Some(name.into());
        self.pat_secret = Some(secret.into());
        self
    }

    fn vds_url(&self, path: &str) -> String {
        format!("{}/api/v1/vizql-data-service/{}", self.config.server_url.trim_end_matches('/'), path)
    }

    fn metadata_graphql_url(&self) -> String {
        format!("{}/api/metadata/graphql", self.config.server_url.trim_end_matches('/'))
    }

    fn server_key(&self) -> String {
        format!("{}|{}", self.config.server_url, self.config.site_name)
    }

    /// Returns a valid auth token, signing in if none is cached. PAT and
    /// password sessions never auto-refresh past their cached TTL; on
    /// expiry they surface `AuthExpired` rather than transparently
    /// re-authenticating (spec.md §4.1).
    async fn auth_token(&self) -> Result<String, BiError> {
        let server_key = self.server_key();
        if let Some(token) = self.tokens.get(&self.user, &server_key) {
            return Ok(token);
        }

        if !self.tokens.can_refresh(self.config.auth_mode) {
            return Err(BiError::AuthExpired);
        }

        self.sign_in().await
    }

    async fn sign_in(&self) -> Result<String, BiError> {
        let (name, secret) = match (&self.pat_name, &self.pat_secret) {
            (Some(n), Some(s)) => (n.clone(), s.clone()),
            _ => return Err(BiError::AuthExpired),
        };

        let url = format!("{}/api/{}/auth/signin", self.config.server_url.trim_end_matches('/'), self.config.api_version);
        let body = json!({
            "credentials": {
                "personalAccessTokenName": name,
                "personalAccessTokenSecret": secret,
                "site": { "contentUrl": self.config.site_name },
            }
        });

        let response = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BiError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BiError::AuthExpired);
        }
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BiError::UpstreamError(text));
        }

        let parsed: serde_json::Value = response.json().await.map_err(|e| BiError::Transport(e.to_string()))?;
        let token = parsed["credentials"]["token"]
            .as_str()
            .ok_or_else(|| BiError::UpstreamError("sign-in response missing credentials.token".to_string()))?
            .to_string();

        self.tokens.put(&self.user, &self.server_key(), token.clone(), Duration::from_secs(4 * 60 * 60));
        Ok(token)
    }

    async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response, BiError> {
        let token = self.auth_token().await?;
        let response = self
            .http
            .post(url)
            .header("X-Tableau-Auth", &token)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| BiError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&self.user, &self.server_key());
            return Err(BiError::AuthExpired);
        }
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BiError::NotFound(url.to_string()));
        }
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BiError::UpstreamError(text));
        }

        Ok(response)
    }

    /// MIN/MAX/MEDIAN for a numeric measure (spec.md §4.3).
    async fn measure_statistics(&self, datasource_id: &str, field_caption: &str) -> Result<FieldStatistics, BiError> {
        let url = self.vds_url("query-datasource");
        let body = json!({
            "datasource": { "datasourceLuid": datasource_id },
            "query": {
                "fields": [
                    { "fieldCaption": field_caption, "function": "MIN", "fieldAlias": "min_v" },
                    { "fieldCaption": field_caption, "function": "MAX", "fieldAlias": "max_v" },
                    { "fieldCaption": field_caption, "function": "MEDIAN", "fieldAlias": "median_v" },
                ],
            },
            "options": { "returnFormat": "OBJECTS", "disaggregate": false },
        });

        let response = self.post_json(&url, &body).await?;
        let parsed: serde_json::Value =
            response.json().await.map_err(|e| BiError::UpstreamError(format!("stats parse error: {}", e)))?;

        let row = parsed["data"].as_array().and_then(|d| d.first());
        let as_f64 = |key: &str| row.and_then(|r| r.get(key)).and_then(|v| v.as_f64());

        Ok(FieldStatistics {
            min: as_f64("min_v"),
            max: as_f64("max_v"),
            median: as_f64("median_v"),
            cardinality: None,
            sample_values: Vec::new(),
            value_counts: None,
            null_percentage: None,
        })
    }

    /// Top-N value counts plus a COUNTD cardinality query for a dimension
    /// (spec.md §4.3). Two dedicated queries: one grouped-and-ranked by
    /// frequency (feeds `sample_values`/`value_counts`), one a bare COUNTD
    /// (feeds `cardinality`).
    async fn dimension_statistics(&self, datasource_id: &str, field_caption: &str) -> Result<FieldStatistics, BiError> {
        let url = self.vds_url("query-datasource");

        let top_n_body = json!({
            "datasource": { "datasourceLuid": datasource_id },
            "query": {
                "fields": [
                    { "fieldCaption": field_caption },
                    { "fieldCaption": field_caption, "function": "COUNT", "fieldAlias": "count_v" },
                ],
                "filters": [{
                    "field": "FILTER",
                    "filterType": "TOP",
                    "fieldCaption": field_caption,
                    "howMany": TOP_N_VALUE_COUNTS,
                    "direction": "TOP",
                    "fieldToMeasure": { "fieldCaption": field_caption, "function": "COUNT" },
                }],
            },
            "options": { "returnFormat": "OBJECTS", "disaggregate": false },
        });

        let cardinality_body = json!({
            "datasource": { "datasourceLuid": datasource_id },
            "query": {
                "fields": [{ "fieldCaption": field_caption, "function": "COUNTD", "fieldAlias": "cardinality_v" }],
            },
            "options": { "returnFormat": "OBJECTS", "disaggregate": false },
        });

        let top_n_response = self.post_json(&url, &top_n_body).await?;
        let top_n_parsed: serde_json::Value = top_n_response
            .json()
            .await
            .map_err(|e| BiError::UpstreamError(format!("dimension top-N stats parse error: {}", e)))?;

        let mut value_counts = Vec::new();
        if let Some(rows) = top_n_parsed["data"].as_array() {
            for row in rows {
                let Some(value) = row.get(field_caption).and_then(|v| v.as_str()) else { continue };
                let count = row.get("count_v").and_then(|v| v.as_u64()).unwrap_or(0);
                value_counts.push(crate::models::vizql::ValueCount { value: value.to_string(), count });
            }
        }
        let sample_values: Vec<String> = value_counts.iter().map(|vc| vc.value.clone()).collect();

        let cardinality_response = self.post_json(&url, &cardinality_body).await?;
        let cardinality_parsed: serde_json::Value = cardinality_response
            .json()
            .await
            .map_err(|e| BiError::UpstreamError(format!("dimension cardinality stats parse error: {}", e)))?;
        let cardinality = cardinality_parsed["data"]
            .as_array()
            .and_then(|d| d.first())
            .and_then(|r| r.get("cardinality_v"))
            .and_then(|v| v.as_u64());

        Ok(FieldStatistics {
            min: None,
            max: None,
            median: None,
            cardinality,
            sample_values,
            value_counts: Some(value_counts),
            null_percentage: None,
        })
    }
}

#[async_trait]
impl BiClient for TableauVdsClient {
    async fn read_metadata(&self, datasource_id: &str) -> Result<RawSchema, BiError> {
        let url = self.vds_url("read-metadata");
        let body = json!({ "datasource": { "datasourceLuid": datasource_id } });
        let response = self.post_json(&url, &body).await?;
        let parsed: MetadataResponse =
            response.json().await.map_err(|e| BiError::UpstreamError(format!("read-metadata parse error: {}", e)))?;
        Ok(build_raw_schema(datasource_id, parsed))
    }

    async fn read_metadata_roles(&self, datasource_id: &str) -> Result<HashMap<String, FieldRole>, BiError> {
        let query = r#"
            query FieldRoles($luid: String!) {
              datasource(luid: $luid) { fields { name role } }
            }
        "#;
        let body = json!({ "query": query, "variables": { "luid": datasource_id } });
        let response = self.post_json(&self.metadata_graphql_url(), &body).await?;
        let parsed: serde_json::Value =
            response.json().await.map_err(|e| BiError::UpstreamError(format!("metadata graphql parse error: {}", e)))?;

        let mut roles = HashMap::new();
        if let Some(fields) = parsed["data"]["datasource"]["fields"].as_array() {
            for field in fields {
                let (Some(name), Some(role)) = (field["name"].as_str(), field["role"].as_str()) else { continue };
                let role = match role.to_uppercase().as_str() {
                    "MEASURE" => FieldRole::Measure,
                    _ => FieldRole::Dimension,
                };
                roles.insert(name.to_string(), role);
            }
        }
        Ok(roles)
    }

    async fn field_statistics(&self, datasource_id: &str, field_caption: &str, role: FieldRole) -> Result<FieldStatistics, BiError> {
        match role {
            FieldRole::Measure => self.measure_statistics(datasource_id, field_caption).await,
            FieldRole::Dimension => self.dimension_statistics(datasource_id, field_caption).await,
        }
    }

    async fn execute_vds(&self, query: &VDSQuery) -> Result<QueryResult, BiError> {
        let url = self.vds_url("query-datasource");
        let request = VdsExecuteRequest::from_query(query);
        let body = serde_json::to_value(&request).map_err(|e| BiError::UpstreamError(e.to_string()))?;

        let response = self.post_json(&url, &body).await?;
        let parsed: VdsQueryResponse =
            response.json().await.map_err(|e| BiError::UpstreamError(format!("query-datasource parse error: {}", e)))?;

        let requested: Vec<String> = query.query.fields.iter().map(|f| f.field_caption.clone()).collect();
        Ok(build_query_result(parsed, &requested))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BiConfig {
        BiConfig {
            server_url: "https://tableau.example.com".to_string(),
            site_name: "default".to_string(),
            auth_mode: "pat".to_string(),
            api_version: "3.21".to_string(),
            request_timeout_secs: 30,
        }
    }

    #[test]
    fn vds_url_joins_server_and_path() {
        let client = TableauVdsClient::new(&test_config(), "alice", TokenCache::new());
        assert_eq!(client.vds_url("read-metadata"), "https://tableau.example.com/api/v1/vizql-data-service/read-metadata");
    }

    #[tokio::test]
    async fn missing_pat_credentials_surfaces_auth_expired() {
        let client = TableauVdsClient::new(&test_config(), "alice", TokenCache::new());
        let err = client.sign_in().await.unwrap_err();
        assert!(matches!(err, BiError::AuthExpired));
    }
}
