//! LLM Data Models
//!
//! Core data structures for LLM service: providers (persisted, same shape
//! the teacher used) and the generic chat facade (§4.2) consumed by the
//! VizQL agent graph and the multi-agent orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

// ============================================================================
// LLM Provider
// ============================================================================

/// LLM Provider configuration from database
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LLMProvider {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub api_base: String,
    pub model_name: String,
    #[serde(skip_serializing)]
    pub api_key_encrypted: Option<String>,
    pub is_active: bool,
    pub max_tokens: i32,
    pub temperature: f64,
    pub timeout_seconds: i32,
    pub enabled: bool,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Provider info for external display (without sensitive data)
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LLMProviderInfo {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub api_base: String,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_masked: Option<String>,
    pub is_active: bool,
    pub enabled: bool,
    pub max_tokens: i32,
    pub temperature: f64,
    pub timeout_seconds: i32,
    pub priority: i32,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl From<&LLMProvider> for LLMProviderInfo {
    fn from(p: &LLMProvider) -> Self {
        let api_key_masked = p.api_key_encrypted.as_ref().map(|key| {
            if key.len() > 8 {
                format!("{}...{}", &key[..4], &key[key.len() - 4..])
            } else {
                "****".to_string()
            }
        });

        Self {
            id: p.id,
            name: p.name.clone(),
            display_name: p.display_name.clone(),
            api_base: p.api_base.clone(),
            model_name: p.model_name.clone(),
            api_key_masked,
            is_active: p.is_active,
            enabled: p.enabled,
            max_tokens: p.max_tokens,
            temperature: p.temperature,
            timeout_seconds: p.timeout_seconds,
            priority: p.priority,
            created_at: p.created_at.to_rfc3339(),
            updated_at: Some(p.updated_at.to_rfc3339()),
        }
    }
}

/// Request to create a provider
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateProviderRequest {
    pub name: String,
    pub display_name: String,
    pub api_base: String,
    pub model_name: String,
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i32,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

/// Request to update a provider
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct UpdateProviderRequest {
    pub display_name: Option<String>,
    pub api_base: Option<String>,
    pub model_name: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: Option<i32>,
    pub temperature: Option<f64>,
    pub timeout_seconds: Option<i32>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
}

/// Response for test connection
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TestConnectionResponse {
    pub success: bool,
    pub message: String,
    pub latency_ms: Option<i64>,
}

fn default_max_tokens() -> i32 {
    4096
}
fn default_temperature() -> f64 {
    0.3
}
fn default_timeout() -> i32 {
    60
}
fn default_priority() -> i32 {
    100
}

// ============================================================================
// Chat facade (generic; used by both the VizQL graph and the orchestrator)
// ============================================================================

/// A single turn in a chat-completion exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Per-call overrides. `None` fields fall back to the active provider's
/// stored defaults (`model_name`, `temperature`, `max_tokens`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i32>,
    /// Ask the provider to constrain output to valid JSON.
    #[serde(default)]
    pub json_mode: bool,
}

/// A tool/function invocation the model asked the caller to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Streaming delta of a function call under construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    pub name: Option<String>,
    pub arguments_delta: Option<String>,
}

/// Full, non-streaming chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub content: String,
    pub tokens_used: i32,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub finish_reason: Option<String>,
    pub function_call: Option<FunctionCall>,
}

/// One increment of a streamed chat completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    pub content_delta: String,
    pub finish_reason: Option<String>,
    pub function_call_delta: Option<FunctionCallDelta>,
}

// ============================================================================
// LLM Error Types
// ============================================================================

/// LLM service errors
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("No active LLM provider configured")]
    NoProviderConfigured,

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM response parsing error: {0}")]
    ParseError(String),

    #[error("LLM timeout after {0}s")]
    Timeout(u64),

    #[error("LLM rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("LLM service disabled")]
    Disabled,
}

impl LLMError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::ApiError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_short_api_keys() {
        let provider = LLMProvider {
            id: 1,
            name: "openai".into(),
            display_name: "OpenAI".into(),
            api_base: "https://api.openai.com/v1".into(),
            model_name: "gpt-4o-mini".into(),
            api_key_encrypted: Some("short".into()),
            is_active: true,
            max_tokens: 4096,
            temperature: 0.3,
            timeout_seconds: 60,
            enabled: true,
            priority: 100,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let info = LLMProviderInfo::from(&provider);
        assert_eq!(info.api_key_masked.as_deref(), Some("****"));
    }

    #[test]
    fn masks_long_api_keys() {
        let provider = LLMProvider {
            id: 1,
            name: "openai".into(),
            display_name: "OpenAI".into(),
            api_base: "https://api.openai.com/v1".into(),
            model_name: "gpt-4o-mini".into(),
            api_key_encrypted: Some("sk-abcdefghijklmnop".into()),
            is_active: true,
            max_tokens: 4096,
            temperature: 0.3,
            timeout_seconds: 60,
            enabled: true,
            priority: 100,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let info = LLMProviderInfo::from(&provider);
        assert_eq!(info.api_key_masked.as_deref(), Some("sk-a...mnop"));
    }

    #[test]
    fn retryable_errors() {
        assert!(LLMError::Timeout(5).is_retryable());
        assert!(LLMError::RateLimited(5).is_retryable());
        assert!(LLMError::ApiError("boom".into()).is_retryable());
        assert!(!LLMError::NoProviderConfigured.is_retryable());
        assert!(!LLMError::Disabled.is_retryable());
    }
}
