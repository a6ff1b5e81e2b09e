//! Top-level API error wrapper, following the same pattern as
//! `handlers::llm::LLMApiError`: one `IntoResponse` impl per subsystem error
//! enum, mapped to a JSON `{error, code}` body.

use axum::{Json, http::StatusCode, response::IntoResponse};

use crate::services::bi::BiError;
use crate::services::llm::LLMError;
use crate::services::orchestrator::OrchestratorError;
use crate::services::vizql::GraphError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Umbrella error for HTTP handlers that touch more than one subsystem.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Llm(#[from] LLMError),
    #[error(transparent)]
    Bi(#[from] BiError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("{0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ApiError::Llm(e) => llm_status(e),
            ApiError::Bi(e) => bi_status(e),
            ApiError::Graph(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ApiError::Orchestrator(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Internal(e) => {
                tracing::error!("internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            },
        };

        let body = Json(serde_json::json!({
            "error": message,
            "code": status.as_u16(),
        }));

        let mut response = (status, body).into_response();
        if matches!(&self, ApiError::Bi(BiError::AuthExpired)) {
            response
                .headers_mut()
                .insert("X-Error-Code", axum::http::HeaderValue::from_static("TABLEAU_NOT_CONNECTED"));
        }
        response
    }
}

fn llm_status(e: &LLMError) -> (StatusCode, String) {
    match e {
        LLMError::NoProviderConfigured => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        LLMError::ProviderNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        LLMError::Disabled => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        LLMError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, e.to_string()),
        LLMError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, e.to_string()),
        LLMError::ApiError(_) => (StatusCode::BAD_GATEWAY, e.to_string()),
        LLMError::ParseError(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        LLMError::DatabaseError(err) => {
            tracing::error!("llm database error: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("database error: {}", err))
        },
        LLMError::SerializationError(err) => {
            tracing::error!("llm serialization error: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("serialization error: {}", err))
        },
    }
}

fn bi_status(e: &BiError) -> (StatusCode, String) {
    match e {
        BiError::AuthExpired => (StatusCode::UNAUTHORIZED, e.to_string()),
        BiError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        BiError::Transport(_) => (StatusCode::BAD_GATEWAY, e.to_string()),
        BiError::UpstreamError(_) => (StatusCode::BAD_GATEWAY, e.to_string()),
    }
}
