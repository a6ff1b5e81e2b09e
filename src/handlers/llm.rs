//! LLM API Handlers
//!
//! REST API endpoints for LLM provider administration and service status.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::AppState;
use crate::services::llm::{CreateProviderRequest, LLMError, LLMProviderInfo, LLMService, UpdateProviderRequest};
use crate::utils::ApiResult;

// ============================================================================
// Provider Management APIs
// ============================================================================

/// List all LLM providers
#[utoipa::path(get, path = "/api/llm/providers", responses((status = 200, body = [LLMProviderInfo])), tag = "LLM")]
pub async fn list_providers(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let providers = state.llm_service.list_providers().await?;
    Ok(Json(providers))
}

/// Get provider by ID
#[utoipa::path(get, path = "/api/llm/providers/{id}", params(("id" = i64, Path)), responses((status = 200, body = LLMProviderInfo)), tag = "LLM")]
pub async fn get_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let provider = state
        .llm_service
        .get_provider(id)
        .await?
        .ok_or(LLMError::ProviderNotFound(id.to_string()))?;
    Ok(Json(provider))
}

/// Get active provider
#[utoipa::path(get, path = "/api/llm/providers/active", responses((status = 200, body = Option<LLMProviderInfo>)), tag = "LLM")]
pub async fn get_active_provider(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let provider = state.llm_service.get_active_provider().await?;
    Ok(Json(provider))
}

/// Create a new provider
#[utoipa::path(post, path = "/api/llm/providers", request_body = CreateProviderRequest, responses((status = 201, body = LLMProviderInfo)), tag = "LLM")]
pub async fn create_provider(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProviderRequest>,
) -> ApiResult<impl IntoResponse> {
    let provider = state.llm_service.create_provider(req).await?;
    Ok((StatusCode::CREATED, Json(LLMProviderInfo::from(&provider))))
}

/// Update a provider
#[utoipa::path(put, path = "/api/llm/providers/{id}", params(("id" = i64, Path)), request_body = UpdateProviderRequest, responses((status = 200, body = LLMProviderInfo)), tag = "LLM")]
pub async fn update_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProviderRequest>,
) -> ApiResult<impl IntoResponse> {
    let provider = state.llm_service.update_provider(id, req).await?;
    Ok(Json(LLMProviderInfo::from(&provider)))
}

/// Delete a provider
#[utoipa::path(delete, path = "/api/llm/providers/{id}", params(("id" = i64, Path)), responses((status = 204)), tag = "LLM")]
pub async fn delete_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.llm_service.delete_provider(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Activate a provider
#[utoipa::path(post, path = "/api/llm/providers/{id}/activate", params(("id" = i64, Path)), responses((status = 200, body = LLMProviderInfo)), tag = "LLM")]
pub async fn activate_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.llm_service.activate_provider(id).await?;
    let provider = state
        .llm_service
        .get_provider(id)
        .await?
        .ok_or(LLMError::ProviderNotFound(id.to_string()))?;
    Ok(Json(provider))
}

/// Deactivate a provider
#[utoipa::path(post, path = "/api/llm/providers/{id}/deactivate", params(("id" = i64, Path)), responses((status = 200, body = LLMProviderInfo)), tag = "LLM")]
pub async fn deactivate_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.llm_service.deactivate_provider(id).await?;
    let provider = state
        .llm_service
        .get_provider(id)
        .await?
        .ok_or(LLMError::ProviderNotFound(id.to_string()))?;
    Ok(Json(provider))
}

/// Test connection to a provider
#[utoipa::path(post, path = "/api/llm/providers/{id}/test", params(("id" = i64, Path)), responses((status = 200, body = crate::services::llm::TestConnectionResponse)), tag = "LLM")]
pub async fn test_provider_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let result = state.llm_service.test_connection(id).await?;
    Ok(Json(result))
}

// ============================================================================
// Status API
// ============================================================================

/// Get LLM service status
#[utoipa::path(get, path = "/api/llm/status", responses((status = 200, body = LLMStatusResponse)), tag = "LLM")]
pub async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let providers = state.llm_service.list_providers().await?;
    let active_provider = providers.iter().find(|p| p.is_active);

    Ok(Json(LLMStatusResponse {
        enabled: state.llm_service.is_available(),
        active_provider: active_provider.cloned(),
        provider_count: providers.len(),
    }))
}

#[derive(Serialize, ToSchema)]
pub struct LLMStatusResponse {
    pub enabled: bool,
    pub active_provider: Option<LLMProviderInfo>,
    pub provider_count: usize,
}
