//! Chat API Handler
//!
//! The HTTP surface's single touchpoint into the VizQL agent graph /
//! multi-agent orchestrator (spec.md §6): `POST /chat/message`. Prior-turn
//! persistence is an external collaborator - this handler only consumes
//! the `embedded_state` the caller supplies, never fetches it itself.

use std::sync::Arc;

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::vizql::{ConversationMessage, QueryResult, VDSQuery, VizQLGraphState};
use crate::services::streaming;
use crate::services::vizql::RunContext;
use crate::utils::ApiResult;
use crate::AppState;

/// Prior-turn context the caller (an external conversation service) has
/// already fetched; this handler never reaches out for it itself.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct EmbeddedState {
    #[serde(default)]
    pub context_datasources: Vec<String>,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatMessageRequest {
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub embedded_state: Option<EmbeddedState>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatMessageResponse {
    pub conversation_id: String,
    pub role: &'static str,
    pub content: String,
    pub extra_metadata: ResponseMetadata,
}

#[derive(Debug, Serialize, Default, ToSchema)]
pub struct ResponseMetadata {
    pub vizql_query: Option<VDSQuery>,
    pub query_results: Option<QueryResult>,
    pub agent_type: Option<String>,
}

/// `POST /chat/message` (spec.md §6). `model`/`provider` are accepted for
/// forward compatibility with per-turn provider overrides but are not yet
/// threaded into the graph - the active LLM provider is used.
///
/// Streaming responses always drive a single VizQL graph run directly, so
/// per-node reasoning chunks have unambiguous node names (spec.md §4.13);
/// the multi-agent orchestrator, whose steps are themselves sub-runs of
/// this same graph, is only reachable from the non-streaming path.
#[utoipa::path(
    post,
    path = "/chat/message",
    request_body = ChatMessageRequest,
    responses(
        (status = 200, description = "Assistant turn (JSON) or text/event-stream when `stream` is true", body = ChatMessageResponse),
    ),
    tag = "Chat"
)]
pub async fn send_message(State(state): State<Arc<AppState>>, Json(req): Json<ChatMessageRequest>) -> ApiResult<axum::response::Response> {
    let conversation_id = req.conversation_id;
    let embedded = req.embedded_state.unwrap_or_default();
    let initial = VizQLGraphState::new(req.content.clone(), embedded.context_datasources.clone(), embedded.messages.clone());

    if req.stream {
        Ok(stream_response(state, initial).await.into_response())
    } else {
        Ok(blocking_response(state, req, embedded, conversation_id).await?.into_response())
    }
}

async fn stream_response(state: Arc<AppState>, initial: VizQLGraphState) -> impl IntoResponse {
    let ctx = run_context(&state);
    let events = streaming::stream_turn(initial, ctx).map(|(event, data)| Ok::<_, std::convert::Infallible>(Event::default().event(event).json_data(data).unwrap_or_else(|_| Event::default())));

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Non-streaming turns go through the orchestrator so multi-datasource or
/// multi-step questions get fanned out (spec.md §4.12); the final answer
/// is all the blocking envelope needs, so per-step reasoning is discarded.
async fn blocking_response(
    state: Arc<AppState>,
    req: ChatMessageRequest,
    embedded: EmbeddedState,
    conversation_id: String,
) -> ApiResult<Json<ChatMessageResponse>> {
    let outcome = state
        .orchestrator
        .run_turn(&req.content, embedded.context_datasources, embedded.messages)
        .await?;

    Ok(Json(ChatMessageResponse {
        conversation_id,
        role: "assistant",
        content: outcome.answer,
        extra_metadata: ResponseMetadata {
            vizql_query: outcome.vizql_query,
            query_results: outcome.query_results,
            agent_type: req.agent_type,
        },
    }))
}

fn run_context(state: &AppState) -> RunContext {
    RunContext::new(
        state.bi_client.clone(),
        Arc::<crate::services::llm::LLMServiceImpl>::clone(&state.llm_service) as _,
        state.schema_enricher.clone(),
        state.fingerprint_cache.clone(),
        state.config.graph.clone(),
    )
}
