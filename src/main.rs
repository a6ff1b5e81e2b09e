use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use vizql_runtime::utils::{ScheduledExecutor, ScheduledTask};
use vizql_runtime::{
    db, handlers, AppState, Config, FingerprintCache, LLMService, LLMServiceImpl, Orchestrator, SchemaEnricher,
    SharedBiClient, TableauVdsClient, TokenCache,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::chat::send_message,
        handlers::llm::list_providers,
        handlers::llm::get_provider,
        handlers::llm::get_active_provider,
        handlers::llm::create_provider,
        handlers::llm::update_provider,
        handlers::llm::delete_provider,
        handlers::llm::activate_provider,
        handlers::llm::deactivate_provider,
        handlers::llm::test_provider_connection,
        handlers::llm::get_status,
    ),
    components(schemas(
        handlers::chat::EmbeddedState,
        handlers::chat::ChatMessageRequest,
        handlers::chat::ChatMessageResponse,
        handlers::chat::ResponseMetadata,
        vizql_runtime::services::llm::LLMProviderInfo,
        vizql_runtime::services::llm::CreateProviderRequest,
        vizql_runtime::services::llm::UpdateProviderRequest,
        vizql_runtime::services::llm::TestConnectionResponse,
        handlers::llm::LLMStatusResponse,
        vizql_runtime::models::vizql::VDSQuery,
        vizql_runtime::models::vizql::VDSQueryBody,
        vizql_runtime::models::vizql::VDSDatasource,
        vizql_runtime::models::vizql::VDSField,
        vizql_runtime::models::vizql::VDSFilter,
        vizql_runtime::models::vizql::VDSOptions,
        vizql_runtime::models::vizql::ReturnFormat,
        vizql_runtime::models::vizql::TopDirection,
        vizql_runtime::models::vizql::QueryResult,
    )),
    tags(
        (name = "Chat", description = "VizQL agent graph / multi-agent orchestrator entry point"),
        (name = "LLM", description = "LLM provider administration and service status"),
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("vizql-agent-runtime.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        // Leaking the guard is deliberate: it must outlive the process, and
        // the process only ever exits by being killed.
        Box::leak(Box::new(_guard));
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("vizql-agent-runtime starting up");

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("database pool created");

    let token_cache = TokenCache::new();
    let bi_user = std::env::var("BI_USER").unwrap_or_else(|_| "vizql-agent-runtime".to_string());
    let mut bi_client_builder = TableauVdsClient::new(&config.bi, bi_user, token_cache.clone());
    if let (Ok(name), Ok(secret)) = (std::env::var("TABLEAU_PAT_NAME"), std::env::var("TABLEAU_PAT_SECRET")) {
        bi_client_builder = bi_client_builder.with_pat_credentials(name, secret);
    } else {
        tracing::warn!("TABLEAU_PAT_NAME/TABLEAU_PAT_SECRET not set; BI requests will fail auth until configured");
    }
    let bi_client: SharedBiClient = Arc::new(bi_client_builder);

    let schema_enricher = Arc::new(SchemaEnricher::new(bi_client.clone(), &config.cache));

    let llm_service = Arc::new(LLMServiceImpl::new(pool.clone(), config.llm.enabled));
    tracing::info!("LLM service initialized (enabled={})", config.llm.enabled);

    let fingerprint_cache = FingerprintCache::new(Duration::from_secs(config.cache.fingerprint_ttl_secs));

    let orchestrator = Arc::new(Orchestrator::new(
        bi_client.clone(),
        llm_service.clone() as Arc<dyn LLMService>,
        schema_enricher.clone(),
        fingerprint_cache.clone(),
        config.graph.clone(),
    ));

    let app_state = Arc::new(AppState {
        db: pool.clone(),
        config: Arc::new(config.clone()),
        llm_service: llm_service.clone(),
        bi_client: bi_client.clone(),
        schema_enricher: schema_enricher.clone(),
        orchestrator: orchestrator.clone(),
        fingerprint_cache: fingerprint_cache.clone(),
    });

    let sweep_task = Arc::new(CacheSweepTask { fingerprint_cache: fingerprint_cache.clone(), token_cache: token_cache.clone() });
    let sweep_executor = ScheduledExecutor::new("cache-sweep", Duration::from_secs(60));
    tokio::spawn(async move {
        sweep_executor.start(sweep_task).await;
    });

    let app = Router::new()
        .route("/chat/message", post(handlers::chat::send_message))
        .route("/api/llm/status", get(handlers::llm::get_status))
        .route("/api/llm/providers", get(handlers::llm::list_providers).post(handlers::llm::create_provider))
        .route("/api/llm/providers/active", get(handlers::llm::get_active_provider))
        .route(
            "/api/llm/providers/:id",
            get(handlers::llm::get_provider).put(handlers::llm::update_provider).delete(handlers::llm::delete_provider),
        )
        .route("/api/llm/providers/:id/activate", post(handlers::llm::activate_provider))
        .route("/api/llm/providers/:id/deactivate", post(handlers::llm::deactivate_provider))
        .route("/api/llm/providers/:id/test", post(handlers::llm::test_provider_connection))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(app_state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("server listening on http://{}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}

/// Periodically drops expired fingerprint-cache and BI-token entries so
/// neither `DashMap` grows unbounded across the process lifetime.
struct CacheSweepTask {
    fingerprint_cache: FingerprintCache,
    token_cache: TokenCache,
}

impl ScheduledTask for CacheSweepTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            let fingerprints = self.fingerprint_cache.sweep_expired();
            let tokens = self.token_cache.sweep_expired();
            if fingerprints > 0 || tokens > 0 {
                tracing::debug!("cache sweep: {} fingerprint entries, {} tokens expired", fingerprints, tokens);
            }
            Ok(())
        })
    }
}
