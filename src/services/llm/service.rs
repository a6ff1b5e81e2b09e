//! LLM Service Trait and Implementation
//!
//! Defines the generic LLM service interface: provider administration
//! (unchanged from the teacher) plus the chat facade consumed by the VizQL
//! agent graph and the multi-agent orchestrator.

use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

use super::client::LLMClient;
use super::models::*;
use super::repository::LLMRepository;

/// LLM Service - the core abstraction for all LLM operations
#[async_trait]
pub trait LLMService: Send + Sync {
    /// Check if LLM service is available
    fn is_available(&self) -> bool;

    /// Send a chat completion request against the active (or requested)
    /// provider.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, LLMError>;

    /// Stream a chat completion as incremental content deltas.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ChatChunk, LLMError>> + Send>>, LLMError>;

    /// Get all providers
    async fn list_providers(&self) -> Result<Vec<LLMProviderInfo>, LLMError>;

    /// Get provider by ID
    async fn get_provider(&self, id: i64) -> Result<Option<LLMProviderInfo>, LLMError>;

    /// Get active provider
    async fn get_active_provider(&self) -> Result<Option<LLMProviderInfo>, LLMError>;

    /// Create a new provider
    async fn create_provider(&self, req: CreateProviderRequest) -> Result<LLMProvider, LLMError>;

    /// Update a provider
    async fn update_provider(
        &self,
        id: i64,
        req: UpdateProviderRequest,
    ) -> Result<LLMProvider, LLMError>;

    /// Delete a provider
    async fn delete_provider(&self, id: i64) -> Result<(), LLMError>;

    /// Activate a provider
    async fn activate_provider(&self, provider_id: i64) -> Result<(), LLMError>;

    /// Deactivate a provider
    async fn deactivate_provider(&self, provider_id: i64) -> Result<(), LLMError>;

    /// Test connection to a provider
    async fn test_connection(&self, provider_id: i64) -> Result<TestConnectionResponse, LLMError>;
}

// ============================================================================
// LLM Service Implementation
// ============================================================================

/// LLM Service implementation
pub struct LLMServiceImpl {
    repository: LLMRepository,
    client: LLMClient,
    enabled: bool,
}

impl LLMServiceImpl {
    /// Create a new LLM service
    pub fn new(pool: sqlx::SqlitePool, enabled: bool) -> Self {
        Self { repository: LLMRepository::new(pool), client: LLMClient::new(), enabled }
    }

    /// Create with custom client (for testing)
    pub fn with_client(pool: sqlx::SqlitePool, client: LLMClient, enabled: bool) -> Self {
        Self { repository: LLMRepository::new(pool), client, enabled }
    }

    async fn resolve_provider(&self, options: &ChatOptions) -> Result<LLMProvider, LLMError> {
        if let Some(name) = &options.provider {
            return self
                .repository
                .get_provider_by_name(name)
                .await?
                .ok_or_else(|| LLMError::ProviderNotFound(name.clone()));
        }
        self.repository.get_active_provider().await?.ok_or(LLMError::NoProviderConfigured)
    }
}

#[async_trait]
impl LLMService for LLMServiceImpl {
    fn is_available(&self) -> bool {
        self.enabled
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, LLMError> {
        if !self.enabled {
            return Err(LLMError::Disabled);
        }
        let provider = self.resolve_provider(options).await?;
        self.client.chat(&provider, messages, options).await
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<ChatChunk, LLMError>> + Send>>, LLMError> {
        if !self.enabled {
            return Err(LLMError::Disabled);
        }
        let provider = self.resolve_provider(options).await?;
        self.client.stream_chat(&provider, messages, options).await
    }

    async fn list_providers(&self) -> Result<Vec<LLMProviderInfo>, LLMError> {
        let providers = self.repository.list_providers().await?;
        Ok(providers.iter().map(LLMProviderInfo::from).collect())
    }

    async fn get_provider(&self, id: i64) -> Result<Option<LLMProviderInfo>, LLMError> {
        let provider = self.repository.get_provider(id).await?;
        Ok(provider.map(|p| LLMProviderInfo::from(&p)))
    }

    async fn get_active_provider(&self) -> Result<Option<LLMProviderInfo>, LLMError> {
        let provider = self.repository.get_active_provider().await?;
        Ok(provider.map(|p| LLMProviderInfo::from(&p)))
    }

    async fn create_provider(&self, req: CreateProviderRequest) -> Result<LLMProvider, LLMError> {
        self.repository.create_provider(req).await
    }

    async fn update_provider(
        &self,
        id: i64,
        req: UpdateProviderRequest,
    ) -> Result<LLMProvider, LLMError> {
        self.repository.update_provider(id, req).await
    }

    async fn delete_provider(&self, id: i64) -> Result<(), LLMError> {
        self.repository.delete_provider(id).await
    }

    async fn activate_provider(&self, provider_id: i64) -> Result<(), LLMError> {
        self.repository.activate_provider(provider_id).await
    }

    async fn deactivate_provider(&self, provider_id: i64) -> Result<(), LLMError> {
        self.repository.deactivate_provider(provider_id).await
    }

    async fn test_connection(&self, provider_id: i64) -> Result<TestConnectionResponse, LLMError> {
        let provider = self
            .repository
            .get_provider(provider_id)
            .await?
            .ok_or_else(|| LLMError::ProviderNotFound(provider_id.to_string()))?;

        let start = std::time::Instant::now();
        let test_result = self.client.test_connection(&provider).await;
        let latency_ms = start.elapsed().as_millis() as i64;

        match test_result {
            Ok(_) => Ok(TestConnectionResponse {
                success: true,
                message: "Connection successful".to_string(),
                latency_ms: Some(latency_ms),
            }),
            Err(e) => Ok(TestConnectionResponse {
                success: false,
                message: format!("Connection failed: {}", e),
                latency_ms: Some(latency_ms),
            }),
        }
    }
}

// Note: Arc<T> automatically implements LLMService through async_trait delegation
// when T: LLMService, so we don't need to manually implement it.
