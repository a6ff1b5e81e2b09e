//! Service-level tests that exercise `LLMServiceImpl` without reaching the
//! network. Wire-level behavior (backoff, SSE framing) is covered in
//! `client.rs`; provider persistence is covered in `repository.rs`.

use sqlx::SqlitePool;

use super::models::*;
use super::service::{LLMService, LLMServiceImpl};

async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn sample_request(name: &str) -> CreateProviderRequest {
    CreateProviderRequest {
        name: name.to_string(),
        display_name: "Test Provider".to_string(),
        api_base: "https://api.openai.com/v1".to_string(),
        model_name: "gpt-4o-mini".to_string(),
        api_key: "sk-test".to_string(),
        max_tokens: 4096,
        temperature: 0.3,
        timeout_seconds: 60,
        priority: 100,
    }
}

#[tokio::test]
async fn disabled_service_rejects_chat() {
    let pool = setup_test_db().await;
    let service = LLMServiceImpl::new(pool, false);

    assert!(!service.is_available());
    let err = service.chat(&[ChatMessage::user("hi")], &ChatOptions::default()).await.unwrap_err();
    assert!(matches!(err, LLMError::Disabled));
}

#[tokio::test]
async fn chat_without_active_provider_fails() {
    let pool = setup_test_db().await;
    let service = LLMServiceImpl::new(pool, true);

    let err = service.chat(&[ChatMessage::user("hi")], &ChatOptions::default()).await.unwrap_err();
    assert!(matches!(err, LLMError::NoProviderConfigured));
}

#[tokio::test]
async fn chat_with_unknown_pinned_provider_fails() {
    let pool = setup_test_db().await;
    let service = LLMServiceImpl::new(pool, true);

    let options = ChatOptions { provider: Some("nonexistent".to_string()), ..Default::default() };
    let err = service.chat(&[ChatMessage::user("hi")], &options).await.unwrap_err();
    assert!(matches!(err, LLMError::ProviderNotFound(_)));
}

#[tokio::test]
async fn provider_crud_round_trips_through_service() {
    let pool = setup_test_db().await;
    let service = LLMServiceImpl::new(pool, true);

    let created = service.create_provider(sample_request("openai")).await.unwrap();
    assert!(service.get_provider(created.id).await.unwrap().is_some());

    service.activate_provider(created.id).await.unwrap();
    let active = service.get_active_provider().await.unwrap().unwrap();
    assert_eq!(active.id, created.id);

    let providers = service.list_providers().await.unwrap();
    assert_eq!(providers.len(), 1);

    service.deactivate_provider(created.id).await.unwrap();
    assert!(service.get_active_provider().await.unwrap().is_none());
}

#[tokio::test]
async fn update_provider_changes_fields() {
    let pool = setup_test_db().await;
    let service = LLMServiceImpl::new(pool, true);

    let created = service.create_provider(sample_request("openai")).await.unwrap();
    let update = UpdateProviderRequest {
        display_name: Some("Renamed".to_string()),
        api_base: None,
        model_name: None,
        api_key: None,
        max_tokens: None,
        temperature: None,
        timeout_seconds: None,
        priority: None,
        enabled: None,
    };
    let updated = service.update_provider(created.id, update).await.unwrap();
    assert_eq!(updated.display_name, "Renamed");
}

#[test]
fn chat_message_constructors_set_role() {
    assert_eq!(ChatMessage::system("s").role, "system");
    assert_eq!(ChatMessage::user("u").role, "user");
    assert_eq!(ChatMessage::assistant("a").role, "assistant");
}
