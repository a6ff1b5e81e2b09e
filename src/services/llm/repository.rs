//! LLM Repository - Database operations for LLM service

use sqlx::sqlite::SqliteArguments;
use sqlx::{Arguments, SqlitePool};

use super::UpdateProviderRequest;
use super::models::*;

/// Repository for LLM provider persistence.
pub struct LLMRepository {
    pool: SqlitePool,
}

impl LLMRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get reference to pool (for testing)
    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get the currently active provider
    pub async fn get_active_provider(&self) -> Result<Option<LLMProvider>, LLMError> {
        sqlx::query_as::<_, LLMProvider>(
            r#"SELECT * FROM llm_providers
               WHERE is_active = TRUE AND enabled = TRUE
               LIMIT 1"#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(LLMError::from)
    }

    /// Get provider by configured name (used when a request pins a provider)
    pub async fn get_provider_by_name(&self, name: &str) -> Result<Option<LLMProvider>, LLMError> {
        sqlx::query_as::<_, LLMProvider>("SELECT * FROM llm_providers WHERE name = ? AND enabled = TRUE")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(LLMError::from)
    }

    /// List all providers
    pub async fn list_providers(&self) -> Result<Vec<LLMProvider>, LLMError> {
        sqlx::query_as::<_, LLMProvider>(
            "SELECT * FROM llm_providers ORDER BY priority ASC, name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(LLMError::from)
    }

    /// Activate a provider (deactivates all others)
    pub async fn activate_provider(&self, provider_id: i64) -> Result<(), LLMError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE llm_providers SET is_active = FALSE")
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            "UPDATE llm_providers SET is_active = TRUE WHERE id = ? AND enabled = TRUE",
        )
        .bind(provider_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LLMError::ProviderNotFound(provider_id.to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Get provider by ID
    pub async fn get_provider(&self, id: i64) -> Result<Option<LLMProvider>, LLMError> {
        sqlx::query_as::<_, LLMProvider>("SELECT * FROM llm_providers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(LLMError::from)
    }

    /// Create a new provider
    pub async fn create_provider(
        &self,
        req: CreateProviderRequest,
    ) -> Result<LLMProvider, LLMError> {
        let api_key_encrypted = Some(req.api_key);

        let result = sqlx::query(
            r#"INSERT INTO llm_providers
               (name, display_name, api_base, model_name, api_key_encrypted,
                max_tokens, temperature, timeout_seconds, enabled, is_active, priority)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, TRUE, FALSE, ?)"#,
        )
        .bind(&req.name)
        .bind(&req.display_name)
        .bind(&req.api_base)
        .bind(&req.model_name)
        .bind(&api_key_encrypted)
        .bind(req.max_tokens)
        .bind(req.temperature)
        .bind(req.timeout_seconds)
        .bind(req.priority)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();

        sqlx::query_as::<_, LLMProvider>("SELECT * FROM llm_providers WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(LLMError::from)
    }

    /// Update provider
    pub async fn update_provider(
        &self,
        id: i64,
        req: UpdateProviderRequest,
    ) -> Result<LLMProvider, LLMError> {
        let mut sql = String::from("UPDATE llm_providers SET updated_at = CURRENT_TIMESTAMP");
        let mut args = SqliteArguments::default();

        if let Some(v) = &req.display_name {
            sql.push_str(", display_name = ?");
            args.add(v);
        }
        if let Some(v) = &req.api_base {
            sql.push_str(", api_base = ?");
            args.add(v);
        }
        if let Some(v) = &req.model_name {
            sql.push_str(", model_name = ?");
            args.add(v);
        }
        if let Some(v) = &req.api_key {
            sql.push_str(", api_key_encrypted = ?");
            args.add(v);
        }
        if let Some(v) = &req.max_tokens {
            sql.push_str(", max_tokens = ?");
            args.add(v);
        }
        if let Some(v) = &req.temperature {
            sql.push_str(", temperature = ?");
            args.add(v);
        }
        if let Some(v) = &req.timeout_seconds {
            sql.push_str(", timeout_seconds = ?");
            args.add(v);
        }
        if let Some(v) = &req.priority {
            sql.push_str(", priority = ?");
            args.add(v);
        }
        if let Some(v) = &req.enabled {
            sql.push_str(", enabled = ?");
            args.add(v);
        }

        sql.push_str(" WHERE id = ?");
        args.add(id);

        let result = sqlx::query_with(&sql, args).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(LLMError::ProviderNotFound(id.to_string()));
        }

        sqlx::query_as::<_, LLMProvider>("SELECT * FROM llm_providers WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(LLMError::from)
    }

    /// Delete provider
    pub async fn delete_provider(&self, id: i64) -> Result<(), LLMError> {
        let provider = self.get_provider(id).await?;
        match provider {
            None => return Err(LLMError::ProviderNotFound(id.to_string())),
            Some(p) if p.is_active => {
                return Err(LLMError::ApiError(
                    "Cannot delete active provider. Deactivate it first.".to_string(),
                ));
            },
            _ => {},
        }

        let result = sqlx::query("DELETE FROM llm_providers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LLMError::ProviderNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Deactivate a provider
    pub async fn deactivate_provider(&self, id: i64) -> Result<(), LLMError> {
        let result = sqlx::query("UPDATE llm_providers SET is_active = FALSE WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LLMError::ProviderNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Set provider enabled status
    pub async fn set_provider_enabled(
        &self,
        id: i64,
        enabled: bool,
    ) -> Result<LLMProvider, LLMError> {
        let result = sqlx::query(
            "UPDATE llm_providers SET enabled = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(enabled)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LLMError::ProviderNotFound(id.to_string()));
        }

        if !enabled {
            sqlx::query("UPDATE llm_providers SET is_active = FALSE WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        sqlx::query_as::<_, LLMProvider>("SELECT * FROM llm_providers WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(LLMError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

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
    async fn creates_and_fetches_provider() {
        let pool = setup_test_db().await;
        let repo = LLMRepository::new(pool);

        let created = repo.create_provider(sample_request("openai")).await.unwrap();
        assert_eq!(created.name, "openai");
        assert!(!created.is_active);

        let fetched = repo.get_provider(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
    }

    #[tokio::test]
    async fn activating_deactivates_others() {
        let pool = setup_test_db().await;
        let repo = LLMRepository::new(pool);

        let a = repo.create_provider(sample_request("a")).await.unwrap();
        let b = repo.create_provider(sample_request("b")).await.unwrap();

        repo.activate_provider(a.id).await.unwrap();
        repo.activate_provider(b.id).await.unwrap();

        let active = repo.get_active_provider().await.unwrap().unwrap();
        assert_eq!(active.id, b.id);
    }

    #[tokio::test]
    async fn cannot_delete_active_provider() {
        let pool = setup_test_db().await;
        let repo = LLMRepository::new(pool);

        let provider = repo.create_provider(sample_request("openai")).await.unwrap();
        repo.activate_provider(provider.id).await.unwrap();

        let err = repo.delete_provider(provider.id).await.unwrap_err();
        assert!(matches!(err, LLMError::ApiError(_)));
    }

    #[tokio::test]
    async fn disabling_clears_active_flag() {
        let pool = setup_test_db().await;
        let repo = LLMRepository::new(pool);

        let provider = repo.create_provider(sample_request("openai")).await.unwrap();
        repo.activate_provider(provider.id).await.unwrap();

        let updated = repo.set_provider_enabled(provider.id, false).await.unwrap();
        assert!(!updated.enabled);
        assert!(!updated.is_active);
    }

    #[tokio::test]
    async fn lookup_by_name_respects_enabled_flag() {
        let pool = setup_test_db().await;
        let repo = LLMRepository::new(pool);

        let provider = repo.create_provider(sample_request("openai")).await.unwrap();
        repo.set_provider_enabled(provider.id, false).await.unwrap();

        assert!(repo.get_provider_by_name("openai").await.unwrap().is_none());
    }
}
