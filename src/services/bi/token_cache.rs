//! Per-`(user, server_config)` BI auth token cache (spec.md §3 lifecycles).
//!
//! Mirrors the teacher's `MySQLPoolManager` - a `DashMap` keyed cache behind
//! a cheap `Clone` handle, lock-free on the read path. Tokens refresh
//! transparently except for PAT/password sessions, which surface
//! `BiError::AuthExpired` instead of silently re-authenticating.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::AuthMode;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct TokenCache {
    tokens: Arc<DashMap<(String, String), CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self { tokens: Arc::new(DashMap::new()) }
    }

    /// Returns a cached, non-expired token if one exists.
    pub fn get(&self, user: &str, server_config: &str) -> Option<String> {
        let key = (user.to_string(), server_config.to_string());
        let entry = self.tokens.get(&key)?;
        if entry.expires_at > Instant::now() { Some(entry.token.clone()) } else { None }
    }

    pub fn put(&self, user: &str, server_config: &str, token: String, ttl: Duration) {
        let key = (user.to_string(), server_config.to_string());
        self.tokens.insert(key, CachedToken { token, expires_at: Instant::now() + ttl });
    }

    pub fn invalidate(&self, user: &str, server_config: &str) {
        self.tokens.remove(&(user.to_string(), server_config.to_string()));
    }

    /// PAT/password sessions never get an implicit refresh - callers must
    /// re-authenticate out of band (spec.md §4.1). Connected-app (JWT)
    /// sessions are eligible for transparent refresh.
    pub fn can_refresh(&self, mode: AuthMode) -> bool {
        !mode.requires_manual_reauth()
    }

    /// Drops expired tokens so the map does not grow unbounded. Run
    /// periodically from a background task.
    pub fn sweep_expired(&self) -> usize {
        let before = self.tokens.len();
        let now = Instant::now();
        self.tokens.retain(|_, cached| cached.expires_at > now);
        before - self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_token_is_not_returned() {
        let cache = TokenCache::new();
        cache.put("alice", "prod", "tok".to_string(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("alice", "prod").is_none());
    }

    #[test]
    fn fresh_token_round_trips() {
        let cache = TokenCache::new();
        cache.put("alice", "prod", "tok".to_string(), Duration::from_secs(60));
        assert_eq!(cache.get("alice", "prod").as_deref(), Some("tok"));
    }

    #[test]
    fn pat_mode_cannot_refresh() {
        let cache = TokenCache::new();
        assert!(!cache.can_refresh(AuthMode::Pat));
        assert!(!cache.can_refresh(AuthMode::Password));
        assert!(cache.can_refresh(AuthMode::ConnectedApp));
    }

    #[test]
    fn sweep_removes_only_expired_tokens() {
        let cache = TokenCache::new();
        cache.put("alice", "prod", "stale".to_string(), Duration::from_millis(0));
        cache.put("bob", "prod", "fresh".to_string(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.get("bob", "prod").is_some());
    }
}
