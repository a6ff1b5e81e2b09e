//! Process-wide VDS query-result cache, keyed by a canonicalized-JSON
//! fingerprint (spec.md §4.8, §5, §9). Entries are only populated after a
//! *complete* successful execution, so cancellation can never pollute the
//! cache.
//!
//! Concurrent identical queries share one execution via an atomic
//! check-and-set: the first caller for a fingerprint installs an
//! `InFlight` marker guarded by a `tokio::sync::Notify`; subsequent callers
//! for the same fingerprint await that `Notify` instead of issuing a
//! duplicate upstream request.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;

use crate::models::vizql::{QueryResult, VDSQuery};

/// Recursively sorts object keys so structurally-identical queries hash
/// identically regardless of field order (spec.md §9).
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        },
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Deterministic, non-cryptographic fingerprint of a VDS query. The cache
/// is process-local and never shipped across a trust boundary, so a fast
/// hash (not a cryptographic digest) is the right tool.
pub fn fingerprint(query: &VDSQuery) -> String {
    let value = serde_json::to_value(query).unwrap_or(Value::Null);
    let canonical = canonicalize(&value);
    let canonical_string = canonical.to_string();

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical_string.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

enum Slot {
    InFlight(Arc<Notify>),
    Done(QueryResult, Instant),
}

#[derive(Clone)]
pub struct FingerprintCache {
    slots: Arc<DashMap<String, Slot>>,
    ttl: Duration,
}

pub enum ClaimOutcome {
    /// This caller is the sole builder for the fingerprint and must
    /// execute the query, then call `complete`.
    Build,
    /// A fresh cached result, returned without touching the upstream.
    Cached(QueryResult),
}

impl FingerprintCache {
    pub fn new(ttl: Duration) -> Self {
        Self { slots: Arc::new(DashMap::new()), ttl }
    }

    /// Returns a cached, non-expired result if one exists - used for the
    /// "cache hit after a failed execution" fallback path (spec.md §4.8),
    /// which does not go through the in-flight claim protocol.
    pub fn peek(&self, key: &str) -> Option<QueryResult> {
        match self.slots.get(key)?.value() {
            Slot::Done(result, stored_at) if stored_at.elapsed() < self.ttl => Some(result.clone()),
            _ => None,
        }
    }

    /// Atomically claims the right to build a fingerprint, or waits for
    /// (and returns) a concurrently in-flight build's result.
    pub async fn claim(&self, key: &str) -> ClaimOutcome {
        loop {
            let notify = {
                match self.slots.entry(key.to_string()) {
                    dashmap::mapref::entry::Entry::Vacant(entry) => {
                        let notify = Arc::new(Notify::new());
                        entry.insert(Slot::InFlight(notify));
                        return ClaimOutcome::Build;
                    },
                    dashmap::mapref::entry::Entry::Occupied(entry) => match entry.get() {
                        Slot::Done(result, stored_at) if stored_at.elapsed() < self.ttl => {
                            return ClaimOutcome::Cached(result.clone());
                        },
                        Slot::Done(..) => {
                            drop(entry);
                            let notify = Arc::new(Notify::new());
                            self.slots.insert(key.to_string(), Slot::InFlight(notify));
                            return ClaimOutcome::Build;
                        },
                        Slot::InFlight(notify) => notify.clone(),
                    },
                }
            };
            notify.notified().await;
        }
    }

    /// Completes a successful build, caching the result and waking any
    /// waiters. Never called on failure or cancellation, by construction.
    pub fn complete(&self, key: &str, result: QueryResult) {
        if let Some(mut entry) = self.slots.get_mut(key) {
            if let Slot::InFlight(notify) = std::mem::replace(&mut *entry, Slot::Done(result, Instant::now())) {
                notify.notify_waiters();
            }
        } else {
            self.slots.insert(key.to_string(), Slot::Done(result, Instant::now()));
        }
    }

    /// Releases an in-flight claim without caching anything - used when
    /// the build fails or is cancelled, so the next caller gets to try.
    pub fn abandon(&self, key: &str) {
        if let Some((_, Slot::InFlight(notify))) = self.slots.remove(key) {
            notify.notify_waiters();
        }
    }

    /// Drops `Done` entries past their TTL so the process-wide map does
    /// not grow unbounded across the process lifetime. Run periodically
    /// from a background task, not on the request path.
    pub fn sweep_expired(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !matches!(slot, Slot::Done(_, stored_at) if stored_at.elapsed() >= self.ttl));
        before - self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vizql::VDSField;

    fn sample_query() -> VDSQuery {
        let mut query = VDSQuery::new("ds1");
        query.query.fields.push(VDSField { field_caption: "Sales".to_string(), function: Some("SUM".to_string()), calculation: None });
        query
    }

    #[test]
    fn fingerprint_is_stable_under_field_order() {
        let mut a = sample_query();
        a.query.fields.push(VDSField { field_caption: "Region".to_string(), ..Default::default() });
        // Serialize via serde_json::Value with reordered keys to confirm
        // canonicalization, not struct field order (which serde fixes
        // anyway) - this asserts determinism across repeated calls.
        let fp1 = fingerprint(&a);
        let fp2 = fingerprint(&a);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn different_queries_fingerprint_differently() {
        let a = sample_query();
        let mut b = sample_query();
        b.query.fields[0].function = Some("AVG".to_string());
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn second_claim_for_completed_fingerprint_is_cached() {
        let cache = FingerprintCache::new(Duration::from_secs(60));
        let key = "k1";
        assert!(matches!(cache.claim(key).await, ClaimOutcome::Build));
        cache.complete(key, QueryResult { columns: vec!["Sales".into()], data: vec![], row_count: 0, dimension_values: Default::default() });

        match cache.claim(key).await {
            ClaimOutcome::Cached(_) => {},
            ClaimOutcome::Build => panic!("expected a cache hit on the second claim"),
        }
    }

    #[tokio::test]
    async fn abandoned_claim_lets_next_caller_rebuild() {
        let cache = FingerprintCache::new(Duration::from_secs(60));
        let key = "k1";
        assert!(matches!(cache.claim(key).await, ClaimOutcome::Build));
        cache.abandon(key);
        assert!(matches!(cache.claim(key).await, ClaimOutcome::Build));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let cache = FingerprintCache::new(Duration::from_millis(0));
        cache.complete("stale", QueryResult { columns: vec![], data: vec![], row_count: 0, dimension_values: Default::default() });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let fresh = FingerprintCache::new(Duration::from_secs(60));
        fresh.complete("fresh", QueryResult { columns: vec![], data: vec![], row_count: 0, dimension_values: Default::default() });

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(fresh.sweep_expired(), 0);
    }
}
