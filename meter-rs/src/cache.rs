//! Decision cache: short-TTL auth and rate-limit answers
//!
//! Consulted by the gateway before any database access. Entries expire by
//! TTL (bounded staleness) and are purged eagerly the moment a subscription
//! exhausts its quota, locally and via the invalidation bus on every peer.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache key kind; auth and limiter decisions are cached independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionKind {
    Auth,
    Limiter,
}

#[derive(Debug, Clone, Copy)]
enum CachedDecision {
    Allowed,
    /// Rate limit in bytes per second.
    Limit(u64),
}

struct Entry {
    decision: CachedDecision,
    expires_at: Instant,
}

/// TTL cache of authentication and rate-limit decisions keyed by subscriber.
pub struct DecisionCache {
    entries: RwLock<HashMap<(DecisionKind, String), Entry>>,
    auth_ttl: Duration,
    limiter_ttl: Duration,
}

impl DecisionCache {
    pub fn new(auth_ttl: Duration, limiter_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            auth_ttl,
            limiter_ttl,
        }
    }

    /// Whether a positive auth decision is cached for this subscriber.
    ///
    /// Denials are never cached; a failed lookup must re-check the database
    /// so re-activated accounts recover without waiting out a TTL.
    pub async fn cached_auth(&self, user_id: &str) -> bool {
        matches!(
            self.get(DecisionKind::Auth, user_id).await,
            Some(CachedDecision::Allowed)
        )
    }

    pub async fn store_auth(&self, user_id: &str) {
        self.insert(
            DecisionKind::Auth,
            user_id,
            CachedDecision::Allowed,
            self.auth_ttl,
        )
        .await;
    }

    /// Cached rate limit in bytes per second, if any.
    pub async fn cached_limit(&self, user_id: &str) -> Option<u64> {
        match self.get(DecisionKind::Limiter, user_id).await {
            Some(CachedDecision::Limit(limit)) => Some(limit),
            _ => None,
        }
    }

    pub async fn store_limit(&self, user_id: &str, limit: u64) {
        self.insert(
            DecisionKind::Limiter,
            user_id,
            CachedDecision::Limit(limit),
            self.limiter_ttl,
        )
        .await;
    }

    /// Evict both decision kinds for a subscriber, TTL notwithstanding.
    pub async fn purge_user(&self, user_id: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(&(DecisionKind::Auth, user_id.to_string()));
        entries.remove(&(DecisionKind::Limiter, user_id.to_string()));
    }

    /// Drop expired entries (call periodically).
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn get(&self, kind: DecisionKind, user_id: &str) -> Option<CachedDecision> {
        let key = (kind, user_id.to_string());
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.decision);
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Lazy expiry.
        self.entries.write().await.remove(&key);
        None
    }

    async fn insert(&self, kind: DecisionKind, user_id: &str, decision: CachedDecision, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            (kind, user_id.to_string()),
            Entry {
                decision,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> DecisionCache {
        DecisionCache::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_miss_on_empty_cache() {
        let cache = cache();
        assert!(!cache.cached_auth("u1").await);
        assert!(cache.cached_limit("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_store_and_hit() {
        let cache = cache();
        cache.store_auth("u1").await;
        cache.store_limit("u1", 1024).await;

        assert!(cache.cached_auth("u1").await);
        assert_eq!(cache.cached_limit("u1").await, Some(1024));
    }

    #[tokio::test]
    async fn test_kinds_are_independent() {
        let cache = cache();
        cache.store_auth("u1").await;

        assert!(cache.cached_auth("u1").await);
        assert!(cache.cached_limit("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = DecisionCache::new(Duration::from_millis(0), Duration::from_millis(0));
        cache.store_auth("u1").await;
        cache.store_limit("u1", 1024).await;

        assert!(!cache.cached_auth("u1").await);
        assert!(cache.cached_limit("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_user_removes_both_kinds() {
        let cache = cache();
        cache.store_auth("u1").await;
        cache.store_limit("u1", 1024).await;
        cache.store_auth("u2").await;

        cache.purge_user("u1").await;

        assert!(!cache.cached_auth("u1").await);
        assert!(cache.cached_limit("u1").await.is_none());
        assert!(cache.cached_auth("u2").await);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired() {
        let cache = DecisionCache::new(Duration::from_millis(0), Duration::from_secs(60));
        cache.store_auth("u1").await;
        cache.store_limit("u2", 10).await;
        assert_eq!(cache.len().await, 2);

        cache.sweep().await;
        assert_eq!(cache.len().await, 1);
    }
}
