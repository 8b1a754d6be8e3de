//! Plugin gateway: the three hooks exposed to the relay fleet
//!
//! Orchestrates the decision cache, the delta engine and the ledger. Every
//! hook returns a structured value on every path; an accounting fault
//! becomes a deny or a dropped batch with a log line, never an error the
//! relay's data path has to handle.

use crate::bus::BusPublisher;
use crate::cache::DecisionCache;
use crate::delta::{DeltaEngine, ObservedEvent};
use crate::ledger::store::LedgerStore;
use crate::ledger::writer::LedgerWriter;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Rate applied when no subscription carries an explicit limit.
pub const UNLIMITED_RATE_BYTES: u64 = 99_999 * 1024 * 1024;

/// Reply to the authenticate hook.
#[derive(Debug, Clone, Serialize)]
pub struct AuthReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl AuthReply {
    fn allow(user_id: &str) -> Self {
        Self {
            ok: true,
            id: Some(user_id.to_string()),
        }
    }

    fn deny() -> Self {
        Self { ok: false, id: None }
    }
}

/// Reply to the rate-limit hook, bytes per second per direction.
#[derive(Debug, Clone, Serialize)]
pub struct LimitReply {
    #[serde(rename = "in")]
    pub input: u64,
    #[serde(rename = "out")]
    pub output: u64,
}

impl LimitReply {
    fn both(limit: u64) -> Self {
        Self {
            input: limit,
            output: limit,
        }
    }

    fn zero() -> Self {
        Self::both(0)
    }
}

pub struct PluginGateway<S: LedgerStore> {
    store: Arc<S>,
    cache: Arc<DecisionCache>,
    writer: LedgerWriter<S>,
    engine: Mutex<DeltaEngine>,
}

impl<S: LedgerStore> PluginGateway<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<DecisionCache>,
        publisher: Arc<dyn BusPublisher>,
        batch_size: usize,
        server_reset_ceiling: u128,
    ) -> Self {
        let writer = LedgerWriter::new(Arc::clone(&store), Arc::clone(&cache), publisher);
        Self {
            store,
            cache,
            writer,
            engine: Mutex::new(DeltaEngine::new(batch_size, server_reset_ceiling)),
        }
    }

    /// Authenticate hook: credential match, active account and at least one
    /// `Active` subscription. Either condition failing is a deny, not an
    /// error.
    pub async fn authenticate(&self, user_id: &str, credential: &str) -> AuthReply {
        if user_id.is_empty() {
            warn!("Auth request without subscriber id");
            return AuthReply::deny();
        }

        if self.cache.cached_auth(user_id).await {
            return AuthReply::allow(user_id);
        }

        match self.store.authenticate_user(user_id, credential).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Auth denied for {}: bad credential or inactive account", user_id);
                return AuthReply::deny();
            }
            Err(e) => {
                error!("Auth lookup failed for {}: {}", user_id, e);
                return AuthReply::deny();
            }
        }

        match self.store.active_subscriptions(user_id).await {
            Ok(subscriptions) if !subscriptions.is_empty() => {
                self.cache.store_auth(user_id).await;
                info!("Auth allowed for {}", user_id);
                AuthReply::allow(user_id)
            }
            Ok(_) => {
                info!("Auth denied for {}: no active subscription", user_id);
                AuthReply::deny()
            }
            Err(e) => {
                error!("Subscription lookup failed for {}: {}", user_id, e);
                AuthReply::deny()
            }
        }
    }

    /// Rate-limit hook: lowest explicit limit across the subscriber's
    /// active subscriptions, or the unbounded ceiling when none is set.
    pub async fn rate_limit(&self, user_id: &str) -> LimitReply {
        if user_id.is_empty() {
            return LimitReply::zero();
        }

        if let Some(limit) = self.cache.cached_limit(user_id).await {
            return LimitReply::both(limit);
        }

        match self.store.active_subscriptions(user_id).await {
            Ok(subscriptions) if !subscriptions.is_empty() => {
                let limit = subscriptions
                    .iter()
                    .filter_map(|s| s.speed_limit)
                    .min()
                    // Stored as megabytes/sec, served as bytes/sec.
                    .map(|mb| mb * 1024 * 1024)
                    .unwrap_or(UNLIMITED_RATE_BYTES);

                self.cache.store_limit(user_id, limit).await;
                debug!("Rate limit for {}: {} B/s", user_id, limit);
                LimitReply::both(limit)
            }
            Ok(_) => {
                info!("No active subscription for {}, zero rate", user_id);
                LimitReply::zero()
            }
            Err(e) => {
                error!("Rate-limit lookup failed for {}: {}", user_id, e);
                LimitReply::zero()
            }
        }
    }

    /// Observe hook: fold one observation window into the ledger.
    ///
    /// Baselines advance per batch and only after that batch committed; a
    /// failed batch is recomputed against the old baseline on the next
    /// window.
    pub async fn observe(&self, node_id: Option<&str>, events: &[ObservedEvent]) {
        let mut engine = self.engine.lock().await;

        let batches = engine.compute_user_deltas(events);
        for batch in &batches {
            match self.writer.apply_increments(&batch.increments).await {
                Ok(()) => engine.commit(batch),
                Err(e) => {
                    warn!(
                        "Dropping increment batch of {} subscribers: {}",
                        batch.increments.len(),
                        e
                    );
                }
            }
        }

        let server_delta = engine.compute_server_delta(events);
        if server_delta.delta == 0 {
            engine.commit_server(&server_delta);
            return;
        }

        let service_tag = node_id.unwrap_or("unknown");
        match self.store.add_node_usage(service_tag, server_delta.delta).await {
            Ok(()) => engine.commit_server(&server_delta),
            Err(e) => warn!("Dropping node usage for {}: {}", service_tag, e),
        }
    }
}
