//! Transactional ledger writer
//!
//! Applies an increment batch to the subscription rows under row-level
//! locks. Lock acquisition follows one global order (ids sorted
//! lexicographically); concurrent writers on overlapping id sets then only
//! ever block, never deadlock.
//!
//! A failed transaction drops the whole batch: the caller never advances its
//! baselines for a failed batch, so the same traffic is recomputed and
//! re-applied on the next observation window.

use crate::bus::{BusMessage, BusPublisher};
use crate::cache::DecisionCache;
use crate::delta::Increment;
use crate::error::Result;
use crate::ledger::store::{LedgerStore, LedgerTx};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Applies increment batches and fans out quota-exhaustion events.
pub struct LedgerWriter<S: LedgerStore> {
    store: Arc<S>,
    cache: Arc<DecisionCache>,
    publisher: Arc<dyn BusPublisher>,
}

impl<S: LedgerStore> LedgerWriter<S> {
    pub fn new(store: Arc<S>, cache: Arc<DecisionCache>, publisher: Arc<dyn BusPublisher>) -> Self {
        Self {
            store,
            cache,
            publisher,
        }
    }

    /// Apply one increment batch in a single transaction.
    ///
    /// Subscribers without an `Active` subscription are skipped silently.
    /// Every row crossing its allowance transitions to `Exhausted`; its
    /// cached decisions are purged locally before the invalidation event
    /// goes out, so this node cannot serve a stale allow while the
    /// broadcast propagates.
    pub async fn apply_increments(&self, increments: &BTreeMap<String, Increment>) -> Result<()> {
        if increments.is_empty() {
            return Ok(());
        }

        // BTreeMap keys iterate sorted: the fixed global lock order.
        let user_ids: Vec<String> = increments.keys().cloned().collect();

        let mut tx = self.store.begin().await?;
        let mut rows = tx.select_active_for_update(&user_ids).await?;
        if rows.is_empty() {
            debug!("No active subscriptions for increment batch");
            return tx.commit().await;
        }

        let mut exhausted: BTreeSet<String> = BTreeSet::new();
        for row in &mut rows {
            let increment = match increments.get(&row.user_id) {
                Some(increment) => increment,
                None => continue,
            };
            if row.apply_increment(increment) {
                exhausted.insert(row.user_id.clone());
            }
        }

        tx.save_batch(&rows).await?;
        tx.commit().await?;
        info!("Applied increments for {} subscription rows", rows.len());

        for user_id in &exhausted {
            info!("Quota exhausted for {}, evicting decisions", user_id);
            self.cache.purge_user(user_id).await;
            if let Err(e) = self.publisher.publish(&BusMessage::delete_user(user_id)).await {
                // Peers fall back to their cache TTL.
                warn!("Failed to publish invalidation for {}: {}", user_id, e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeterError;
    use crate::ledger::memory::MemoryLedgerStore;
    use crate::ledger::types::{PurchaseStatus, UsageRecord};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<BusMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl BusPublisher for RecordingPublisher {
        async fn publish(&self, message: &BusMessage) -> Result<()> {
            if self.fail {
                return Err(MeterError::BrokerNotConnected);
            }
            self.published.lock().await.push(message.clone());
            Ok(())
        }
    }

    fn record(id: i64, user_id: &str, allowance: u128) -> UsageRecord {
        UsageRecord {
            id,
            package_id: 1,
            order_code: format!("ORD-{id}"),
            user_id: user_id.to_string(),
            purchase_status: PurchaseStatus::Active,
            purchase_start_time: Utc::now(),
            purchase_end_time: Utc::now(),
            next_reset_date: None,
            data_allowance: allowance,
            consumed_data_transfer: 0,
            consumed_data_download: 0,
            consumed_data_upload: 0,
            speed_limit: None,
            device_num: None,
            device_limit: None,
            deleted: false,
        }
    }

    fn increment(input: u128, output: u128) -> Increment {
        Increment {
            input_bytes: input,
            output_bytes: output,
            total_bytes: input + output,
        }
    }

    fn cache() -> Arc<DecisionCache> {
        Arc::new(DecisionCache::new(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ))
    }

    fn writer(
        store: &MemoryLedgerStore,
        cache: &Arc<DecisionCache>,
        publisher: &Arc<RecordingPublisher>,
    ) -> LedgerWriter<MemoryLedgerStore> {
        LedgerWriter::new(
            Arc::new(store.clone()),
            Arc::clone(cache),
            Arc::clone(publisher) as Arc<dyn BusPublisher>,
        )
    }

    #[tokio::test]
    async fn test_increments_accumulate_on_rows() {
        let store = MemoryLedgerStore::new();
        store.seed_record(record(1, "u1", 10_000)).await;
        let cache = cache();
        let publisher = Arc::new(RecordingPublisher::default());
        let writer = writer(&store, &cache, &publisher);

        let mut batch = BTreeMap::new();
        batch.insert("u1".to_string(), increment(100, 200));
        writer.apply_increments(&batch).await.unwrap();

        let row = store.record_for("u1").await.unwrap();
        assert_eq!(row.consumed_data_transfer, 300);
        assert_eq!(row.consumed_data_download, 200);
        assert_eq!(row.consumed_data_upload, 100);
        assert_eq!(row.purchase_status, PurchaseStatus::Active);
        assert!(publisher.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_purges_cache_and_publishes() {
        let store = MemoryLedgerStore::new();
        store.seed_record(record(1, "u1", 500)).await;
        let cache = cache();
        cache.store_auth("u1").await;
        cache.store_limit("u1", 1024).await;
        let publisher = Arc::new(RecordingPublisher::default());
        let writer = writer(&store, &cache, &publisher);

        let mut batch = BTreeMap::new();
        batch.insert("u1".to_string(), increment(300, 300));
        writer.apply_increments(&batch).await.unwrap();

        let row = store.record_for("u1").await.unwrap();
        assert_eq!(row.purchase_status, PurchaseStatus::Exhausted);

        assert!(!cache.cached_auth("u1").await);
        assert!(cache.cached_limit("u1").await.is_none());

        let published = publisher.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].method, "deleteUser");
        assert_eq!(published[0].params["userID"], "u1");
    }

    #[tokio::test]
    async fn test_exhaustion_exactly_at_allowance() {
        let store = MemoryLedgerStore::new();
        store.seed_record(record(1, "u1", 1000)).await;
        let cache = cache();
        let publisher = Arc::new(RecordingPublisher::default());
        let writer = writer(&store, &cache, &publisher);

        for _ in 0..4 {
            let mut batch = BTreeMap::new();
            batch.insert("u1".to_string(), increment(250, 0));
            writer.apply_increments(&batch).await.unwrap();
        }

        let row = store.record_for("u1").await.unwrap();
        assert_eq!(row.consumed_data_transfer, 1000);
        assert_eq!(row.purchase_status, PurchaseStatus::Exhausted);
        // Exhaustion fired once, on the batch that reached the allowance.
        assert_eq!(publisher.published.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_subscriber_skipped_silently() {
        let store = MemoryLedgerStore::new();
        store.seed_record(record(1, "u1", 1000)).await;
        let cache = cache();
        let publisher = Arc::new(RecordingPublisher::default());
        let writer = writer(&store, &cache, &publisher);

        let mut batch = BTreeMap::new();
        batch.insert("u1".to_string(), increment(10, 0));
        batch.insert("ghost".to_string(), increment(99, 0));
        writer.apply_increments(&batch).await.unwrap();

        assert_eq!(store.record_for("u1").await.unwrap().consumed_data_transfer, 10);
        assert!(store.record_for("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_lock_acquisition_order_is_sorted() {
        let store = MemoryLedgerStore::new();
        store.seed_record(record(1, "alice", 1000)).await;
        store.seed_record(record(2, "bob", 1000)).await;
        let cache = cache();
        let publisher = Arc::new(RecordingPublisher::default());
        let writer = writer(&store, &cache, &publisher);

        // Insertion order reversed; the writer must still lock sorted.
        let mut batch = BTreeMap::new();
        batch.insert("bob".to_string(), increment(1, 0));
        batch.insert("alice".to_string(), increment(1, 0));
        writer.apply_increments(&batch).await.unwrap();

        let orders = store.observed_lock_orders().await;
        assert_eq!(orders, vec![vec!["alice".to_string(), "bob".to_string()]]);
    }

    #[tokio::test]
    async fn test_overlapping_batches_in_reversed_order_both_complete() {
        let store = MemoryLedgerStore::new();
        store.seed_record(record(1, "alice", 1_000_000)).await;
        store.seed_record(record(2, "bob", 1_000_000)).await;
        let cache = cache();
        let publisher = Arc::new(RecordingPublisher::default());

        let writer_a = writer(&store, &cache, &publisher);
        let writer_b = writer(&store, &cache, &publisher);

        let mut forward = BTreeMap::new();
        forward.insert("alice".to_string(), increment(10, 0));
        forward.insert("bob".to_string(), increment(10, 0));
        let mut reversed = BTreeMap::new();
        reversed.insert("bob".to_string(), increment(20, 0));
        reversed.insert("alice".to_string(), increment(20, 0));

        let (a, b) = tokio::join!(
            writer_a.apply_increments(&forward),
            writer_b.apply_increments(&reversed),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(store.record_for("alice").await.unwrap().consumed_data_transfer, 30);
        assert_eq!(store.record_for("bob").await.unwrap().consumed_data_transfer, 30);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_rows_untouched() {
        let store = MemoryLedgerStore::new();
        store.seed_record(record(1, "u1", 1000)).await;
        store.fail_next_commit().await;
        let cache = cache();
        let publisher = Arc::new(RecordingPublisher::default());
        let writer = writer(&store, &cache, &publisher);

        let mut batch = BTreeMap::new();
        batch.insert("u1".to_string(), increment(100, 0));
        assert!(writer.apply_increments(&batch).await.is_err());

        assert_eq!(store.record_for("u1").await.unwrap().consumed_data_transfer, 0);
        assert!(publisher.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_the_batch() {
        let store = MemoryLedgerStore::new();
        store.seed_record(record(1, "u1", 100)).await;
        let cache = cache();
        cache.store_auth("u1").await;
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let writer = writer(&store, &cache, &publisher);

        let mut batch = BTreeMap::new();
        batch.insert("u1".to_string(), increment(100, 100));
        writer.apply_increments(&batch).await.unwrap();

        // Local purge happened even though the broadcast was lost.
        assert!(!cache.cached_auth("u1").await);
        assert_eq!(
            store.record_for("u1").await.unwrap().purchase_status,
            PurchaseStatus::Exhausted
        );
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = MemoryLedgerStore::new();
        let cache = cache();
        let publisher = Arc::new(RecordingPublisher::default());
        let writer = writer(&store, &cache, &publisher);

        writer.apply_increments(&BTreeMap::new()).await.unwrap();
        assert!(store.observed_lock_orders().await.is_empty());
    }
}
