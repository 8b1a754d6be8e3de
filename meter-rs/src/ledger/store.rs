//! Narrow storage interface for the usage ledger
//!
//! Only the operations the metering core needs: a transactional scope with
//! select-for-update and batch save, plus the read paths behind the auth and
//! limiter decisions. Backends: Postgres for production, an in-process store
//! for tests and local development.

use crate::error::Result;
use crate::ledger::types::UsageRecord;
use async_trait::async_trait;

/// One open ledger transaction holding row locks until commit or drop.
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock and return the `Active` subscription rows for the given ids.
    ///
    /// Callers must pass `user_ids` in sorted order; every writer acquiring
    /// row locks in the same global order is what rules out distributed
    /// deadlock between concurrently flushing nodes.
    async fn select_active_for_update(&mut self, user_ids: &[String]) -> Result<Vec<UsageRecord>>;

    /// Stage updated rows; they become visible on commit.
    async fn save_batch(&mut self, rows: &[UsageRecord]) -> Result<()>;

    /// Commit the transaction, releasing all row locks.
    async fn commit(self) -> Result<()>;
}

/// Durable store of subscription quota state.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    type Tx: LedgerTx;

    async fn begin(&self) -> Result<Self::Tx>;

    /// Credential and account-status check for one subscriber.
    async fn authenticate_user(&self, user_id: &str, credential: &str) -> Result<bool>;

    /// Active, non-deleted subscriptions for one subscriber.
    async fn active_subscriptions(&self, user_id: &str) -> Result<Vec<UsageRecord>>;

    /// Add node-level aggregate traffic to the per-node counter. No quota
    /// logic; bookkeeping only.
    async fn add_node_usage(&self, service_tag: &str, bytes: u128) -> Result<()>;
}
