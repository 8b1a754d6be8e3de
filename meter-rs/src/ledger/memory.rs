//! In-process ledger store
//!
//! Backs tests and local development. One mutex stands in for the database's
//! transaction isolation: holding it from `begin` to `commit` gives the same
//! all-or-nothing visibility the Postgres store gets from row locks. The
//! store also records the id order of every lock acquisition so tests can
//! assert the sorted global lock order.

use crate::error::{MeterError, Result};
use crate::ledger::store::{LedgerStore, LedgerTx};
use crate::ledger::types::{PurchaseStatus, UsageRecord, User};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
struct MemoryState {
    records: Vec<UsageRecord>,
    users: Vec<User>,
    node_usage: HashMap<String, u128>,
    lock_orders: Vec<Vec<String>>,
    fail_next_commit: bool,
}

/// Ledger store holding everything in process memory.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_record(&self, record: UsageRecord) {
        self.state.lock().await.records.push(record);
    }

    pub async fn seed_user(&self, user: User) {
        self.state.lock().await.users.push(user);
    }

    /// Make the next transaction commit fail, simulating a lock timeout or
    /// connection loss.
    pub async fn fail_next_commit(&self) {
        self.state.lock().await.fail_next_commit = true;
    }

    pub async fn record_for(&self, user_id: &str) -> Option<UsageRecord> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .find(|r| r.user_id == user_id)
            .cloned()
    }

    pub async fn node_usage(&self, service_tag: &str) -> u128 {
        self.state
            .lock()
            .await
            .node_usage
            .get(service_tag)
            .copied()
            .unwrap_or(0)
    }

    /// Id orders observed by `select_active_for_update`, oldest first.
    pub async fn observed_lock_orders(&self) -> Vec<Vec<String>> {
        self.state.lock().await.lock_orders.clone()
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: Vec<UsageRecord>,
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn select_active_for_update(&mut self, user_ids: &[String]) -> Result<Vec<UsageRecord>> {
        self.guard.lock_orders.push(user_ids.to_vec());
        Ok(self
            .guard
            .records
            .iter()
            .filter(|r| {
                r.purchase_status == PurchaseStatus::Active
                    && !r.deleted
                    && user_ids.contains(&r.user_id)
            })
            .cloned()
            .collect())
    }

    async fn save_batch(&mut self, rows: &[UsageRecord]) -> Result<()> {
        self.staged = rows.to_vec();
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        if self.guard.fail_next_commit {
            self.guard.fail_next_commit = false;
            return Err(MeterError::Storage("simulated commit failure".to_string()));
        }
        for staged in self.staged {
            if let Some(row) = self.guard.records.iter_mut().find(|r| r.id == staged.id) {
                *row = staged;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(MemoryTx {
            guard: self.state.clone().lock_owned().await,
            staged: Vec::new(),
        })
    }

    async fn authenticate_user(&self, user_id: &str, credential: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .iter()
            .any(|u| u.id == user_id && u.password_hash == credential && u.status == 1))
    }

    async fn active_subscriptions(&self, user_id: &str) -> Result<Vec<UsageRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| {
                r.user_id == user_id && r.purchase_status == PurchaseStatus::Active && !r.deleted
            })
            .cloned()
            .collect())
    }

    async fn add_node_usage(&self, service_tag: &str, bytes: u128) -> Result<()> {
        let mut state = self.state.lock().await;
        *state.node_usage.entry(service_tag.to_string()).or_insert(0) += bytes;
        Ok(())
    }
}
