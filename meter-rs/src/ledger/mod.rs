//! Usage ledger: durable subscription quota state
//!
//! Owns the `usage_record` rows and the only code path that mutates them.
//! The transactional writer applies increment batches under row locks; the
//! store trait keeps the storage surface down to the handful of operations
//! the metering core needs.

pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;
pub mod writer;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
pub use store::{LedgerStore, LedgerTx};
pub use types::{PurchaseStatus, UsageRecord, User};
pub use writer::LedgerWriter;
