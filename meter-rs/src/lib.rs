//! meter-rs: traffic metering and quota enforcement for a relay fleet
//!
//! The accounting backbone behind a fleet of proxy/relay nodes. Each node
//! reports cumulative traffic counters; this crate turns them into durable,
//! quota-aware state and answers the relay's auth and rate-limit hooks in
//! real time.
//!
//! # Architecture
//!
//! - [`delta`]: converts cumulative, possibly-resetting counters into safe
//!   per-subscriber increments (the baseline advances only after a durable
//!   write)
//! - [`ledger`]: the subscription quota rows and the transactional writer
//!   that applies increments under row locks in one global lock order
//! - [`cache`]: short-TTL auth and rate-limit decisions, evicted eagerly on
//!   quota exhaustion
//! - [`bus`]: reconnecting fanout client broadcasting invalidation events so
//!   an exhausted subscriber cannot dodge enforcement by switching nodes
//! - [`gateway`]: the three hooks (authenticate, rate-limit, observe)
//!   orchestrating the above
//! - [`api`]: thin HTTP binding of the hooks
//!
//! # Example
//!
//! ```no_run
//! use meter_rs::bus::MemoryBus;
//! use meter_rs::cache::DecisionCache;
//! use meter_rs::gateway::PluginGateway;
//! use meter_rs::ledger::MemoryLedgerStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(MemoryLedgerStore::new());
//!     let cache = Arc::new(DecisionCache::new(
//!         Duration::from_secs(6 * 3600),
//!         Duration::from_secs(3600),
//!     ));
//!     let bus = Arc::new(MemoryBus::new("secret"));
//!
//!     let gateway = PluginGateway::new(store, cache, bus, 100, 1_000_000_000);
//!     let reply = gateway.authenticate("u1", "credential").await;
//!     assert!(!reply.ok);
//! }
//! ```

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod delta;
pub mod error;
pub mod gateway;
pub mod ledger;

// Re-export commonly used types
pub use config::Config;
pub use error::{MeterError, Result};
