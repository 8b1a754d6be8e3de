//! Invalidation bus
//!
//! One shared fanout channel over Redis pub/sub. Every node holds its own
//! subscription, so every broadcast reaches every node, which is what the
//! cache-invalidation protocol depends on. Publishing is fire-and-forget; a
//! lost event is bounded in impact by the decision cache TTL.
//!
//! Inbound messages carry the shared API secret; messages failing the check
//! are dropped without dispatch.

pub mod consumer;
pub mod dispatch;
pub mod memory;
pub mod redis;

pub use consumer::{BusConsumer, BusState, BrokerTransport};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use memory::MemoryBus;
pub use redis::RedisBus;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A `{method, params}` message exchanged over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub method: String,
    pub params: serde_json::Value,
}

impl BusMessage {
    /// Invalidation event: every node evicts the subscriber's cached
    /// decisions.
    pub fn delete_user(user_id: &str) -> Self {
        Self {
            method: "deleteUser".to_string(),
            params: serde_json::json!({ "userID": user_id }),
        }
    }
}

/// Transport metadata. Redis messages carry no out-of-band headers, so the
/// shared secret rides in an explicit headers object on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Headers {
    #[serde(rename = "x-api-key")]
    pub api_key: String,
}

/// Wire envelope: headers plus the `{method, params}` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub headers: Headers,
    pub method: String,
    pub params: serde_json::Value,
}

impl Envelope {
    pub fn new(api_key: &str, message: &BusMessage) -> Self {
        Self {
            headers: Headers {
                api_key: api_key.to_string(),
            },
            method: message.method.clone(),
            params: message.params.clone(),
        }
    }
}

/// Publish side of the fanout channel.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> Result<()>;
}
