//! Redis transport for the invalidation bus
//!
//! One pub/sub channel serves as the fanout exchange; each node's
//! subscription is private to its own connection, so every node receives
//! every broadcast. The same Redis instance holds the rotating shared API
//! secret, re-read on every (re)connect.

use crate::bus::consumer::BrokerTransport;
use crate::bus::{BusMessage, BusPublisher, Envelope};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct RedisBus {
    client: redis::Client,
    channel: String,
    api_key_name: String,
    api_key: Arc<RwLock<String>>,
}

impl RedisBus {
    pub fn new(url: &str, channel: &str, api_key_name: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            channel: channel.to_string(),
            api_key_name: api_key_name.to_string(),
            api_key: Arc::new(RwLock::new(String::new())),
        })
    }

    /// Shared handle to the current API secret, for the dispatcher.
    pub fn api_key(&self) -> Arc<RwLock<String>> {
        Arc::clone(&self.api_key)
    }

    /// Re-read the rotating shared secret from the key store.
    pub async fn load_api_key(&self) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(&self.api_key_name).await?;
        *self.api_key.write().await = value.unwrap_or_default();
        debug!("Shared API key loaded from {}", self.api_key_name);
        Ok(())
    }
}

#[async_trait]
impl BusPublisher for RedisBus {
    async fn publish(&self, message: &BusMessage) -> Result<()> {
        let api_key = self.api_key.read().await.clone();
        let payload = serde_json::to_string(&Envelope::new(&api_key, message))?;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.publish(&self.channel, payload).await?;
        info!("Published {} to {}", message.method, self.channel);
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for RedisBus {
    async fn connect(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        // The secret may have rotated while we were disconnected.
        self.load_api_key().await?;

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        info!("Subscribed to {}", self.channel);

        Ok(pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed())
    }
}
