//! In-process bus transport
//!
//! A broadcast channel standing in for the Redis fanout, used by tests to
//! exercise multi-node invalidation without a broker. Same wire format, same
//! dispatcher path.

use crate::bus::consumer::BrokerTransport;
use crate::bus::{BusMessage, BusPublisher, Envelope};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<Vec<u8>>,
    api_key: String,
}

impl MemoryBus {
    pub fn new(api_key: &str) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            api_key: api_key.to_string(),
        }
    }

    /// Publish with a key other than the bus's own, for protocol tests.
    pub fn publish_raw(&self, api_key: &str, message: &BusMessage) {
        let payload = serde_json::to_vec(&Envelope::new(api_key, message))
            .expect("envelope serializes");
        let _ = self.tx.send(payload);
    }

    /// Publish an arbitrary payload, bypassing the envelope entirely.
    pub fn publish_raw_bytes(&self, payload: &[u8]) {
        let _ = self.tx.send(payload.to_vec());
    }
}

#[async_trait]
impl BusPublisher for MemoryBus {
    async fn publish(&self, message: &BusMessage) -> Result<()> {
        let payload = serde_json::to_vec(&Envelope::new(&self.api_key, message))?;
        // Fire-and-forget: no subscribers is not an error.
        let _ = self.tx.send(payload);
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for MemoryBus {
    async fn connect(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
