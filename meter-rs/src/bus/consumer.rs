//! Reconnecting broker client
//!
//! Owns the subscription lifecycle: connect, consume until the connection
//! drops, retry at a fixed interval up to an attempt ceiling, then stop and
//! wait for operator intervention. The attempt counter resets to zero on
//! every successful connection.

use crate::bus::Dispatcher;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Connection lifecycle of the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Attempt ceiling reached; no further reconnect is scheduled.
    Stopped,
}

/// Something that can open a subscription and yield raw message payloads
/// until the connection drops.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self) -> Result<BoxStream<'static, Vec<u8>>>;
}

#[async_trait]
impl<T: BrokerTransport + ?Sized> BrokerTransport for Arc<T> {
    async fn connect(&self) -> Result<BoxStream<'static, Vec<u8>>> {
        (**self).connect().await
    }
}

/// Drives one subscription against a transport, dispatching every payload.
pub struct BusConsumer<T> {
    transport: T,
    dispatcher: Arc<Dispatcher>,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
    state_tx: watch::Sender<BusState>,
}

impl<T: BrokerTransport> BusConsumer<T> {
    pub fn new(
        transport: T,
        dispatcher: Arc<Dispatcher>,
        reconnect_interval: Duration,
        max_reconnect_attempts: u32,
    ) -> Self {
        let (state_tx, _) = watch::channel(BusState::Disconnected);
        Self {
            transport,
            dispatcher,
            reconnect_interval,
            max_reconnect_attempts,
            state_tx,
        }
    }

    /// Observe connection state transitions.
    pub fn state(&self) -> watch::Receiver<BusState> {
        self.state_tx.subscribe()
    }

    /// Run until the attempt ceiling is reached. Intended to be spawned.
    pub async fn run(self) {
        let mut attempts: u32 = 0;

        loop {
            self.set_state(BusState::Connecting);
            match self.transport.connect().await {
                Ok(mut stream) => {
                    attempts = 0;
                    self.set_state(BusState::Connected);
                    info!("Bus connected");

                    while let Some(payload) = stream.next().await {
                        self.dispatcher.dispatch(&payload).await;
                    }

                    warn!("Bus connection lost");
                    self.set_state(BusState::Reconnecting);
                }
                Err(e) => {
                    warn!("Bus connect failed: {}", e);
                }
            }

            attempts += 1;
            if attempts >= self.max_reconnect_attempts {
                error!(
                    "Bus gave up after {} reconnect attempts",
                    self.max_reconnect_attempts
                );
                self.set_state(BusState::Stopped);
                return;
            }

            info!(
                "Bus reconnect attempt {}/{} in {:?}",
                attempts, self.max_reconnect_attempts, self.reconnect_interval
            );
            sleep(self.reconnect_interval).await;
        }
    }

    fn set_state(&self, state: BusState) {
        let _ = self.state_tx.send(state);
    }
}
