//! Per-message validation and handler dispatch
//!
//! Each inbound payload is parsed, checked against the shared API secret and
//! routed to a registered handler by method name. Handler failures are
//! logged and contained so one bad message never stalls the consumer loop.

use crate::bus::Envelope;
use crate::error::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

type Handler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// What became of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// Payload was not valid JSON for the envelope shape.
    Malformed,
    /// API secret check failed; assumed misconfigured or malicious peer.
    Rejected,
    /// No handler registered for the method.
    Unhandled,
    HandlerFailed,
}

/// Registry of `{method -> handler}` guarded by the shared API secret.
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    api_key: Arc<RwLock<String>>,
}

impl Dispatcher {
    pub fn new(api_key: Arc<RwLock<String>>) -> Self {
        Self {
            handlers: HashMap::new(),
            api_key,
        }
    }

    pub fn register<F, Fut>(&mut self, method: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(
            method.to_string(),
            Arc::new(move |params| Box::pin(handler(params))),
        );
    }

    pub async fn dispatch(&self, payload: &[u8]) -> DispatchOutcome {
        let envelope: Envelope = match serde_json::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Bus message parse failed: {}", e);
                return DispatchOutcome::Malformed;
            }
        };

        let expected = self.api_key.read().await;
        if expected.is_empty() || envelope.headers.api_key != *expected {
            error!("Bus message rejected: invalid API key");
            return DispatchOutcome::Rejected;
        }
        drop(expected);

        let handler = match self.handlers.get(&envelope.method) {
            Some(handler) => Arc::clone(handler),
            None => {
                warn!("No bus handler for method {}", envelope.method);
                return DispatchOutcome::Unhandled;
            }
        };

        info!("Bus message: method={}", envelope.method);
        match handler(envelope.params).await {
            Ok(()) => DispatchOutcome::Handled,
            Err(e) => {
                error!("Bus handler {} failed: {}", envelope.method, e);
                DispatchOutcome::HandlerFailed
            }
        }
    }
}
