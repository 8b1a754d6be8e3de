//! Hook endpoints: auth, limiter, observe

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::delta::ObservedEvent;
use crate::error::Result;
use crate::gateway::{AuthReply, LimitReply, PluginGateway};
use crate::ledger::store::LedgerStore;

/// Auth hook payload as the relay sends it.
#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Limiter hook payload; only the client id matters here.
#[derive(Debug, Deserialize)]
pub struct LimiterRequest {
    #[serde(default)]
    pub client: String,
}

#[derive(Debug, Deserialize)]
pub struct ObserveRequest {
    #[serde(rename = "nodeId")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub events: Vec<EventDto>,
}

#[derive(Debug, Deserialize)]
pub struct EventDto {
    pub client: Option<String>,
    pub service: Option<String>,
    pub stats: Option<StatsDto>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsDto {
    #[serde(rename = "inputBytes", default)]
    pub input_bytes: u64,
    #[serde(rename = "outputBytes", default)]
    pub output_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct ObserveReply {
    pub ok: bool,
}

impl EventDto {
    fn into_event(self) -> ObservedEvent {
        let stats = self.stats.unwrap_or_default();
        ObservedEvent {
            client: self.client,
            service: self.service,
            input_bytes: stats.input_bytes,
            output_bytes: stats.output_bytes,
        }
    }
}

/// HTTP server binding the plugin hooks.
pub struct ApiServer<S: LedgerStore> {
    gateway: Arc<PluginGateway<S>>,
    addr: String,
}

impl<S: LedgerStore + 'static> ApiServer<S> {
    pub fn new(gateway: Arc<PluginGateway<S>>, addr: &str) -> Self {
        Self {
            gateway,
            addr: addr.to_string(),
        }
    }

    pub fn router(gateway: Arc<PluginGateway<S>>) -> Router {
        Router::new()
            .route("/plugin/auth", post(auth_hook::<S>))
            .route("/plugin/limiter", post(limiter_hook::<S>))
            .route("/plugin/observe", post(observe_hook::<S>))
            .route("/health", get(health))
            .layer(TraceLayer::new_for_http())
            .with_state(gateway)
    }

    pub async fn run(self) -> Result<()> {
        let router = Self::router(self.gateway);
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!("Hook API listening on {}", self.addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

async fn auth_hook<S: LedgerStore>(
    State(gateway): State<Arc<PluginGateway<S>>>,
    Json(request): Json<AuthRequest>,
) -> Json<AuthReply> {
    Json(gateway.authenticate(&request.username, &request.password).await)
}

async fn limiter_hook<S: LedgerStore>(
    State(gateway): State<Arc<PluginGateway<S>>>,
    Json(request): Json<LimiterRequest>,
) -> Json<LimitReply> {
    Json(gateway.rate_limit(&request.client).await)
}

async fn observe_hook<S: LedgerStore>(
    State(gateway): State<Arc<PluginGateway<S>>>,
    Json(request): Json<ObserveRequest>,
) -> Json<ObserveReply> {
    let events: Vec<ObservedEvent> = request.events.into_iter().map(EventDto::into_event).collect();
    gateway.observe(request.node_id.as_deref(), &events).await;
    Json(ObserveReply { ok: true })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_dto_maps_counters() {
        let dto: EventDto = serde_json::from_value(serde_json::json!({
            "client": "u1",
            "service": "relay-0",
            "stats": { "inputBytes": 10, "outputBytes": 20, "totalConns": 3 }
        }))
        .unwrap();

        let event = dto.into_event();
        assert_eq!(event.client.as_deref(), Some("u1"));
        assert_eq!(event.input_bytes, 10);
        assert_eq!(event.output_bytes, 20);
    }

    #[test]
    fn test_event_dto_without_stats_defaults_to_zero() {
        let dto: EventDto = serde_json::from_value(serde_json::json!({ "client": "u1" })).unwrap();
        let event = dto.into_event();
        assert_eq!(event.input_bytes, 0);
        assert_eq!(event.output_bytes, 0);
    }

    #[test]
    fn test_limit_reply_wire_names() {
        let reply = LimitReply {
            input: 1,
            output: 2,
        };
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire["in"], 1);
        assert_eq!(wire["out"], 2);
    }
}
