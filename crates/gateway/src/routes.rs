//! Status HTTP surface
//!
//! Poll-based views of the pool, health monitor and reconnect coordinator,
//! plus manual reconnection controls.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use metagate_shared::ServerId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::health::{HealthState, HealthSummary};
use crate::mcp::connection_pool::ConnectionPoolStatus;
use crate::pool::PoolStatus;
use crate::reconnect::{ReconnectConfig, ReconnectSummary, ReconnectionState, TriggerResult};
use crate::runtime::Gateway;

pub type AppState = Arc<Gateway>;

pub fn router(gateway: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status/pool", get(pool_status))
        .route("/status/health", get(health_status))
        .route("/status/health/check", post(run_health_check))
        .route("/status/health/:uuid", get(server_health))
        .route("/status/reconnect", get(reconnect_status))
        .route("/status/reconnect/:uuid", get(server_reconnect))
        .route("/reconnect/:uuid", post(trigger_reconnect).delete(cancel_reconnect))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Liveness
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
pub struct PoolStatusResponse {
    pub gateways: PoolStatus,
    pub connections: ConnectionPoolStatus,
}

pub async fn pool_status(State(gateway): State<AppState>) -> Json<PoolStatusResponse> {
    Json(PoolStatusResponse {
        gateways: gateway.pool.status().await,
        connections: gateway.connections.status().await,
    })
}

#[derive(Serialize)]
pub struct HealthStatusResponse {
    pub summary: HealthSummary,
    pub servers: Vec<HealthState>,
}

pub async fn health_status(State(gateway): State<AppState>) -> Json<HealthStatusResponse> {
    Json(HealthStatusResponse {
        summary: gateway.health.summary().await,
        servers: gateway.health.all_health().await,
    })
}

fn parse_server_id(raw: &str) -> GatewayResult<ServerId> {
    Uuid::parse_str(raw)
        .map(ServerId)
        .map_err(|_| GatewayError::NotFound(format!("server {}", raw)))
}

pub async fn server_health(
    State(gateway): State<AppState>,
    Path(uuid): Path<String>,
) -> GatewayResult<Json<HealthState>> {
    let server_uuid = parse_server_id(&uuid)?;
    gateway
        .health
        .health(server_uuid)
        .await
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound(format!("health state for server {}", uuid)))
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthCheckRequest {
    #[serde(default)]
    pub server_uuids: Option<Vec<ServerId>>,
}

/// Run a batch of probes now. An empty body checks every server.
pub async fn run_health_check(
    State(gateway): State<AppState>,
    body: Option<Json<HealthCheckRequest>>,
) -> Json<Vec<HealthState>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Json(gateway.health.check_multiple_servers(request.server_uuids).await)
}

#[derive(Serialize)]
pub struct ReconnectStatusResponse {
    pub summary: ReconnectSummary,
    pub pending: usize,
    pub config: ReconnectConfig,
    pub servers: Vec<ReconnectionState>,
}

pub async fn reconnect_status(State(gateway): State<AppState>) -> Json<ReconnectStatusResponse> {
    let reconnect = &gateway.reconnect;
    Json(ReconnectStatusResponse {
        summary: reconnect.summary(),
        pending: reconnect.pending_count(),
        config: reconnect.config(),
        servers: reconnect.all_states(),
    })
}

pub async fn server_reconnect(
    State(gateway): State<AppState>,
    Path(uuid): Path<String>,
) -> GatewayResult<Json<ReconnectionState>> {
    let server_uuid = parse_server_id(&uuid)?;
    gateway
        .reconnect
        .state(server_uuid)
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound(format!("reconnection state for server {}", uuid)))
}

pub async fn trigger_reconnect(
    State(gateway): State<AppState>,
    Path(uuid): Path<String>,
) -> GatewayResult<(StatusCode, Json<TriggerResult>)> {
    let server_uuid = parse_server_id(&uuid)?;
    let result = gateway.reconnect.trigger_reconnection(server_uuid).await;
    let status = if result.success {
        StatusCode::ACCEPTED
    } else if result.state.is_none() && result.error.as_deref() == Some("Server not found") {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(result)))
}

pub async fn cancel_reconnect(
    State(gateway): State<AppState>,
    Path(uuid): Path<String>,
) -> GatewayResult<Json<Value>> {
    let server_uuid = parse_server_id(&uuid)?;
    let cancelled = gateway.reconnect.cancel_reconnection(server_uuid);
    Ok(Json(json!({ "cancelled": cancelled })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mcp::client::{Connector, DownstreamClient};
    use crate::runtime::Repositories;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use metagate_shared::{ActivationStatus, InMemoryStore, McpServer, McpTransport, ServerParams};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct RefusingConnector;

    #[async_trait::async_trait]
    impl Connector for RefusingConnector {
        async fn connect(
            &self,
            params: &ServerParams,
            _cancel: &CancellationToken,
        ) -> GatewayResult<Arc<dyn DownstreamClient>> {
            Err(GatewayError::connection(&params.name, "refused"))
        }
    }

    async fn app() -> (Router, ServerId) {
        let store = Arc::new(InMemoryStore::new());
        let server = McpServer {
            uuid: ServerId::new(),
            name: "fs".to_string(),
            description: None,
            transport: McpTransport::Stdio {
                command: "mcp-fs".to_string(),
                args: vec![],
                env: Default::default(),
            },
            status: ActivationStatus::Active,
        };
        let uuid = server.uuid;
        store.insert_server(server).await;

        let gateway = Gateway::builder(Config::default(), Repositories::from_store(store))
            .connector(Arc::new(RefusingConnector))
            .build()
            .unwrap();
        (router(Arc::new(gateway)), uuid)
    }

    async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_liveness() {
        let (app, _) = app().await;
        let (status, body) = send(&app, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_pool_status() {
        let (app, _) = app().await;
        let (status, body) = send(&app, Method::GET, "/status/pool").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gateways"]["idle"], 0);
        assert_eq!(body["connections"]["connections"], 0);
    }

    #[tokio::test]
    async fn test_health_check_then_lookup() {
        let (app, server) = app().await;

        let (status, body) = send(&app, Method::POST, "/status/health/check").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = send(&app, Method::GET, &format!("/status/health/{}", server)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "UNKNOWN");
        assert_eq!(body["consecutive_failures"], 1);

        let (status, body) = send(&app, Method::GET, "/status/health/not-a-uuid").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_reconnect_unknown_server() {
        let (app, _) = app().await;
        let (status, body) = send(&app, Method::POST, &format!("/reconnect/{}", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Server not found");
    }

    #[tokio::test]
    async fn test_reconnect_lifecycle() {
        let (app, server) = app().await;

        let (status, body) = send(&app, Method::POST, &format!("/reconnect/{}", server)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["state"]["reason"], "manual");

        let (status, _) = send(&app, Method::GET, &format!("/status/reconnect/{}", server)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, Method::DELETE, &format!("/reconnect/{}", server)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], true);

        let (_, body) = send(&app, Method::GET, "/status/reconnect").await;
        assert_eq!(body["summary"]["cancelled"], 1);
    }
}
