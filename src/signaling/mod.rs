#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod gateway;
pub mod hub;
pub mod protocol;

pub use gateway::SignalingGateway;
pub use hub::ConnectionHub;

use crate::config::ServerConfig;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest accepted WebSocket frame
const MAX_FRAME_SIZE: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    gateway: SignalingGateway,
    connection_semaphore: Arc<Semaphore>,
    metrics_token: Option<Arc<str>>,
}

impl SignalingServer {
    pub fn new(gateway: SignalingGateway, config: &ServerConfig) -> Self {
        info!("Max connections: {}", config.max_connections);
        if config.metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is unauthenticated");
        }

        Self {
            gateway,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections.min(Semaphore::MAX_PERMITS))),
            metrics_token: config.metrics_token.as_deref().map(Arc::from),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Serves until `shutdown` resolves, then closes every room
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve<F>(self, port: u16, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let gateway = self.gateway.clone();
        let app = self.router();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        gateway.shutdown().await;
        Ok(())
    }
}

async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.gateway.rooms();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms.room_count(),
        "participants": rooms.participant_count(),
    }))
}

/// Prometheus text exposition, behind an optional bearer token
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.gateway.rooms();
    let body = server
        .gateway
        .metrics()
        .render_prometheus(rooms.room_count(), rooms.participant_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_FRAME_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, server.gateway, permit))
}
