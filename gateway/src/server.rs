//! HTTP surface: one WebSocket route, token-gated before upgrade.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parley_core::broker::Broker;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::session;
use crate::Result;

/// Gateway configuration.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind_addr: String,
    /// Bearer token required as the `token` query parameter. `None` disables
    /// the check (local development).
    pub auth_token: Option<String>,
    /// Depth of the inbound-audio buffer; the oldest frame drops when the
    /// broker cannot keep up, never the client socket.
    pub ingress_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::env::var("PARLEY_GATEWAY_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            auth_token: std::env::var("PARLEY_AUTH_TOKEN")
                .ok()
                .filter(|s| !s.is_empty()),
            ingress_buffer: 32,
        }
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub broker: Arc<Broker>,
    pub cfg: GatewayConfig,
}

/// The WebSocket gateway server.
pub struct Gateway {
    broker: Arc<Broker>,
    cfg: GatewayConfig,
}

impl Gateway {
    pub fn new(broker: Arc<Broker>, cfg: GatewayConfig) -> Self {
        Self { broker, cfg }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            broker: Arc::clone(&self.broker),
            cfg: self.cfg.clone(),
        };
        Router::new()
            .route("/v1/ws/audio", get(ws_handler))
            .with_state(state)
    }

    /// Bind and serve; returns the join handle and the bound address (useful
    /// with a `:0` port).
    pub async fn start(self) -> Result<(JoinHandle<()>, SocketAddr)> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.cfg.bind_addr)
            .await
            .map_err(|e| crate::GatewayError::BindError(format!("{}: {e}", self.cfg.bind_addr)))?;
        let addr = listener.local_addr()?;
        info!(target: "gateway", %addr, "gateway listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(target: "gateway", error = %e, "gateway server stopped");
            }
        });
        Ok((handle, addr))
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(expected) = &state.cfg.auth_token {
        if params.get("token") != Some(expected) {
            warn!(target: "gateway", "rejected connection with missing or bad token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| session::run_session(state, socket))
}
