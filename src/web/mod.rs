//! HTTP ingress for the provisioning daemon.
//!
//! The external boot service and the on-device agent report progress here.
//! Operators can reach the JSON-RPC methods over a WebSocket as well.
//!
//! ## Architecture
//!
//! - `callbacks`: boot-service and agent callback handlers
//! - `websocket`: WebSocket handler that dispatches to RPC method handlers
//!
//! ## Endpoints
//!
//! - `POST /boot/discover`, `/boot/lease`, `/boot/image-delivered`
//! - `POST /agent/install-started`, `/agent/install-result`, `/agent/verify-result`
//! - `GET /healthz`
//! - `WS /ws` - JSON-RPC over WebSocket

mod callbacks;
mod websocket;

use axum::{
    Json, Router,
    routing::{get, post},
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::core::gateway::BootEventGateway;
use crate::core::orchestrator::Orchestrator;
use crate::rpc::MethodHandler;

/// Shared state for the web server
#[derive(Clone)]
pub struct WebState {
    pub handler: Arc<MethodHandler>,
    pub gateway: BootEventGateway,
}

/// Callback and WebSocket server.
pub struct WebServer {
    listener: TcpListener,
    state: WebState,
    shutdown_tx: broadcast::Sender<()>,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/boot/discover", post(callbacks::discover))
        .route("/boot/lease", post(callbacks::lease))
        .route("/boot/image-delivered", post(callbacks::image_delivered))
        .route("/agent/install-started", post(callbacks::install_started))
        .route("/agent/install-result", post(callbacks::install_result))
        .route("/agent/verify-result", post(callbacks::verify_result))
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
}

impl WebServer {
    /// Bind the listening socket. Requests are served once `start` runs.
    pub async fn bind(orchestrator: Orchestrator, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let state = WebState {
            gateway: orchestrator.gateway(),
            handler: Arc::new(MethodHandler::new(orchestrator)),
        };
        let listener = TcpListener::bind(bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener,
            state,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown() is called. Consumes the server.
    pub async fn start(self) -> anyhow::Result<()> {
        let app = router(self.state);
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Callback server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Handle that stops a started server.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
