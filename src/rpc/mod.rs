//! RPC server for operator clients.
//!
//! Provides a JSON-RPC 2.0 interface over TCP for creating, inspecting,
//! cancelling and finalizing jobs, and for reading the VPN session.
//!
//! ## Architecture
//!
//! - `protocol`: JSON-RPC 2.0 request/response types and error codes
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: Method dispatcher and handlers
//! - `client`: Client for connecting to the daemon

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::core::orchestrator::Orchestrator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{Request, Response, RpcError};

/// RPC server that exposes daemon functionality to clients.
pub struct RpcServer {
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Bind the listening socket. Connections are served once `start` runs.
    pub async fn bind(orchestrator: Orchestrator, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let handler = Arc::new(MethodHandler::new(orchestrator));
        let transport = Transport::bind(bind_addr, handler).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            transport,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Start the RPC server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.transport.listen(shutdown_rx).await
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
