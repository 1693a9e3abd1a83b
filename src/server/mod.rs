//! Multi-tenant websocket relay.

pub mod api;
pub mod hub;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;

pub use api::AppState;
pub use hub::{group_name, RelayHub};
pub use session::{ConnectionId, ProjectSession};

/// Run the relay until the process is stopped
pub async fn start(config: &ServerConfig) -> Result<()> {
    let address = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind relay to {address}"))?;
    tracing::info!(%address, "relay listening");

    let state = AppState::new(Arc::new(RelayHub::new()), config);
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, api::router(state))
        .await
        .context("relay server failed")?;
    Ok(())
}

/// A relay serving in the background
pub struct RelayServer {
    pub addr: SocketAddr,
    pub hub: Arc<RelayHub>,
    handle: JoinHandle<()>,
}

impl RelayServer {
    /// Bind (port 0 picks a free port) and serve on a spawned task
    pub async fn spawn(config: &ServerConfig) -> Result<Self> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind relay to {address}"))?;
        let addr = listener.local_addr()?;

        let hub = Arc::new(RelayHub::new());
        let state = AppState::new(Arc::clone(&hub), config);
        let handle = tokio::spawn(async move {
            if let Err(err) = serve(listener, state).await {
                tracing::error!(error = %err, "relay stopped");
            }
        });
        tracing::info!(%addr, "relay listening");

        Ok(Self { addr, hub, handle })
    }

    /// Websocket endpoint clients connect to
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Stop accepting, then close every open connection
    pub async fn shutdown(self) {
        let Self { addr, hub, handle } = self;
        handle.abort();
        // Resolves once the listener has been dropped
        let _ = handle.await;
        let closed = hub.close_all();
        tracing::info!(%addr, connections = closed, "relay stopped");
    }
}
