//! One-stop wiring of transport, manager and orchestrator for a client.

use std::sync::Arc;

use super::manager::SyncManager;
use super::orchestrator::SyncOrchestrator;
use crate::config::{ClientConfig, SyncConfig, TransportConfig};
use crate::error::{SyncError, SyncResult};
use crate::object::SyncObject;
use crate::transport::{LoopbackHub, LoopbackTransport, RelayClientTransport, Transport};

#[derive(Default)]
pub struct SyncBuilder {
    transport: Option<Arc<dyn Transport>>,
    source_id: Option<String>,
    client: ClientConfig,
}

impl SyncBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay transport and client settings from a loaded config file
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new()
            .client_config(config.client.clone())
            .relay(config.transport.clone())
    }

    pub fn loopback(self, hub: Arc<LoopbackHub>) -> Self {
        let capacity = self.client.broadcast_capacity;
        self.transport(Arc::new(LoopbackTransport::with_capacity(hub, capacity)))
    }

    pub fn relay(self, config: TransportConfig) -> Self {
        self.transport(Arc::new(RelayClientTransport::new(config)))
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides `client.source_id`
    pub fn source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.client = config;
        self
    }

    pub fn build(self) -> SyncResult<SyncClient> {
        let transport = self
            .transport
            .ok_or_else(|| SyncError::Configuration("no transport configured".into()))?;
        let source_id = self
            .source_id
            .unwrap_or_else(|| self.client.resolved_source_id());

        let manager = Arc::new(SyncManager::with_config(transport, &self.client));
        let orchestrator = SyncOrchestrator::new(Arc::clone(&manager));
        tracing::debug!(source_id, transport = manager.transport().name(), "sync client built");

        Ok(SyncClient {
            manager,
            orchestrator,
            source_id,
        })
    }
}

/// A configured client: one manager plus the orchestrator driving it
pub struct SyncClient {
    pub manager: Arc<SyncManager>,
    pub orchestrator: SyncOrchestrator,
    pub source_id: String,
}

impl SyncClient {
    pub async fn join(&self, session_id: &str) -> SyncResult<()> {
        self.manager.start_sync(session_id).await
    }

    pub async fn sync_project(&self, root: Arc<dyn SyncObject>) -> SyncResult<()> {
        self.orchestrator
            .sync_project(root, Some(&self.source_id))
            .await
    }

    /// Release the object graph, then leave the session
    pub async fn shutdown(&self) {
        self.orchestrator.stop_sync();
        self.manager.stop_sync().await;
    }
}
