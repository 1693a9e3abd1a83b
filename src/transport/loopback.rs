//! In-process loopback transport.
//!
//! Participants of the same session share a [`LoopbackHub`]. `send` pushes
//! the change straight into every other participant's inbound channel
//! before returning, so delivery is FIFO per sender.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use super::{ConnectionStatus, StatusCell, Transport};
use crate::error::{SyncError, SyncResult};
use crate::protocol::ChangeNotification;

type Inbox = broadcast::Sender<Arc<ChangeNotification>>;

const DEFAULT_CAPACITY: usize = 1024;

static GLOBAL_HUB: Lazy<Arc<LoopbackHub>> = Lazy::new(|| Arc::new(LoopbackHub::new()));

/// Shared in-process registry of loopback sessions
#[derive(Default)]
pub struct LoopbackHub {
    sessions: DashMap<String, Vec<(Uuid, Inbox)>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide hub used by [`LoopbackTransport::new`]
    pub fn global() -> Arc<LoopbackHub> {
        Arc::clone(&GLOBAL_HUB)
    }

    fn join(&self, session_id: &str, participant: Uuid, inbox: Inbox) {
        let mut members = self.sessions.entry(session_id.to_string()).or_default();
        if !members.iter().any(|(id, _)| *id == participant) {
            members.push((participant, inbox));
        }
        tracing::debug!(session_id, %participant, members = members.len(), "loopback participant joined");
    }

    fn leave(&self, session_id: &str, participant: Uuid) {
        if let Some(mut members) = self.sessions.get_mut(session_id) {
            members.retain(|(id, _)| *id != participant);
            tracing::debug!(session_id, %participant, remaining = members.len(), "loopback participant left");
        }
        if self.sessions.remove_if(session_id, |_, members| members.is_empty()).is_some() {
            tracing::debug!(session_id, "cleaned up empty loopback session");
        }
    }

    fn broadcast(&self, session_id: &str, sender: Uuid, change: &ChangeNotification) -> usize {
        let inboxes: Vec<Inbox> = match self.sessions.get(session_id) {
            Some(members) => members
                .iter()
                .filter(|(id, _)| *id != sender)
                .map(|(_, inbox)| inbox.clone())
                .collect(),
            None => return 0,
        };

        let change = Arc::new(change.clone());
        inboxes
            .iter()
            .filter(|inbox| inbox.send(Arc::clone(&change)).is_ok())
            .count()
    }

    pub fn member_count(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

pub struct LoopbackTransport {
    id: Uuid,
    hub: Arc<LoopbackHub>,
    incoming: Inbox,
    status: StatusCell,
    session: RwLock<Option<String>>,
}

impl LoopbackTransport {
    /// Transport on the process-wide hub
    pub fn new() -> Self {
        Self::with_hub(LoopbackHub::global())
    }

    pub fn with_hub(hub: Arc<LoopbackHub>) -> Self {
        Self::with_capacity(hub, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(hub: Arc<LoopbackHub>, capacity: usize) -> Self {
        let (incoming, _) = broadcast::channel(capacity.max(1));
        Self {
            id: Uuid::new_v4(),
            hub,
            incoming,
            status: StatusCell::new("loopback"),
            session: RwLock::new(None),
        }
    }

    pub fn participant_id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.read().clone()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn connect(&self, session_id: &str) -> SyncResult<()> {
        let current = self.session.read().clone();
        if current.as_deref() == Some(session_id) && self.status.get() == ConnectionStatus::Connected {
            tracing::debug!(session_id, "loopback already connected");
            return Ok(());
        }

        if let Some(previous) = current {
            self.hub.leave(&previous, self.id);
        }

        self.status.set(ConnectionStatus::Connecting);
        self.hub.join(session_id, self.id, self.incoming.clone());
        *self.session.write() = Some(session_id.to_string());
        self.status.set(ConnectionStatus::Connected);

        tracing::info!(session_id, participant = %self.id, "joined loopback session");
        Ok(())
    }

    async fn disconnect(&self) -> SyncResult<()> {
        if let Some(previous) = self.session.write().take() {
            self.hub.leave(&previous, self.id);
            tracing::info!(session_id = %previous, participant = %self.id, "left loopback session");
        }
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn send(&self, change: &ChangeNotification) -> SyncResult<()> {
        if self.status.get() != ConnectionStatus::Connected {
            return Err(SyncError::NotConnected);
        }
        let session_id = self.session.read().clone().ok_or(SyncError::NotJoined)?;

        let delivered = self.hub.broadcast(&session_id, self.id, change);
        tracing::trace!(target_property = %change.target(), delivered, "loopback change sent");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeNotification>> {
        self.incoming.subscribe()
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if let Some(previous) = self.session.get_mut().take() {
            self.hub.leave(&previous, self.id);
        }
    }
}
