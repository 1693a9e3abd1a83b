//! Pluggable change transports.
//!
//! A transport joins one session at a time, sends changes to every other
//! participant, and publishes what it receives on a broadcast channel.

pub mod loopback;
pub mod relay_client;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::error::SyncResult;
use crate::protocol::ChangeNotification;

pub use loopback::{LoopbackHub, LoopbackTransport};
pub use relay_client::RelayClientTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until the next explicit connect
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for log lines
    fn name(&self) -> &'static str;

    /// Connect (if needed) and join `session_id`; switching sessions leaves the old one
    async fn connect(&self, session_id: &str) -> SyncResult<()>;

    /// Leave the session and drop the link. Safe on an already-broken link.
    async fn disconnect(&self) -> SyncResult<()>;

    async fn send(&self, change: &ChangeNotification) -> SyncResult<()>;

    /// Inbound stream of changes originated by other participants
    fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeNotification>>;

    fn status(&self) -> ConnectionStatus;

    fn status_changes(&self) -> watch::Receiver<ConnectionStatus>;
}

/// Current connection status plus a watch stream of transitions
pub struct StatusCell {
    transport: &'static str,
    tx: watch::Sender<ConnectionStatus>,
}

impl StatusCell {
    pub fn new(transport: &'static str) -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self { transport, tx }
    }

    pub fn get(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn set(&self, status: ConnectionStatus) {
        let previous = self.tx.send_replace(status);
        if previous != status {
            tracing::debug!(transport = self.transport, from = %previous, to = %status, "connection status changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_publishes_transitions() {
        let cell = StatusCell::new("test");
        let mut rx = cell.subscribe();
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);

        cell.set(ConnectionStatus::Connecting);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Connecting);
        assert_eq!(cell.get(), ConnectionStatus::Connecting);
    }
}
