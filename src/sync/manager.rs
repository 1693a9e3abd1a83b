//! Per-client session controller.
//!
//! A [`SyncManager`] owns one transport. It republishes every inbound change
//! on an unfiltered broadcast stream and owns the outbound path: a bounded
//! queue drained by a single worker, so local setters never wait on I/O and
//! changes leave in the order they were queued.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::error::{with_retry, RetryPolicy, SyncError, SyncResult};
use crate::object::SyncObject;
use crate::protocol::{ChangeNotification, ObjectId};
use crate::transport::{ConnectionStatus, Transport};

/// How long `stop_sync` waits for queued changes to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ManagerState::Idle => "idle",
            ManagerState::Starting => "starting",
            ManagerState::Active => "active",
            ManagerState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

type Outbound = Arc<Mutex<Option<mpsc::Sender<ChangeNotification>>>>;

pub struct SyncManager {
    transport: Arc<dyn Transport>,
    /// Shared with the pump, which drops back to idle when the transport fails
    state: Arc<Mutex<ManagerState>>,
    session: Arc<RwLock<Option<String>>>,
    remote_tx: broadcast::Sender<Arc<ChangeNotification>>,
    /// Object id -> type name
    registered: DashMap<ObjectId, String>,
    outbound: Outbound,
    pump: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
    retry: RetryPolicy,
    queue_capacity: usize,
}

impl SyncManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, &ClientConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: &ClientConfig) -> Self {
        let (remote_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            transport,
            state: Arc::new(Mutex::new(ManagerState::Idle)),
            session: Arc::new(RwLock::new(None)),
            remote_tx,
            registered: DashMap::new(),
            outbound: Arc::new(Mutex::new(None)),
            pump: Mutex::new(None),
            worker: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            retry: config.retry_policy(),
            queue_capacity: config.outbound_queue_capacity.max(1),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ManagerState::Active
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.read().clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.status_changes()
    }

    fn set_state(&self, next: ManagerState) {
        transition(&self.state, self.transport.name(), next);
    }

    /// Join `session_id`. A no-op when already active in that session;
    /// switching sessions stops the current one first.
    pub async fn start_sync(&self, session_id: &str) -> SyncResult<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() == ManagerState::Active {
            if self.session_id().as_deref() == Some(session_id) {
                tracing::debug!(session_id, "sync already active for session");
                return Ok(());
            }
            tracing::info!(session_id, "switching sync session");
            self.shutdown_session().await;
        }

        self.set_state(ManagerState::Starting);

        // Subscribe before connecting so nothing sent right after the join is missed
        let mut inbound = self.transport.subscribe();
        if let Err(err) = self.transport.connect(session_id).await {
            tracing::error!(session_id, error = %err, "failed to start sync");
            self.set_state(ManagerState::Idle);
            return Err(err);
        }

        let remote_tx = self.remote_tx.clone();
        let mut status = self.transport.status_changes();
        let transport_name = self.transport.name();
        let state = Arc::clone(&self.state);
        let session = Arc::clone(&self.session);
        let outbound = Arc::clone(&self.outbound);
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = inbound.recv() => match received {
                        Ok(change) => {
                            let _ = remote_tx.send(change);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "inbound change stream lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *status.borrow_and_update() != ConnectionStatus::Failed {
                            continue;
                        }
                        let session_id = session.write().take();
                        drop(outbound.lock().take());
                        transition(&state, transport_name, ManagerState::Idle);
                        tracing::error!(
                            transport = transport_name,
                            session_id = ?session_id,
                            "transport failed; sync stopped"
                        );
                        break;
                    }
                }
            }
        });

        let (tx, mut queue) = mpsc::channel::<ChangeNotification>(self.queue_capacity);
        let transport = Arc::clone(&self.transport);
        let policy = self.retry.clone();
        let worker = tokio::spawn(async move {
            while let Some(change) = queue.recv().await {
                let transport = &transport;
                let pending = &change;
                if let Err(err) = with_retry(&policy, move || transport.send(pending)).await {
                    tracing::error!(
                        object_id = %change.object_id,
                        property = %change.property_name,
                        seq = ?change.sequence_number,
                        error = %err,
                        "dropping change after failed send"
                    );
                }
            }
        });

        *self.session.write() = Some(session_id.to_string());
        *self.outbound.lock() = Some(tx);
        *self.pump.lock() = Some(pump);
        *self.worker.lock() = Some(worker);
        self.set_state(ManagerState::Active);

        tracing::info!(session_id, transport = self.transport.name(), "sync started");
        Ok(())
    }

    /// Leave the session. Safe when idle and when the transport is already broken.
    pub async fn stop_sync(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ManagerState::Idle {
            return;
        }
        self.shutdown_session().await;
    }

    async fn shutdown_session(&self) {
        self.set_state(ManagerState::Stopping);
        let session = self.session_id();

        // Closing the queue lets the worker flush what is already queued
        drop(self.outbound.lock().take());
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if timeout(DRAIN_TIMEOUT, &mut worker).await.is_err() {
                tracing::warn!("outbound queue did not drain in time");
                worker.abort();
            }
        }

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        if let Err(err) = self.transport.disconnect().await {
            tracing::warn!(error = %err, "transport disconnect failed");
        }

        *self.session.write() = None;
        self.set_state(ManagerState::Idle);
        tracing::info!(session_id = ?session, "sync stopped");
    }

    /// Send one change now, retrying transient failures.
    pub async fn send_change(&self, change: &ChangeNotification) -> SyncResult<()> {
        if !self.is_active() {
            return Err(SyncError::NotConnected);
        }
        let transport = &self.transport;
        with_retry(&self.retry, move || transport.send(change)).await
    }

    /// Queue a change for the background sender without waiting.
    pub fn enqueue_change(&self, change: ChangeNotification) -> SyncResult<()> {
        if !self.is_active() {
            return Err(SyncError::NotConnected);
        }
        let sender = self.outbound.lock().clone().ok_or(SyncError::NotConnected)?;
        sender.try_send(change).map_err(|err| match err {
            TrySendError::Full(_) => SyncError::QueueFull,
            TrySendError::Closed(_) => SyncError::NotConnected,
        })
    }

    /// Every change received from the transport, unfiltered
    pub fn remote_changes(&self) -> broadcast::Receiver<Arc<ChangeNotification>> {
        self.remote_tx.subscribe()
    }

    pub fn register_object(&self, object: &dyn SyncObject) {
        self.registered
            .insert(object.id().clone(), object.type_name().to_string());
        tracing::trace!(object_id = %object.id(), "object registered");
    }

    pub fn unregister_object(&self, object_id: &ObjectId) -> bool {
        let removed = self.registered.remove(object_id).is_some();
        if removed {
            tracing::trace!(%object_id, "object unregistered");
        }
        removed
    }

    pub fn is_registered(&self, object_id: &ObjectId) -> bool {
        self.registered.contains_key(object_id)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn registered_ids(&self) -> Vec<ObjectId> {
        self.registered.iter().map(|entry| entry.key().clone()).collect()
    }
}

fn transition(state: &Mutex<ManagerState>, transport: &str, next: ManagerState) {
    let previous = std::mem::replace(&mut *state.lock(), next);
    if previous != next {
        tracing::debug!(transport, from = %previous, to = %next, "sync manager state changed");
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}
