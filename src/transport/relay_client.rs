//! Websocket client for the relay service.
//!
//! One link per transport: a writer task drains an mpsc queue into the
//! socket sink and a reader task decodes [`RelayEvent`]s from the stream.
//! Changes are published to subscribers, join/leave acknowledgements and
//! `ActiveProjects` replies complete pending waiters. When the link drops
//! unexpectedly the transport reconnects with exponential backoff and
//! rejoins its session; after the configured attempts it enters `Failed`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{ConnectionStatus, StatusCell, Transport};
use crate::config::TransportConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::codec::{self, Frame, WireEncoding};
use crate::protocol::{ActiveProject, ChangeNotification, RelayEvent, RelayRequest};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 256;
const INCOMING_CAPACITY: usize = 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const LEAVE_ACK_TIMEOUT: Duration = Duration::from_secs(2);

struct Link {
    epoch: u64,
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Flush a close frame, then stop both tasks
    async fn close(self) {
        let Link {
            outbound,
            reader,
            mut writer,
            ..
        } = self;
        let _ = outbound.try_send(Message::Close(None));
        drop(outbound);
        if timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
        reader.abort();
    }
}

struct Inner {
    config: TransportConfig,
    encoding: WireEncoding,
    status: StatusCell,
    incoming: broadcast::Sender<Arc<ChangeNotification>>,
    session: RwLock<Option<String>>,
    link: Mutex<Option<Link>>,
    link_epoch: AtomicU64,
    /// Serializes connect, disconnect and automatic reconnects
    lifecycle: tokio::sync::Mutex<()>,
    closing: AtomicBool,
    pending_joins: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    pending_leaves: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    pending_projects: Mutex<VecDeque<oneshot::Sender<Vec<ActiveProject>>>>,
    /// Keyed by project, since the relay may report a count before the join completes
    member_counts: Mutex<HashMap<String, usize>>,
}

/// [`Transport`] backed by the relay service
pub struct RelayClientTransport {
    inner: Arc<Inner>,
}

impl RelayClientTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (incoming, _) = broadcast::channel(INCOMING_CAPACITY);
        let encoding = WireEncoding::from_binary_flag(config.binary_frames);
        Self {
            inner: Arc::new(Inner {
                config,
                encoding,
                status: StatusCell::new("relay"),
                incoming,
                session: RwLock::new(None),
                link: Mutex::new(None),
                link_epoch: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                closing: AtomicBool::new(false),
                pending_joins: Mutex::new(HashMap::new()),
                pending_leaves: Mutex::new(HashMap::new()),
                pending_projects: Mutex::new(VecDeque::new()),
                member_counts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.inner.config.server_url
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.read().clone()
    }

    /// Last member count the relay reported for the joined session
    pub fn member_count(&self) -> usize {
        let session = self.inner.session.read().clone();
        session
            .and_then(|project_id| self.inner.member_counts.lock().get(&project_id).copied())
            .unwrap_or(0)
    }

    /// Ask the relay for every session that currently has members.
    ///
    /// Opens a link first when none is up, without joining a session.
    pub async fn active_projects(&self) -> SyncResult<Vec<ActiveProject>> {
        let inner = &self.inner;
        {
            let _lifecycle = inner.lifecycle.lock().await;
            if !inner.is_linked() {
                inner.establish_link(inner.initial_attempts(), false).await?;
            }
        }

        let (tx, rx) = oneshot::channel();
        inner.pending_projects.lock().push_back(tx);
        inner.send_request(&RelayRequest::GetActiveProjects).await?;

        let wait = inner.config.connection_timeout();
        match timeout(wait, rx).await {
            Ok(Ok(projects)) => Ok(projects),
            Ok(Err(_)) => Err(SyncError::Transport("relay link closed before replying".into())),
            Err(_) => Err(SyncError::Timeout(wait)),
        }
    }
}

impl Inner {
    fn initial_attempts(&self) -> u32 {
        self.config.max_reconnect_attempts.saturating_add(1)
    }

    fn is_linked(&self) -> bool {
        self.link.lock().is_some() && self.status.get() == ConnectionStatus::Connected
    }

    fn build_request(&self) -> SyncResult<Request<()>> {
        let url = Url::parse(&self.config.server_url)
            .map_err(|e| SyncError::Configuration(format!("invalid relay url: {e}")))?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Configuration(e.to_string()))?;

        let headers = request.headers_mut();
        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SyncError::Configuration(format!("invalid auth token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SyncError::Configuration(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SyncError::Configuration(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }
        Ok(request)
    }

    async fn open_socket(&self) -> SyncResult<WsStream> {
        let request = self.build_request()?;
        let wait = self.config.connection_timeout();
        match timeout(wait, connect_async(request)).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(err)) => Err(SyncError::Transport(err.to_string())),
            Err(_) => Err(SyncError::Timeout(wait)),
        }
    }

    /// Open a link, retrying with backoff. Ends in `Connected` or `Failed`.
    async fn establish_link(self: &Arc<Self>, attempts: u32, reconnecting: bool) -> SyncResult<()> {
        let attempts = attempts.max(1);
        let policy = self.config.reconnect_policy();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.status.set(if reconnecting || attempt > 1 {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Connecting
            });

            match self.open_socket().await {
                Ok(stream) => {
                    self.install_link(stream);
                    tracing::info!(url = %self.config.server_url, attempt, "relay link established");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        url = %self.config.server_url,
                        attempt,
                        attempts,
                        error = %err,
                        "relay connection attempt failed"
                    );
                    last_error = err.to_string();
                    if attempt < attempts {
                        sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        self.status.set(ConnectionStatus::Failed);
        tracing::error!(url = %self.config.server_url, attempts, "giving up on relay connection");
        Err(SyncError::ConnectionFailed {
            attempts,
            reason: last_error,
        })
    }

    fn install_link(self: &Arc<Self>, stream: WsStream) {
        let epoch = self.link_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (outbound, mut queue) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let weak: Weak<Inner> = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Frame::Text(text.to_string()),
                    Ok(Message::Binary(bytes)) => Frame::Binary(bytes.to_vec()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::debug!(error = %err, "relay link read failed");
                        break;
                    }
                };
                let Some(inner) = weak.upgrade() else { return };
                inner.handle_frame(&frame);
            }

            if let Some(inner) = weak.upgrade() {
                tokio::spawn(Inner::on_link_lost(inner, epoch));
            }
        });

        // Replies queued on a previous link will never arrive
        self.pending_projects.lock().clear();
        let previous = self.link.lock().replace(Link {
            epoch,
            outbound,
            reader,
            writer,
        });
        if let Some(previous) = previous {
            previous.abort();
        }
        self.status.set(ConnectionStatus::Connected);
    }

    fn handle_frame(&self, frame: &Frame) {
        let event: RelayEvent = match codec::decode(frame) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring undecodable relay frame");
                return;
            }
        };

        match event {
            RelayEvent::ReceiveChange { change } => {
                tracing::trace!(target_property = %change.target(), source = %change.change_source, "relay change received");
                // No subscribers is fine
                let _ = self.incoming.send(Arc::new(change));
            }
            RelayEvent::SessionJoined { project_id } => {
                tracing::debug!(project_id, "relay acknowledged join");
                resolve(&self.pending_joins, &project_id);
            }
            RelayEvent::SessionLeft { project_id } => {
                tracing::debug!(project_id, "relay acknowledged leave");
                resolve(&self.pending_leaves, &project_id);
            }
            RelayEvent::SessionMemberCountChanged { project_id, count } => {
                tracing::debug!(project_id, count, "session member count changed");
                self.member_counts.lock().insert(project_id, count);
            }
            RelayEvent::ActiveProjects { projects } => {
                if let Some(waiter) = self.pending_projects.lock().pop_front() {
                    let _ = waiter.send(projects);
                }
            }
            RelayEvent::Error { message } => {
                tracing::warn!(error_message = %message, "relay reported an error");
            }
        }
    }

    async fn send_request(&self, request: &RelayRequest) -> SyncResult<()> {
        let message = match codec::encode(request, self.encoding)? {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        let outbound = self
            .link
            .lock()
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(SyncError::NotConnected)?;

        outbound
            .send(message)
            .await
            .map_err(|_| SyncError::Transport(format!("relay link closed during {}", request.method())))
    }

    /// Send `JoinProject` and wait for the relay's acknowledgement
    async fn join(&self, project_id: &str) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_joins
            .lock()
            .entry(project_id.to_string())
            .or_default()
            .push(tx);

        let request = RelayRequest::JoinProject {
            project_id: project_id.to_string(),
        };
        if let Err(err) = self.send_request(&request).await {
            self.pending_joins.lock().remove(project_id);
            return Err(err);
        }

        let wait = self.config.connection_timeout();
        match timeout(wait, rx).await {
            Ok(Ok(())) => {
                *self.session.write() = Some(project_id.to_string());
                tracing::info!(project_id, "joined relay session");
                Ok(())
            }
            Ok(Err(_)) => Err(SyncError::Transport("relay link closed before join was acknowledged".into())),
            Err(_) => {
                self.pending_joins.lock().remove(project_id);
                Err(SyncError::Timeout(wait))
            }
        }
    }

    async fn leave(&self, project_id: &str) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.pending_leaves
            .lock()
            .entry(project_id.to_string())
            .or_default()
            .push(tx);

        let request = RelayRequest::LeaveProject {
            project_id: project_id.to_string(),
        };
        if let Err(err) = self.send_request(&request).await {
            self.pending_leaves.lock().remove(project_id);
            return Err(err);
        }

        let result = match timeout(LEAVE_ACK_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SyncError::Transport("relay link closed before leave was acknowledged".into())),
            Err(_) => Err(SyncError::Timeout(LEAVE_ACK_TIMEOUT)),
        };
        self.pending_leaves.lock().remove(project_id);
        self.member_counts.lock().remove(project_id);
        result
    }

    async fn on_link_lost(inner: Arc<Inner>, epoch: u64) {
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.closing.load(Ordering::Acquire) {
            return;
        }
        let current = inner.link.lock().as_ref().map(|link| link.epoch);
        if current != Some(epoch) {
            // Superseded by a newer link
            return;
        }
        if let Some(link) = inner.link.lock().take() {
            link.abort();
        }

        tracing::warn!(url = %inner.config.server_url, "relay link lost");
        let Some(session) = inner.session.read().clone() else {
            inner.status.set(ConnectionStatus::Disconnected);
            return;
        };

        if inner.config.max_reconnect_attempts == 0 {
            inner.status.set(ConnectionStatus::Failed);
            tracing::error!(session_id = %session, "reconnect disabled; relay transport failed");
            return;
        }

        match inner
            .establish_link(inner.config.max_reconnect_attempts, true)
            .await
        {
            Ok(()) => match inner.join(&session).await {
                Ok(()) => tracing::info!(session_id = %session, "rejoined session after reconnect"),
                Err(err) => tracing::error!(session_id = %session, error = %err, "rejoin after reconnect failed"),
            },
            Err(err) => {
                tracing::error!(session_id = %session, error = %err, "relay reconnect exhausted");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.abort();
        }
    }
}

fn resolve(waiters: &Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>, project_id: &str) {
    if let Some(pending) = waiters.lock().remove(project_id) {
        for waiter in pending {
            let _ = waiter.send(());
        }
    }
}

#[async_trait]
impl Transport for RelayClientTransport {
    fn name(&self) -> &'static str {
        "relay"
    }

    async fn connect(&self, session_id: &str) -> SyncResult<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        inner.closing.store(false, Ordering::Release);

        let current = inner.session.read().clone();
        if current.as_deref() == Some(session_id) && inner.is_linked() {
            tracing::debug!(session_id, "relay already joined");
            return Ok(());
        }

        if !inner.is_linked() {
            inner
                .establish_link(inner.initial_attempts(), false)
                .await?;
        }

        if let Some(previous) = current.filter(|previous| previous != session_id) {
            if let Err(err) = inner.leave(&previous).await {
                tracing::warn!(session_id = %previous, error = %err, "leaving previous session failed");
            }
            *inner.session.write() = None;
        }

        inner.join(session_id).await
    }

    async fn disconnect(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        inner.closing.store(true, Ordering::Release);

        let session = inner.session.write().take();
        if let Some(project_id) = session {
            if inner.is_linked() {
                if let Err(err) = inner.leave(&project_id).await {
                    tracing::debug!(session_id = %project_id, error = %err, "leave during disconnect failed");
                }
            }
            tracing::info!(session_id = %project_id, "left relay session");
        }

        let link = inner.link.lock().take();
        if let Some(link) = link {
            link.close().await;
        }
        inner.member_counts.lock().clear();
        inner.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn send(&self, change: &ChangeNotification) -> SyncResult<()> {
        let inner = &self.inner;
        match inner.status.get() {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Failed => {
                return Err(SyncError::ConnectionFailed {
                    attempts: inner.config.max_reconnect_attempts,
                    reason: "relay unreachable".into(),
                })
            }
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                return Err(SyncError::Transport("relay link is reconnecting".into()))
            }
            ConnectionStatus::Disconnected => return Err(SyncError::NotConnected),
        }
        let project_id = inner.session.read().clone().ok_or(SyncError::NotJoined)?;

        inner
            .send_request(&RelayRequest::SendChange {
                project_id,
                change: change.clone(),
            })
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<ChangeNotification>> {
        self.inner.incoming.subscribe()
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.status.get()
    }

    fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }
}
