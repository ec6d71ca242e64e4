use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warprpc_common::correlation::CorrelationCache;
use warprpc_common::transport::{read_frame, FrameDecoder, JsonCodec, TcpTransport};
use warprpc_common::{IdGenerator, WarprpcError};

use super::{BackendError, BackendResult, ChildWatch, SessionEvent};
use crate::coordinator::{encode_message, ClientMessage, CoordReply, CoordRequest, ServerMessage};
use crate::tree::{ChildrenSnapshot, CreateMode, SessionId, TreeError, WatchId};

type Delivered = std::result::Result<
    (CoordReply, Option<mpsc::UnboundedReceiver<ChildrenSnapshot>>),
    TreeError,
>;

#[derive(Debug, Clone)]
pub struct RemoteBackendConfig {
    /// Coordinator address (`host:port`)
    pub addr: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl RemoteBackendConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(2),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Backend reached over TCP.
///
/// One connection (a "link") carries one session. When the link breaks the
/// session is gone on the coordinator side, so the backend reports
/// [`SessionEvent::Expired`] and the next operation dials again and opens a
/// fresh session.
pub struct RemoteBackend {
    config: RemoteBackendConfig,
    transport: TcpTransport,
    link: Mutex<Option<Arc<Link>>>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
}

struct Link {
    session: AtomicU64,
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: CorrelationCache<Delivered>,
    watches: DashMap<WatchId, mpsc::UnboundedSender<ChildrenSnapshot>>,
    ids: IdGenerator,
    closed: CancellationToken,
}

impl RemoteBackend {
    /// Connects and opens a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator is unreachable or refuses the
    /// session.
    pub async fn connect(config: RemoteBackendConfig) -> BackendResult<Self> {
        let (events, _) = broadcast::channel(16);
        let backend = Self {
            transport: TcpTransport::new().with_connect_timeout(config.connect_timeout),
            config,
            link: Mutex::new(None),
            events,
            shutdown: CancellationToken::new(),
        };
        backend.link().await?;
        Ok(backend)
    }

    /// Current session, if a link is up.
    pub async fn session(&self) -> Option<SessionId> {
        let guard = self.link.lock().await;
        guard
            .as_ref()
            .filter(|link| !link.closed.is_cancelled())
            .map(|link| link.session.load(Ordering::Acquire))
    }

    async fn link(&self) -> BackendResult<Arc<Link>> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if !link.closed.is_cancelled() {
                return Ok(link.clone());
            }
        }
        if self.shutdown.is_cancelled() {
            return Err(BackendError::Unavailable("backend closed".to_string()));
        }

        let link = self.establish().await?;
        *guard = Some(link.clone());
        Ok(link)
    }

    async fn establish(&self) -> BackendResult<Arc<Link>> {
        let stream = self.transport.connect(&self.config.addr).await?;
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let link = Arc::new(Link {
            session: AtomicU64::new(0),
            outbound,
            pending: CorrelationCache::new(),
            watches: DashMap::new(),
            ids: IdGenerator::new(),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, outbound_rx, link.closed.clone()));
        tokio::spawn(read_loop(
            reader,
            link.clone(),
            self.events.clone(),
            self.shutdown.clone(),
        ));

        let reply = link
            .request(CoordRequest::OpenSession, self.config.request_timeout)
            .await;
        let session = match reply {
            Ok(CoordReply::Session { session, timeout_ms }) => {
                info!(addr = %self.config.addr, session, timeout_ms, "coordinator session opened");
                session
            }
            Ok(other) => {
                link.closed.cancel();
                return Err(BackendError::Unavailable(format!(
                    "unexpected reply to session request: {:?}",
                    other
                )));
            }
            Err(e) => {
                link.closed.cancel();
                return Err(e);
            }
        };
        link.session.store(session, Ordering::Release);

        tokio::spawn(heartbeat_loop(
            link.clone(),
            self.config.heartbeat_interval,
            self.config.request_timeout,
        ));
        Ok(link)
    }

    async fn request(&self, request: CoordRequest) -> BackendResult<CoordReply> {
        let link = self.link().await?;
        link.request(request, self.config.request_timeout).await
    }

    pub(super) async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> BackendResult<String> {
        let reply = self
            .request(CoordRequest::Create {
                path: path.to_string(),
                data,
                mode,
            })
            .await?;
        match reply {
            CoordReply::Created { path } => Ok(path),
            other => Err(unexpected(other)),
        }
    }

    pub(super) async fn delete(&self, path: &str) -> BackendResult<()> {
        match self
            .request(CoordRequest::Delete {
                path: path.to_string(),
            })
            .await?
        {
            CoordReply::Deleted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub(super) async fn children(&self, path: &str) -> BackendResult<ChildrenSnapshot> {
        match self
            .request(CoordRequest::Children {
                path: path.to_string(),
            })
            .await?
        {
            CoordReply::Children(snapshot) => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    pub(super) async fn watch_children(&self, path: &str) -> BackendResult<ChildWatch> {
        let link = self.link().await?;
        let (reply, updates) = link
            .request_raw(
                CoordRequest::Watch {
                    path: path.to_string(),
                },
                self.config.request_timeout,
            )
            .await?;
        match (reply, updates) {
            (CoordReply::Watching { watch, snapshot }, Some(updates)) => Ok(ChildWatch {
                id: watch,
                initial: snapshot,
                updates,
            }),
            (other, _) => Err(unexpected(other)),
        }
    }

    pub(super) async fn unwatch(&self, watch: WatchId) -> BackendResult<()> {
        let guard = self.link.lock().await;
        let Some(link) = guard.as_ref().cloned() else {
            return Ok(());
        };
        drop(guard);
        link.watches.remove(&watch);
        if link.closed.is_cancelled() {
            return Ok(());
        }
        link.request(CoordRequest::Unwatch { watch }, self.config.request_timeout)
            .await
            .map(|_| ())
    }

    pub(super) fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(super) async fn close(&self) {
        self.shutdown.cancel();
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            if !link.closed.is_cancelled() {
                if let Err(e) = link
                    .request(CoordRequest::CloseSession, self.config.request_timeout)
                    .await
                {
                    debug!(error = %e, "close session request failed");
                }
            }
            link.closed.cancel();
        }
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(link) = self.link.get_mut().take() {
            link.closed.cancel();
        }
    }
}

fn unexpected(reply: CoordReply) -> BackendError {
    BackendError::Unavailable(format!("unexpected coordinator reply: {:?}", reply))
}

impl Link {
    async fn request(&self, request: CoordRequest, timeout: Duration) -> BackendResult<CoordReply> {
        self.request_raw(request, timeout).await.map(|(reply, _)| reply)
    }

    async fn request_raw(
        &self,
        request: CoordRequest,
        timeout: Duration,
    ) -> BackendResult<(CoordReply, Option<mpsc::UnboundedReceiver<ChildrenSnapshot>>)> {
        let id = self.ids.next_id();
        let reply = self.pending.register(id, 0);
        // The reader fails pending entries only after marking the link
        // closed, so an entry registered after that must be dropped here.
        if self.closed.is_cancelled() {
            return Err(BackendError::Unavailable("coordinator link closed".to_string()));
        }

        let frame = encode_message(&ClientMessage { id, request })?;
        if self.outbound.send(frame).is_err() {
            return Err(BackendError::Unavailable("coordinator link closed".to_string()));
        }

        let delivered = reply.wait(timeout).await?;
        Ok(delivered?)
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(error = %e, "coordinator write failed");
                    closed.cancel();
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    link: Arc<Link>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
) {
    let mut decoder = FrameDecoder::new();
    let reason = loop {
        let frame = tokio::select! {
            _ = link.closed.cancelled() => break "link closed".to_string(),
            frame = read_frame(&mut reader, &mut decoder) => frame,
        };
        let body = match frame {
            Ok(Some(body)) => body,
            Ok(None) => break "coordinator closed the connection".to_string(),
            Err(e) => break e.to_string(),
        };
        let message: ServerMessage = match JsonCodec::deserialize(&body) {
            Ok(message) => message,
            Err(e) => break format!("undecodable coordinator message: {}", e),
        };

        match message {
            ServerMessage::Reply { id, result } => {
                let delivered = result.map(|reply| {
                    // Register the watch channel before anyone can see the
                    // reply so no event for it is dropped.
                    let updates = match &reply {
                        CoordReply::Watching { watch, .. } => {
                            let (tx, rx) = mpsc::unbounded_channel();
                            link.watches.insert(*watch, tx);
                            Some(rx)
                        }
                        _ => None,
                    };
                    (reply, updates)
                });
                link.pending.complete(id, delivered);
            }
            ServerMessage::WatchEvent { watch, snapshot } => {
                let gone = match link.watches.get(&watch) {
                    Some(tx) => tx.send(snapshot).is_err(),
                    None => false,
                };
                if gone {
                    link.watches.remove(&watch);
                }
            }
        }
    };

    link.closed.cancel();
    link.pending
        .fail_connection(0, || WarprpcError::ConnectionLost(reason.clone()));
    // Dropping the senders ends every watch stream
    link.watches.clear();

    let session = link.session.load(Ordering::Acquire);
    if shutdown.is_cancelled() || session == 0 {
        debug!(reason = %reason, "coordinator link closed");
        return;
    }
    warn!(session, reason = %reason, "coordinator link lost");
    let _ = events.send(SessionEvent::Expired(session));
}

async fn heartbeat_loop(link: Arc<Link>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = link.closed.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = link.request(CoordRequest::Ping, timeout).await {
                    warn!(error = %e, "coordinator heartbeat failed");
                    link.closed.cancel();
                    break;
                }
            }
        }
    }
}
