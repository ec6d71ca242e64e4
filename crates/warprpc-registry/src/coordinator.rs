//! TCP coordination service.
//!
//! Serves a [`NodeTree`] to remote registries. Traffic uses the regular
//! warprpc envelope with JSON bodies: clients send [`ClientMessage`]s and
//! receive [`ServerMessage`]s, which are either correlated replies or watch
//! events.
//!
//! A session lives exactly as long as its connection. It is opened by the
//! first [`CoordRequest::OpenSession`] and closed when the client asks, when
//! the connection drops, or when no message arrives within the session
//! timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warprpc_common::transport::{encode_frame, read_frame, FrameDecoder, JsonCodec};
use warprpc_common::{Result, WarprpcError};

use crate::tree::{ChildrenSnapshot, CreateMode, NodeTree, SessionId, TreeError, WatchId};

/// Default session timeout (10 seconds)
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_EXPIRY_CHECK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordRequest {
    OpenSession,
    CloseSession,
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
    },
    Children {
        path: String,
    },
    Watch {
        path: String,
    },
    Unwatch {
        watch: WatchId,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CoordReply {
    Session { session: SessionId, timeout_ms: u64 },
    Closed,
    Created { path: String },
    Deleted,
    Children(ChildrenSnapshot),
    Watching { watch: WatchId, snapshot: ChildrenSnapshot },
    Unwatched,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub id: u64,
    pub request: CoordRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Reply {
        id: u64,
        result: std::result::Result<CoordReply, TreeError>,
    },
    WatchEvent {
        watch: WatchId,
        snapshot: ChildrenSnapshot,
    },
}

/// Encodes a message as one JSON envelope.
pub(crate) fn encode_message<T: Serialize>(message: &T) -> Result<Bytes> {
    let body = JsonCodec::serialize(message)?;
    encode_frame(&body)
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind_addr: String,
    pub session_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:2181".to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}

/// Coordination server.
///
/// # Example
///
/// ```no_run
/// use warprpc_registry::coordinator::{CoordinatorConfig, CoordinatorServer};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = CoordinatorServer::bind(CoordinatorConfig::default()).await?;
/// println!("coordinator on {}", server.local_addr()?);
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct CoordinatorServer {
    listener: TcpListener,
    tree: Arc<NodeTree>,
    session_timeout: Duration,
    shutdown: CancellationToken,
}

impl CoordinatorServer {
    pub async fn bind(config: CoordinatorConfig) -> Result<Self> {
        Self::with_tree(config, Arc::new(NodeTree::new())).await
    }

    /// Serves an existing tree, e.g. one also used by in-process backends.
    pub async fn with_tree(config: CoordinatorConfig, tree: Arc<NodeTree>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await.map_err(|e| {
            WarprpcError::Connection(format!("Failed to bind to {}: {}", config.bind_addr, e))
        })?;
        Ok(Self {
            listener,
            tree,
            session_timeout: config.session_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| WarprpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    pub fn tree(&self) -> Arc<NodeTree> {
        self.tree.clone()
    }

    /// Token that stops the accept loop and every connection when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "coordinator listening");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("coordinator shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(|e| {
                        WarprpcError::Connection(format!("Failed to accept connection: {}", e))
                    })?;
                    debug!(%peer, "coordinator connection");
                    let tree = self.tree.clone();
                    let shutdown = self.shutdown.child_token();
                    let timeout = self.session_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, tree, timeout, shutdown).await {
                            warn!(%peer, error = %e, "coordinator connection failed");
                        }
                    });
                }
            }
        }
    }

    /// Runs the server on its own task.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}

type Outbound = mpsc::UnboundedSender<Bytes>;

fn send(outbound: &Outbound, message: &ServerMessage) -> Result<()> {
    let frame = encode_message(message)?;
    outbound
        .send(frame)
        .map_err(|_| WarprpcError::ConnectionLost("coordinator writer stopped".to_string()))
}

async fn serve_connection(
    stream: TcpStream,
    tree: Arc<NodeTree>,
    session_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut session: Option<SessionId> = None;
    let mut decoder = FrameDecoder::new();
    let mut last_seen = Instant::now();
    let mut expiry = tokio::time::interval((session_timeout / 4).max(MIN_EXPIRY_CHECK));

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            _ = expiry.tick() => {
                if last_seen.elapsed() > session_timeout {
                    warn!(session = ?session, "session timed out");
                    break Ok(());
                }
            }
            frame = read_frame(&mut reader, &mut decoder) => {
                let body = match frame {
                    Ok(Some(body)) => body,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                };
                last_seen = Instant::now();

                let message: ClientMessage = match JsonCodec::deserialize(&body) {
                    Ok(message) => message,
                    Err(e) => break Err(e),
                };

                let closing = message.request == CoordRequest::CloseSession;
                let mut started = None;
                let result = handle_request(&tree, &mut session, message.request, session_timeout, &mut started);
                if let Err(e) = send(&outbound, &ServerMessage::Reply { id: message.id, result }) {
                    break Err(e);
                }
                // Events may only follow the reply that announced the watch
                if let Some((watch, updates)) = started {
                    tokio::spawn(forward_watch(watch, updates, outbound.clone()));
                }
                if closing {
                    break Ok(());
                }
            }
        }
    };

    if let Some(session) = session.take() {
        tree.close_session(session);
    }
    drop(outbound);
    let _ = writer_task.await;
    result
}

async fn forward_watch(
    watch: WatchId,
    mut updates: mpsc::UnboundedReceiver<ChildrenSnapshot>,
    outbound: Outbound,
) {
    while let Some(snapshot) = updates.recv().await {
        if send(&outbound, &ServerMessage::WatchEvent { watch, snapshot }).is_err() {
            break;
        }
    }
}

fn handle_request(
    tree: &Arc<NodeTree>,
    session: &mut Option<SessionId>,
    request: CoordRequest,
    session_timeout: Duration,
    started: &mut Option<(WatchId, mpsc::UnboundedReceiver<ChildrenSnapshot>)>,
) -> std::result::Result<CoordReply, TreeError> {
    if matches!(request, CoordRequest::OpenSession) && session.is_none() {
        *session = Some(tree.open_session());
    }

    let current = session.ok_or(TreeError::SessionExpired(0))?;
    match request {
        CoordRequest::OpenSession => Ok(CoordReply::Session {
            session: current,
            timeout_ms: session_timeout.as_millis() as u64,
        }),
        CoordRequest::CloseSession => {
            tree.close_session(current);
            *session = None;
            Ok(CoordReply::Closed)
        }
        CoordRequest::Create { path, data, mode } => {
            let path = tree.create(current, &path, data, mode)?;
            Ok(CoordReply::Created { path })
        }
        CoordRequest::Delete { path } => {
            tree.delete(&path)?;
            Ok(CoordReply::Deleted)
        }
        CoordRequest::Children { path } => Ok(CoordReply::Children(tree.children(&path)?)),
        CoordRequest::Watch { path } => {
            let (watch, snapshot, updates) = tree.watch_children(current, &path)?;
            *started = Some((watch, updates));
            Ok(CoordReply::Watching { watch, snapshot })
        }
        CoordRequest::Unwatch { watch } => {
            tree.unwatch(watch);
            Ok(CoordReply::Unwatched)
        }
        CoordRequest::Ping => Ok(CoordReply::Pong),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warprpc_common::transport::TcpTransport;

    struct RawClient {
        stream: TcpStream,
        decoder: FrameDecoder,
        next_id: u64,
    }

    impl RawClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpTransport::new().connect(&addr.to_string()).await.unwrap();
            Self {
                stream,
                decoder: FrameDecoder::new(),
                next_id: 1,
            }
        }

        async fn send(&mut self, request: CoordRequest) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            let frame = encode_message(&ClientMessage { id, request }).unwrap();
            self.stream.write_all(&frame).await.unwrap();
            id
        }

        async fn recv(&mut self) -> Option<ServerMessage> {
            let body = read_frame(&mut self.stream, &mut self.decoder).await.ok()??;
            Some(JsonCodec::deserialize(&body).unwrap())
        }

        async fn call(&mut self, request: CoordRequest) -> std::result::Result<CoordReply, TreeError> {
            let id = self.send(request).await;
            match self.recv().await.unwrap() {
                ServerMessage::Reply { id: reply_id, result } => {
                    assert_eq!(reply_id, id);
                    result
                }
                other => panic!("expected reply, got {:?}", other),
            }
        }
    }

    async fn start(timeout: Duration) -> (SocketAddr, Arc<NodeTree>, CancellationToken) {
        let server = CoordinatorServer::bind(
            CoordinatorConfig::default()
                .with_bind_addr("127.0.0.1:0")
                .with_session_timeout(timeout),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let tree = server.tree();
        let token = server.shutdown_token();
        server.spawn();
        (addr, tree, token)
    }

    #[tokio::test]
    async fn test_requests_need_a_session() {
        let (addr, _, token) = start(DEFAULT_SESSION_TIMEOUT).await;
        let mut client = RawClient::connect(addr).await;
        assert_eq!(
            client.call(CoordRequest::Ping).await,
            Err(TreeError::SessionExpired(0))
        );
        assert!(matches!(
            client.call(CoordRequest::OpenSession).await,
            Ok(CoordReply::Session { .. })
        ));
        assert_eq!(client.call(CoordRequest::Ping).await, Ok(CoordReply::Pong));
        token.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_removes_ephemerals() {
        let (addr, tree, token) = start(DEFAULT_SESSION_TIMEOUT).await;
        let mut client = RawClient::connect(addr).await;
        client.call(CoordRequest::OpenSession).await.unwrap();
        let created = client
            .call(CoordRequest::Create {
                path: "/warprpc/Echo/provider-".into(),
                data: b"{}".to_vec(),
                mode: CreateMode::EphemeralSequential,
            })
            .await
            .unwrap();
        let CoordReply::Created { path } = created else {
            panic!("unexpected reply {:?}", created);
        };
        assert!(tree.exists(&path));

        drop(client);
        for _ in 0..100 {
            if !tree.exists(&path) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!tree.exists(&path));
        token.cancel();
    }

    #[tokio::test]
    async fn test_watch_events_follow_reply() {
        let (addr, tree, token) = start(DEFAULT_SESSION_TIMEOUT).await;
        let mut watcher = RawClient::connect(addr).await;
        watcher.call(CoordRequest::OpenSession).await.unwrap();
        let reply = watcher
            .call(CoordRequest::Watch { path: "/warprpc/Echo".into() })
            .await
            .unwrap();
        let CoordReply::Watching { watch, snapshot } = reply else {
            panic!("unexpected reply {:?}", reply);
        };
        assert!(snapshot.children.is_empty());

        let session = tree.open_session();
        tree.create(session, "/warprpc/Echo/a", vec![], CreateMode::Ephemeral)
            .unwrap();

        match watcher.recv().await.unwrap() {
            ServerMessage::WatchEvent { watch: id, snapshot } => {
                assert_eq!(id, watch);
                assert_eq!(snapshot.children.len(), 1);
                assert!(snapshot.cversion > 0);
            }
            other => panic!("expected watch event, got {:?}", other),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_silent_session_expires() {
        let (addr, tree, token) = start(Duration::from_millis(100)).await;
        let mut client = RawClient::connect(addr).await;
        client.call(CoordRequest::OpenSession).await.unwrap();
        client
            .call(CoordRequest::Create {
                path: "/e".into(),
                data: vec![],
                mode: CreateMode::Ephemeral,
            })
            .await
            .unwrap();

        // No heartbeats: the server closes the connection
        assert!(client.recv().await.is_none());
        assert!(!tree.exists("/e"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_close_session_is_synchronous() {
        let (addr, tree, token) = start(DEFAULT_SESSION_TIMEOUT).await;
        let mut client = RawClient::connect(addr).await;
        client.call(CoordRequest::OpenSession).await.unwrap();
        client
            .call(CoordRequest::Create {
                path: "/e".into(),
                data: vec![],
                mode: CreateMode::Ephemeral,
            })
            .await
            .unwrap();
        assert_eq!(client.call(CoordRequest::CloseSession).await, Ok(CoordReply::Closed));
        assert!(!tree.exists("/e"));
        token.cancel();
    }
}
