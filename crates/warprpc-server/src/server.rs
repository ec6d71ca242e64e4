use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warprpc_common::config::ServerConfig;
use warprpc_common::transport::{encode_frame, read_frame, Codec, FrameDecoder};
use warprpc_common::{Response, Result, WarprpcError};
use warprpc_registry::{Registry, RegistryEntry};

use crate::dispatcher::Dispatcher;
use crate::pool::RegistrationPool;
use crate::service::RpcService;

/// Responses buffered per connection before dispatch tasks wait on the writer
const OUTBOUND_CAPACITY: usize = 1024;

/// Outcome of a [`RpcServer::register_service`] call.
///
/// The service is callable as soon as `register_service` returns; awaiting
/// this handle tells whether publishing it in the registry succeeded.
pub struct PendingRegistration {
    rx: oneshot::Receiver<Result<RegistryEntry>>,
}

impl Future for PendingRegistration {
    type Output = Result<RegistryEntry>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(WarprpcError::Registry(
                    "registration was abandoned".to_string(),
                ))
            })
        })
    }
}

/// warprpc server.
///
/// Accepts connections, dispatches requests to registered services and
/// publishes every service as a provider entry in the registry.
///
/// # Example
///
/// ```no_run
/// use warprpc_common::config::ServerConfig;
/// use warprpc_server::{echo_service, RpcServer};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = RpcServer::start(ServerConfig::default()).await?;
/// let registration = server.register_service(echo_service()).await?;
/// let entry = registration.await?;
/// println!("published {:?}", entry.node_id);
///
/// tokio::time::sleep(std::time::Duration::from_secs(60)).await;
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct RpcServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    registry: Registry,
    owns_registry: bool,
    dispatcher: Arc<Dispatcher>,
    pool: RegistrationPool,
    registered: Arc<DashMap<String, RegistryEntry>>,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Connects to the configured registry and starts listening.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the registry is
    /// unreachable or the listening address cannot be bound.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Registry::start(&config.common).await?;
        let mut server = Self::start_with_registry(config, registry).await?;
        server.owns_registry = true;
        Ok(server)
    }

    /// Starts listening and publishes services through `registry`.
    ///
    /// The registry stays usable after [`RpcServer::stop`]; closing it is
    /// up to the caller.
    pub async fn start_with_registry(config: ServerConfig, registry: Registry) -> Result<Self> {
        config.validate()?;
        let bind_addr = format!("{}:{}", config.bind_host, config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| WarprpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| WarprpcError::Connection(format!("Failed to get local addr: {}", e)))?;

        let codec = Codec::new(config.common.serialize_kind);
        let dispatcher = Arc::new(Dispatcher::new());
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            dispatcher.clone(),
            codec,
            shutdown.clone(),
        ));

        info!(
            addr = %local_addr,
            serialize = %config.common.serialize_kind,
            application = %config.common.application_name,
            "server listening"
        );

        Ok(Self {
            pool: RegistrationPool::new(config.registration_workers, config.registration_queue),
            config,
            local_addr,
            registry,
            owns_registry: false,
            dispatcher,
            registered: Arc::new(DashMap::new()),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Makes `service` callable and publishes it in the registry.
    ///
    /// The service must expose exactly one interface, whose name becomes the
    /// service name. Publishing runs on the registration pool; await the
    /// returned handle for its outcome.
    ///
    /// # Errors
    ///
    /// Returns `AmbiguousService` when the service exposes zero or several
    /// interfaces.
    pub async fn register_service<S: RpcService>(&self, service: S) -> Result<PendingRegistration> {
        let interfaces = service.interfaces();
        let name = match interfaces.as_slice() {
            [single] => single.clone(),
            other => {
                error!(
                    interfaces = ?other,
                    "service must expose exactly one interface"
                );
                return Err(WarprpcError::AmbiguousService(format!(
                    "expected exactly one interface, found {}: {:?}",
                    other.len(),
                    other
                )));
            }
        };

        if self.dispatcher.insert(name.clone(), Arc::new(service)).is_some() {
            warn!(service = %name, "replacing previously registered implementation");
        }

        let entry = RegistryEntry::provider(
            name.clone(),
            self.config.advertise_host.clone(),
            self.local_addr.port(),
            self.config.common.application_name.clone(),
        )
        .with_attr("type", name.clone());

        let (tx, rx) = oneshot::channel();
        let registry = self.registry.clone();
        let registered = self.registered.clone();
        let shutdown = self.shutdown.clone();
        self.pool
            .submit(async move {
                let result = publish(&registry, &registered, &shutdown, name, entry).await;
                let _ = tx.send(result);
            })
            .await;

        Ok(PendingRegistration { rx })
    }

    /// Stops serving `name` and removes its provider entry.
    pub async fn unregister_service(&self, name: &str) -> Result<()> {
        self.dispatcher.remove(name);
        if let Some((_, entry)) = self.registered.remove(name) {
            self.registry.unregister(&entry).await?;
        }
        Ok(())
    }

    /// Stops accepting, closes every connection and unregisters the
    /// provider entries published by this server.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let entries: Vec<RegistryEntry> = self.registered.iter().map(|e| e.value().clone()).collect();
        self.registered.clear();
        for entry in entries {
            if let Err(e) = self.registry.unregister(&entry).await {
                warn!(service = %entry.service_name, error = %e, "failed to unregister on stop");
            }
        }

        if self.owns_registry {
            self.registry.close().await;
        }
        info!(addr = %self.local_addr, "server stopped");
    }
}

/// Registers `entry` unless the server stopped first.
///
/// `stop` cancels `shutdown` before draining `registered`, so an entry
/// inserted here is either drained by `stop` or seen cancelled right after
/// the insert and withdrawn again.
async fn publish(
    registry: &Registry,
    registered: &DashMap<String, RegistryEntry>,
    shutdown: &CancellationToken,
    name: String,
    entry: RegistryEntry,
) -> Result<RegistryEntry> {
    let stopped = || {
        WarprpcError::Registry(format!("server stopped before {} was published", name))
    };
    if shutdown.is_cancelled() {
        debug!(service = %name, "skipping registration, server stopped");
        return Err(stopped());
    }

    let entry = match registry.register(entry).await {
        Ok(entry) => entry,
        Err(e) => {
            error!(service = %name, error = %e, "failed to publish service");
            return Err(e);
        }
    };
    registered.insert(name.clone(), entry.clone());

    if shutdown.is_cancelled() {
        registered.remove_if(&name, |_, current| current.node_id == entry.node_id);
        if let Err(e) = registry.unregister(&entry).await {
            warn!(service = %name, error = %e, "failed to withdraw late registration");
        }
        return Err(stopped());
    }

    info!(service = %name, node = ?entry.node_id, "service published");
    Ok(entry)
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    codec: Codec,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection established");
                        let dispatcher = dispatcher.clone();
                        let shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            match serve_connection(stream, dispatcher, codec, shutdown).await {
                                Ok(()) => debug!(%peer, "connection closed"),
                                Err(e) => warn!(%peer, error = %e, "connection closed with error"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// Serves one connection until the peer leaves, the stream turns out not to
/// be warprpc traffic, or the server stops.
///
/// Requests are dispatched concurrently; responses go out in completion
/// order through a single writer task.
async fn serve_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    codec: Codec,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
    tokio::spawn(write_loop(writer, rx, shutdown.clone()));

    let mut decoder = FrameDecoder::new();
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_frame(&mut reader, &mut decoder) => frame,
        };
        let body = match frame? {
            Some(body) => body,
            None => return Ok(()),
        };

        let dispatcher = dispatcher.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = dispatcher.handle(codec, &body).await;
            if let Some(frame) = encode_response(codec, &response) {
                // Fails only when the connection is already gone
                let _ = tx.send(frame).await;
            }
        });
    }
}

fn encode_response(codec: Codec, response: &Response) -> Option<Bytes> {
    let encoded = codec
        .encode_response(response)
        .or_else(|e| {
            error!(id = response.id, error = %e, "failed to encode response");
            codec.encode_response(&Response::from_error(response.id, &e))
        })
        .and_then(|body| encode_frame(&body));
    match encoded {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(id = response.id, error = %e, "dropping response");
            None
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
