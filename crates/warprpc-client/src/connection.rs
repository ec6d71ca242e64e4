//! Multiplexed client connection.
//!
//! Many calls share one TCP stream. Each call registers its correlation id,
//! hands an encoded envelope to the writer task and waits; the reader task
//! completes ids as responses arrive, in whatever order the server finishes
//! them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warprpc_common::correlation::{ConnectionId, CorrelationCache};
use warprpc_common::transport::{encode_frame, read_frame, Codec, FrameDecoder};
use warprpc_common::{Request, Response, Result, WarprpcError};

/// Envelopes queued for the writer before callers wait for room
const OUTBOUND_CAPACITY: usize = 1024;

pub struct Connection {
    id: ConnectionId,
    addr: String,
    codec: Codec,
    outbound: mpsc::Sender<Bytes>,
    pending: Arc<CorrelationCache<Response>>,
    closed: CancellationToken,
}

impl Connection {
    /// Wraps an established stream and starts its reader and writer tasks.
    ///
    /// `pending` may be shared between connections; `id` tells them apart
    /// when one of them fails.
    pub fn new(
        id: ConnectionId,
        addr: impl Into<String>,
        stream: TcpStream,
        codec: Codec,
        pending: Arc<CorrelationCache<Response>>,
    ) -> Self {
        let addr = addr.into();
        let (reader, writer) = stream.into_split();
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(writer, rx, closed.clone()));
        tokio::spawn(read_loop(
            id,
            addr.clone(),
            reader,
            codec,
            pending.clone(),
            closed.clone(),
        ));

        debug!(connection = id, %addr, "connection opened");
        Self {
            id,
            addr,
            codec,
            outbound,
            pending,
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Sends `request` and waits up to `timeout` for its response.
    ///
    /// # Errors
    ///
    /// - `Timeout` when no response arrives in time; the connection stays up
    /// - `ConnectionLost` when the connection fails before the response
    /// - encoding errors if the request cannot be serialized
    ///
    /// Dropping the returned future before it resolves forgets the request;
    /// a reply arriving later is discarded.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        // Dropping `reply` on any early return, or when the caller abandons
        // this future, releases the id
        let reply = self.pending.register(request.id, self.id);
        if self.is_closed() {
            return Err(self.lost());
        }

        let frame = self
            .codec
            .encode_request(&request)
            .and_then(|body| encode_frame(&body))?;

        if self.outbound.send(frame).await.is_err() {
            return Err(self.lost());
        }

        reply.wait(timeout).await
    }

    /// Closes the connection, failing every call still waiting on it.
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn lost(&self) -> WarprpcError {
        WarprpcError::ConnectionLost(format!("connection to {} is closed", self.addr))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, closed: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.write_all(&frame).await {
            warn!(error = %e, "write failed, closing connection");
            break;
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
}

async fn read_loop(
    id: ConnectionId,
    addr: String,
    mut reader: OwnedReadHalf,
    codec: Codec,
    pending: Arc<CorrelationCache<Response>>,
    closed: CancellationToken,
) {
    let mut decoder = FrameDecoder::new();
    let reason = loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break "closed locally".to_string(),
            frame = read_frame(&mut reader, &mut decoder) => frame,
        };
        match frame {
            Ok(Some(body)) => match codec.decode_response(&body) {
                Ok(response) => {
                    pending.complete(response.id, response);
                }
                Err(e) => warn!(connection = id, error = %e, "dropping undecodable response"),
            },
            Ok(None) => break "closed by peer".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    closed.cancel();
    let failed = pending.fail_connection(id, || {
        WarprpcError::ConnectionLost(format!("connection to {} {}", addr, reason))
    });
    debug!(connection = id, %addr, %reason, failed, "connection closed");
}
