use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use warprpc_common::correlation::CorrelationCache;
use warprpc_common::transport::{Codec, TcpTransport};
use warprpc_common::{Response, Result};

use crate::connection::Connection;

/// Connection to one address, or nothing while none is open.
///
/// The slot's lock is held across the dial, so concurrent callers for the
/// same address never open two connections. Other addresses have their own
/// slots and are not held up by a slow dial.
type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

/// Connection pool keyed by provider address.
///
/// Holds at most one [`Connection`] per address. Connections are
/// multiplexed, so every caller targeting an address shares it instead of
/// checking one out. A connection found closed on lookup is evicted and a
/// fresh one is dialed in its place.
///
/// # Example
///
/// ```rust,no_run
/// use warprpc_client::ConnectionPool;
/// use warprpc_common::transport::Codec;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ConnectionPool::new(Codec::default());
/// let conn = pool.get("127.0.0.1:9000").await?;
/// assert!(!conn.is_closed());
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    transport: TcpTransport,
    codec: Codec,
    pending: Arc<CorrelationCache<Response>>,
    slots: DashMap<String, Slot>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(codec: Codec) -> Self {
        Self::with_transport(TcpTransport::new(), codec)
    }

    pub fn with_transport(transport: TcpTransport, codec: Codec) -> Self {
        Self {
            transport,
            codec,
            pending: Arc::new(CorrelationCache::new()),
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn slot(&self, addr: &str) -> Slot {
        self.slots.entry(addr.to_string()).or_default().clone()
    }

    /// Returns the live connection to `addr`, dialing one if needed.
    ///
    /// # Errors
    ///
    /// Returns a `Connection` error if the address cannot be reached.
    pub async fn get(&self, addr: &str) -> Result<Arc<Connection>> {
        let slot = self.slot(addr);
        let mut current = slot.lock().await;

        if let Some(conn) = current.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            tracing::debug!(%addr, connection = conn.id(), "evicting closed connection");
            *current = None;
        }

        let stream = self.transport.connect(addr).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            id,
            addr,
            stream,
            self.codec,
            self.pending.clone(),
        ));
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Drops the connection to `addr`, failing its in-flight calls.
    pub async fn remove(&self, addr: &str) -> bool {
        let Some((_, slot)) = self.slots.remove(addr) else {
            return false;
        };
        let conn = slot.lock().await.take();
        match conn {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        self.slots.clear();
        for slot in slots {
            if let Some(conn) = slot.lock().await.take() {
                conn.close();
            }
        }
    }

    /// Number of addresses with an open connection.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut open = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                open += 1;
            }
        }
        open
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Calls still waiting for a response, across all connections.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
