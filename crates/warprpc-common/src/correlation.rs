//! Correlation of asynchronous replies with their waiting callers.
//!
//! The read side of a connection and the caller that issued a request never
//! talk directly. The caller registers its correlation id and waits on the
//! returned [`PendingReply`]; the reader task completes whatever id it
//! decodes. The map is sharded (`DashMap`), so concurrent inserts and takes
//! on different ids do not contend on a single lock.
//!
//! Dropping a [`PendingReply`] removes its id, so a caller that gives up
//! early (an outer timeout, a lost `select!` branch, an aborted task) leaves
//! nothing behind.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::protocol::error::{Result, WarprpcError};
use crate::protocol::RequestId;

/// Identifies the connection a pending request was written to.
pub type ConnectionId = u64;

struct Pending<T> {
    connection: ConnectionId,
    tx: oneshot::Sender<Result<T>>,
}

pub struct CorrelationCache<T> {
    pending: DashMap<RequestId, Pending<T>>,
}

impl<T> CorrelationCache<T> {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Registers a waiter for `id` before the request goes out.
    ///
    /// `id` must be unique among the requests in flight on this cache.
    pub fn register(&self, id: RequestId, connection: ConnectionId) -> PendingReply<'_, T> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { connection, tx });
        PendingReply {
            cache: self,
            id,
            rx: Some(rx),
        }
    }

    /// Hands `value` to the waiter of `id`.
    ///
    /// Returns `false` when nobody waits for `id` any more (the caller timed
    /// out or never existed); the value is dropped in that case.
    pub fn complete(&self, id: RequestId, value: T) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => pending.tx.send(Ok(value)).is_ok(),
            None => {
                tracing::debug!(id, "dropping reply without a waiter");
                false
            }
        }
    }

    /// Fails the waiter of `id` with `err`.
    pub fn fail(&self, id: RequestId, err: WarprpcError) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => pending.tx.send(Err(err)).is_ok(),
            None => false,
        }
    }

    /// Removes the entry for `id` without notifying anyone.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Fails every waiter whose request went out on `connection`.
    pub fn fail_connection<F>(&self, connection: ConnectionId, make_err: F) -> usize
    where
        F: Fn() -> WarprpcError,
    {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().connection == connection)
            .map(|entry| *entry.key())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self
                .pending
                .remove_if(&id, |_, pending| pending.connection == connection)
            {
                let _ = pending.tx.send(Err(make_err()));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }
}

impl<T> Default for CorrelationCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered id waiting for its reply.
///
/// The id stays in the cache until the reply arrives, the wait times out or
/// this value is dropped, whichever comes first.
pub struct PendingReply<'a, T> {
    cache: &'a CorrelationCache<T>,
    id: RequestId,
    rx: Option<oneshot::Receiver<Result<T>>>,
}

impl<T> PendingReply<'_, T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Waits up to `timeout` for the reply.
    pub async fn wait(mut self, timeout: Duration) -> Result<T> {
        let Some(rx) = self.rx.take() else {
            return Err(WarprpcError::ConnectionLost(format!(
                "reply channel for request {} closed",
                self.id
            )));
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WarprpcError::ConnectionLost(format!(
                "reply channel for request {} closed",
                self.id
            ))),
            Err(_) => Err(WarprpcError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

impl<T> Drop for PendingReply<'_, T> {
    fn drop(&mut self) {
        // No-op once the reply was taken out by `complete` or `fail`
        self.cache.cancel(self.id);
    }
}
