//! Coordination backends.
//!
//! The registry talks to the coordination tree through [`Backend`], which
//! is either the tree itself living in this process ([`MemoryBackend`]) or
//! a TCP client for a [`CoordinatorServer`](crate::coordinator::CoordinatorServer)
//! ([`RemoteBackend`]). Both expose the same session semantics: ephemeral
//! nodes belong to the backend's current session, and losing that session
//! is reported through [`Backend::session_events`].

mod memory;
mod remote;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use warprpc_common::WarprpcError;

use crate::tree::{ChildrenSnapshot, CreateMode, SessionId, TreeError, WatchId};

pub use memory::MemoryBackend;
pub use remote::{RemoteBackend, RemoteBackendConfig};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("coordination backend unavailable: {0}")]
    Unavailable(String),
}

impl From<BackendError> for WarprpcError {
    fn from(err: BackendError) -> Self {
        WarprpcError::Registry(err.to_string())
    }
}

impl From<WarprpcError> for BackendError {
    fn from(err: WarprpcError) -> Self {
        BackendError::Unavailable(err.to_string())
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Session lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session ended; its ephemeral nodes are gone.
    Expired(SessionId),
}

/// A persistent child watch.
///
/// `updates` ends when the watch is cancelled or the owning session is lost.
pub struct ChildWatch {
    pub id: WatchId,
    pub initial: ChildrenSnapshot,
    pub updates: mpsc::UnboundedReceiver<ChildrenSnapshot>,
}

pub enum Backend {
    Memory(MemoryBackend),
    Remote(RemoteBackend),
}

impl Backend {
    pub async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> BackendResult<String> {
        match self {
            Backend::Memory(b) => b.create(path, data, mode),
            Backend::Remote(b) => b.create(path, data, mode).await,
        }
    }

    pub async fn delete(&self, path: &str) -> BackendResult<()> {
        match self {
            Backend::Memory(b) => b.delete(path),
            Backend::Remote(b) => b.delete(path).await,
        }
    }

    pub async fn children(&self, path: &str) -> BackendResult<ChildrenSnapshot> {
        match self {
            Backend::Memory(b) => b.children(path),
            Backend::Remote(b) => b.children(path).await,
        }
    }

    pub async fn watch_children(&self, path: &str) -> BackendResult<ChildWatch> {
        match self {
            Backend::Memory(b) => b.watch_children(path),
            Backend::Remote(b) => b.watch_children(path).await,
        }
    }

    pub async fn unwatch(&self, watch: WatchId) -> BackendResult<()> {
        match self {
            Backend::Memory(b) => {
                b.unwatch(watch);
                Ok(())
            }
            Backend::Remote(b) => b.unwatch(watch).await,
        }
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        match self {
            Backend::Memory(b) => b.session_events(),
            Backend::Remote(b) => b.session_events(),
        }
    }

    /// Ends the current session. Ephemeral nodes of the session disappear.
    pub async fn close(&self) {
        match self {
            Backend::Memory(b) => b.close(),
            Backend::Remote(b) => b.close().await,
        }
    }
}

impl From<MemoryBackend> for Backend {
    fn from(backend: MemoryBackend) -> Self {
        Backend::Memory(backend)
    }
}

impl From<RemoteBackend> for Backend {
    fn from(backend: RemoteBackend) -> Self {
        Backend::Remote(backend)
    }
}
