use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{BackendError, BackendResult, ChildWatch, SessionEvent};
use crate::tree::{ChildrenSnapshot, CreateMode, NodeTree, SessionId, WatchId};

/// Backend over a [`NodeTree`] in this process.
///
/// Several backends may share one tree, each with its own session, which is
/// how tests stand up a provider and a consumer without any network.
pub struct MemoryBackend {
    tree: Arc<NodeTree>,
    session: Mutex<Option<SessionId>>,
    events: broadcast::Sender<SessionEvent>,
}

impl MemoryBackend {
    pub fn new(tree: Arc<NodeTree>) -> Self {
        let session = tree.open_session();
        let (events, _) = broadcast::channel(16);
        Self {
            tree,
            session: Mutex::new(Some(session)),
            events,
        }
    }

    pub fn tree(&self) -> &Arc<NodeTree> {
        &self.tree
    }

    pub fn session(&self) -> Option<SessionId> {
        *self.session.lock()
    }

    fn current_session(&self) -> BackendResult<SessionId> {
        self.session()
            .ok_or_else(|| BackendError::Unavailable("backend closed".to_string()))
    }

    /// Drops the current session as if it had timed out and opens a new one.
    pub fn expire_session(&self) {
        let mut session = self.session.lock();
        let Some(old) = *session else {
            return;
        };
        self.tree.close_session(old);
        *session = Some(self.tree.open_session());
        drop(session);
        tracing::info!(session = old, "memory backend session expired");
        let _ = self.events.send(SessionEvent::Expired(old));
    }

    pub(super) fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> BackendResult<String> {
        let session = self.current_session()?;
        Ok(self.tree.create(session, path, data, mode)?)
    }

    pub(super) fn delete(&self, path: &str) -> BackendResult<()> {
        self.current_session()?;
        Ok(self.tree.delete(path)?)
    }

    pub(super) fn children(&self, path: &str) -> BackendResult<ChildrenSnapshot> {
        self.current_session()?;
        Ok(self.tree.children(path)?)
    }

    pub(super) fn watch_children(&self, path: &str) -> BackendResult<ChildWatch> {
        let session = self.current_session()?;
        let (id, initial, updates) = self.tree.watch_children(session, path)?;
        Ok(ChildWatch {
            id,
            initial,
            updates,
        })
    }

    pub(super) fn unwatch(&self, watch: WatchId) {
        self.tree.unwatch(watch);
    }

    pub(super) fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(super) fn close(&self) {
        if let Some(session) = self.session.lock().take() {
            self.tree.close_session(session);
        }
    }
}
