//! In-memory coordination tree.
//!
//! A hierarchy of nodes addressed by slash-separated paths, in the style of
//! a znode store. Nodes are persistent or owned by a session (ephemeral);
//! ephemeral nodes disappear when their session closes. Sequential creation
//! appends a zero-padded counter kept by the parent. Every child create or
//! delete bumps the parent's `cversion` and pushes a full children snapshot
//! to the parent's watchers.
//!
//! All mutation happens under one lock and watch notifications are sent
//! while it is held, so every watcher observes snapshots in `cversion`
//! order.

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub type SessionId = u64;
pub type WatchId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TreeError {
    #[error("node {0} does not exist")]
    NoNode(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("node {0} has children")]
    NotEmpty(String),

    #[error("session {0} has expired")]
    SessionExpired(SessionId),

    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("ephemeral node {0} cannot have children")]
    EphemeralParent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildData {
    /// Full path of the child
    pub path: String,
    pub data: Vec<u8>,
}

/// Children of one node together with the node's child version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildrenSnapshot {
    pub path: String,
    pub cversion: u64,
    pub children: Vec<ChildData>,
}

struct Node {
    data: Vec<u8>,
    owner: Option<SessionId>,
    children: BTreeSet<String>,
    cversion: u64,
    next_seq: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<SessionId>) -> Self {
        Self {
            data,
            owner,
            children: BTreeSet::new(),
            cversion: 0,
            next_seq: 0,
        }
    }
}

struct Watcher {
    id: WatchId,
    session: SessionId,
    tx: mpsc::UnboundedSender<ChildrenSnapshot>,
}

struct State {
    nodes: HashMap<String, Node>,
    sessions: HashMap<SessionId, HashSet<String>>,
    watchers: HashMap<String, Vec<Watcher>>,
    next_session: SessionId,
    next_watch: WatchId,
}

pub struct NodeTree {
    state: Mutex<State>,
}

impl NodeTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self {
            state: Mutex::new(State {
                nodes,
                sessions: HashMap::new(),
                watchers: HashMap::new(),
                next_session: 0,
                next_watch: 0,
            }),
        }
    }

    pub fn open_session(&self) -> SessionId {
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(id, HashSet::new());
        tracing::debug!(session = id, "session opened");
        id
    }

    /// Ends a session: deletes its ephemeral nodes and drops its watches.
    ///
    /// Returns `false` if the session was already gone.
    pub fn close_session(&self, session: SessionId) -> bool {
        let mut state = self.state.lock();
        let Some(owned) = state.sessions.remove(&session) else {
            return false;
        };

        let mut owned: Vec<String> = owned.into_iter().collect();
        owned.sort();
        for path in &owned {
            if let Err(e) = state.remove_node(path) {
                tracing::warn!(session, path = %path, error = %e, "failed to remove ephemeral node");
            }
        }

        for watchers in state.watchers.values_mut() {
            watchers.retain(|w| w.session != session);
        }
        state.watchers.retain(|_, watchers| !watchers.is_empty());

        tracing::debug!(session, removed = owned.len(), "session closed");
        true
    }

    pub fn session_alive(&self, session: SessionId) -> bool {
        self.state.lock().sessions.contains_key(&session)
    }

    /// Creates a node, creating missing ancestors as persistent nodes.
    ///
    /// Returns the path actually created, which differs from `path` for
    /// sequential modes.
    pub fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, TreeError> {
        validate_path(path)?;
        if path == "/" {
            return Err(TreeError::NodeExists(path.to_string()));
        }

        let mut state = self.state.lock();
        if mode.is_ephemeral() && !state.sessions.contains_key(&session) {
            return Err(TreeError::SessionExpired(session));
        }

        let parent = parent_of(path).to_string();
        state.ensure_path(&parent)?;

        let full = if mode.is_sequential() {
            let parent_node = state
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| TreeError::NoNode(parent.clone()))?;
            let seq = parent_node.next_seq;
            parent_node.next_seq += 1;
            format!("{}{:010}", path, seq)
        } else {
            path.to_string()
        };

        if state.nodes.contains_key(&full) {
            return Err(TreeError::NodeExists(full));
        }

        let owner = mode.is_ephemeral().then_some(session);
        state.insert_node(&full, data, owner)?;
        Ok(full)
    }

    pub fn delete(&self, path: &str) -> Result<(), TreeError> {
        validate_path(path)?;
        if path == "/" {
            return Err(TreeError::InvalidPath(path.to_string()));
        }
        self.state.lock().remove_node(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub fn get_data(&self, path: &str) -> Result<Vec<u8>, TreeError> {
        self.state
            .lock()
            .nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| TreeError::NoNode(path.to_string()))
    }

    pub fn children(&self, path: &str) -> Result<ChildrenSnapshot, TreeError> {
        validate_path(path)?;
        self.state.lock().snapshot(path)
    }

    /// Subscribes to child changes of `path`, creating it if missing.
    ///
    /// The returned snapshot is the state at subscription time; the receiver
    /// yields a fresh snapshot after every later change. The watch persists
    /// until [`NodeTree::unwatch`] or until its session closes, at which
    /// point the receiver ends.
    pub fn watch_children(
        &self,
        session: SessionId,
        path: &str,
    ) -> Result<(WatchId, ChildrenSnapshot, mpsc::UnboundedReceiver<ChildrenSnapshot>), TreeError>
    {
        validate_path(path)?;
        let mut state = self.state.lock();
        if !state.sessions.contains_key(&session) {
            return Err(TreeError::SessionExpired(session));
        }
        state.ensure_path(path)?;
        let snapshot = state.snapshot(path)?;

        state.next_watch += 1;
        let id = state.next_watch;
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .watchers
            .entry(path.to_string())
            .or_default()
            .push(Watcher { id, session, tx });
        Ok((id, snapshot, rx))
    }

    pub fn unwatch(&self, watch: WatchId) -> bool {
        let mut state = self.state.lock();
        let mut found = false;
        for watchers in state.watchers.values_mut() {
            let before = watchers.len();
            watchers.retain(|w| w.id != watch);
            found |= watchers.len() != before;
        }
        state.watchers.retain(|_, watchers| !watchers.is_empty());
        found
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn ensure_path(&mut self, path: &str) -> Result<(), TreeError> {
        let mut missing = Vec::new();
        let mut current = path;
        while !self.nodes.contains_key(current) {
            missing.push(current.to_string());
            current = parent_of(current);
        }
        for p in missing.into_iter().rev() {
            self.insert_node(&p, Vec::new(), None)?;
        }
        Ok(())
    }

    fn insert_node(
        &mut self,
        path: &str,
        data: Vec<u8>,
        owner: Option<SessionId>,
    ) -> Result<(), TreeError> {
        let parent = parent_of(path).to_string();
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| TreeError::NoNode(parent.clone()))?;
        if parent_node.owner.is_some() {
            return Err(TreeError::EphemeralParent(parent));
        }
        parent_node.children.insert(name_of(path).to_string());
        parent_node.cversion += 1;

        self.nodes.insert(path.to_string(), Node::new(data, owner));
        if let Some(session) = owner {
            self.sessions
                .entry(session)
                .or_default()
                .insert(path.to_string());
        }
        self.notify(&parent);
        Ok(())
    }

    fn remove_node(&mut self, path: &str) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| TreeError::NoNode(path.to_string()))?;
        if !node.children.is_empty() {
            return Err(TreeError::NotEmpty(path.to_string()));
        }
        let owner = node.owner;
        self.nodes.remove(path);

        if let Some(session) = owner {
            if let Some(owned) = self.sessions.get_mut(&session) {
                owned.remove(path);
            }
        }

        let parent = parent_of(path).to_string();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.remove(name_of(path));
            parent_node.cversion += 1;
        }
        self.notify(&parent);
        Ok(())
    }

    fn snapshot(&self, path: &str) -> Result<ChildrenSnapshot, TreeError> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| TreeError::NoNode(path.to_string()))?;
        let children = node
            .children
            .iter()
            .map(|name| {
                let child_path = join(path, name);
                let data = self
                    .nodes
                    .get(&child_path)
                    .map(|n| n.data.clone())
                    .unwrap_or_default();
                ChildData {
                    path: child_path,
                    data,
                }
            })
            .collect();
        Ok(ChildrenSnapshot {
            path: path.to_string(),
            cversion: node.cversion,
            children,
        })
    }

    fn notify(&mut self, path: &str) {
        if !self.watchers.contains_key(path) {
            return;
        }
        let Ok(snapshot) = self.snapshot(path) else {
            return;
        };
        if let Some(watchers) = self.watchers.get_mut(path) {
            // Receivers that went away are pruned here
            watchers.retain(|w| w.tx.send(snapshot.clone()).is_ok());
        }
    }
}

fn validate_path(path: &str) -> Result<(), TreeError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(TreeError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn name_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
