use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warprpc_common::config::{CommonConfig, RegistryKind};
use warprpc_common::{Result, WarprpcError};

use crate::backend::{
    Backend, BackendError, ChildWatch, MemoryBackend, RemoteBackend, RemoteBackendConfig,
    SessionEvent,
};
use crate::cache::RegistryCache;
use crate::entry::{service_path, RegistryEntry, Role, ServiceUpdateEvent};
use crate::tree::{ChildrenSnapshot, CreateMode, NodeTree, TreeError};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Backoff applied when a watch has to be re-established or owned entries
/// have to be registered again.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff in milliseconds
    ///
    /// Default: 50ms
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds
    ///
    /// Default: 5000ms (5 seconds)
    pub max_backoff_ms: u64,
    /// Exponential backoff multiplier
    ///
    /// Default: 2.0 (doubles each time)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn next_backoff(&self, current_ms: u64) -> u64 {
        std::cmp::min(
            (current_ms as f64 * self.backoff_multiplier) as u64,
            self.max_backoff_ms,
        )
    }
}

/// Registry client.
///
/// Keeps this process's provider and consumer entries registered in the
/// coordination backend and mirrors the membership of subscribed services
/// into a [`RegistryCache`].
///
/// Cloning is cheap; clones share the same backend session and cache.
///
/// # Example
///
/// ```no_run
/// use warprpc_common::config::CommonConfig;
/// use warprpc_registry::{Registry, RegistryEntry};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Registry::start(&CommonConfig::default()).await?;
/// registry
///     .register(RegistryEntry::provider("Echo", "127.0.0.1", 9000, "demo"))
///     .await?;
///
/// registry.subscribe("Echo").await?;
/// let providers = registry.query_providers("Echo").await?;
/// assert_eq!(providers.len(), 1);
///
/// registry.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Backend,
    cache: RegistryCache,
    subscriptions: DashMap<String, CancellationToken>,
    updates: broadcast::Sender<ServiceUpdateEvent>,
    retry: RetryConfig,
    shutdown: CancellationToken,
}

impl Registry {
    /// Connects to the configured coordination backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the backend
    /// cannot be reached.
    pub async fn start(config: &CommonConfig) -> Result<Self> {
        config.validate()?;
        let backend = match config.registry_kind {
            RegistryKind::Coordinator => {
                let remote =
                    RemoteBackend::connect(RemoteBackendConfig::new(&config.registry_addr)).await?;
                Backend::from(remote)
            }
        };
        info!(
            kind = %config.registry_kind,
            addr = %config.registry_addr,
            "registry started"
        );
        Ok(Self::with_backend(backend))
    }

    /// Registry over an in-process tree.
    pub fn in_memory(tree: Arc<NodeTree>) -> Self {
        Self::with_backend(MemoryBackend::new(tree).into())
    }

    pub fn with_backend(backend: Backend) -> Self {
        Self::with_retry_config(backend, RetryConfig::default())
    }

    pub fn with_retry_config(backend: Backend, retry: RetryConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let events = backend.session_events();
        let inner = Arc::new(Inner {
            backend,
            cache: RegistryCache::new(),
            subscriptions: DashMap::new(),
            updates,
            retry,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(session_monitor(inner.clone(), events));
        Self { inner }
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    pub fn cache(&self) -> &RegistryCache {
        &self.inner.cache
    }

    /// Stream of every snapshot applied to the cache.
    pub fn updates(&self) -> broadcast::Receiver<ServiceUpdateEvent> {
        self.inner.updates.subscribe()
    }

    /// Publishes `entry` and returns it with its node identity filled in.
    ///
    /// Registering the same member twice returns the existing entry. A
    /// different member under the same service and role replaces the old
    /// one.
    pub async fn register(&self, entry: RegistryEntry) -> Result<RegistryEntry> {
        if let Some(existing) = self.inner.cache.owned(&entry.service_name, entry.role) {
            if existing.same_member(&entry) {
                debug!(
                    service = %entry.service_name,
                    role = %entry.role,
                    "entry already registered"
                );
                return Ok(existing);
            }
            self.unregister(&existing).await?;
        }

        let path = self.inner.create_node(&entry).await?;
        let mut registered = entry;
        registered.node_id = Some(path.clone());
        self.inner.cache.insert_owned(registered.clone());
        info!(
            service = %registered.service_name,
            role = %registered.role,
            node = %path,
            "registered"
        );
        Ok(registered)
    }

    /// Removes `entry` from the backend. Unknown or already removed entries
    /// are not an error.
    pub async fn unregister(&self, entry: &RegistryEntry) -> Result<()> {
        let node_id = entry.node_id.clone().or_else(|| {
            self.inner
                .cache
                .owned(&entry.service_name, entry.role)
                .filter(|owned| owned.same_member(entry))
                .and_then(|owned| owned.node_id)
        });
        let Some(node_id) = node_id else {
            debug!(service = %entry.service_name, "nothing to unregister");
            return Ok(());
        };

        match self.inner.backend.delete(&node_id).await {
            Ok(()) | Err(BackendError::Tree(TreeError::NoNode(_))) => {}
            Err(e) => return Err(e.into()),
        }
        self.inner
            .cache
            .remove_owned(&entry.service_name, entry.role, &node_id);
        info!(service = %entry.service_name, node = %node_id, "unregistered");
        Ok(())
    }

    /// Starts mirroring `service` into the cache.
    ///
    /// The current membership is applied and returned right away; later
    /// changes are applied as they happen and published on
    /// [`Registry::updates`]. Subscribing again is a no-op.
    pub async fn subscribe(&self, service: &str) -> Result<ServiceUpdateEvent> {
        if self.inner.subscriptions.contains_key(service) {
            if let Some(snapshot) = self.inner.cache.snapshot(service) {
                return Ok(ServiceUpdateEvent {
                    service_name: service.to_string(),
                    version: snapshot.version,
                    entries: snapshot.entries.clone(),
                });
            }
        }

        let watch = self
            .inner
            .backend
            .watch_children(&service_path(service))
            .await?;
        let event = to_event(service, &watch.initial);

        let token = self.inner.shutdown.child_token();
        let inserted = match self.inner.subscriptions.entry(service.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                true
            }
        };
        if !inserted {
            // Lost a race with a concurrent subscribe
            let _ = self.inner.backend.unwatch(watch.id).await;
            return Ok(event);
        }

        self.inner.publish(&event);
        info!(
            service,
            version = event.version,
            providers = event.providers().count(),
            "subscribed"
        );
        tokio::spawn(watch_loop(
            self.inner.clone(),
            service.to_string(),
            watch,
            token,
        ));
        Ok(event)
    }

    /// Stops mirroring `service` and drops its cached snapshot.
    pub fn unsubscribe(&self, service: &str) -> bool {
        match self.inner.subscriptions.remove(service) {
            Some((_, token)) => {
                token.cancel();
                self.inner.cache.remove(service);
                info!(service, "unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, service: &str) -> bool {
        self.inner.subscriptions.contains_key(service)
    }

    /// Providers of `service`, from the cache when the service is mirrored
    /// and from the backend otherwise.
    pub async fn query_providers(&self, service: &str) -> Result<Vec<RegistryEntry>> {
        self.query(service, Role::Provider).await
    }

    /// Consumers of `service`, from the cache when the service is mirrored
    /// and from the backend otherwise.
    pub async fn query_consumers(&self, service: &str) -> Result<Vec<RegistryEntry>> {
        self.query(service, Role::Consumer).await
    }

    async fn query(&self, service: &str, role: Role) -> Result<Vec<RegistryEntry>> {
        if let Some(snapshot) = self.inner.cache.snapshot(service) {
            return Ok(snapshot
                .entries
                .iter()
                .filter(|e| e.role == role)
                .cloned()
                .collect());
        }

        match self.inner.backend.children(&service_path(service)).await {
            Ok(snapshot) => Ok(to_event(service, &snapshot)
                .entries
                .into_iter()
                .filter(|e| e.role == role)
                .collect()),
            Err(BackendError::Tree(TreeError::NoNode(_))) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies a snapshot as if it had come from the backend.
    ///
    /// Returns `false` when the snapshot is older than the cached one.
    pub fn apply_update(&self, event: &ServiceUpdateEvent) -> bool {
        self.inner.publish(event)
    }

    /// Unregisters owned entries, stops every watch and ends the session.
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.subscriptions.clear();

        for entry in self.inner.cache.owned_entries() {
            if let Err(e) = self.unregister(&entry).await {
                warn!(service = %entry.service_name, error = %e, "failed to unregister on close");
            }
        }
        self.inner.backend.close().await;
        info!("registry closed");
    }
}

impl Inner {
    fn publish(&self, event: &ServiceUpdateEvent) -> bool {
        if !self.cache.apply(event) {
            return false;
        }
        // No receivers is fine
        let _ = self.updates.send(event.clone());
        true
    }

    /// Publishes the first snapshot of a re-established watch. Versions
    /// only order snapshots of one watch, so the cached one is dropped.
    fn publish_fresh(&self, event: &ServiceUpdateEvent) {
        self.cache.replace(event);
        let _ = self.updates.send(event.clone());
    }

    async fn create_node(&self, entry: &RegistryEntry) -> std::result::Result<String, BackendError> {
        let mut stored = entry.clone();
        stored.node_id = None;
        let data = serde_json::to_vec(&stored).map_err(WarprpcError::from)?;
        self.backend
            .create(&entry.node_prefix(), data, CreateMode::EphemeralSequential)
            .await
    }

    /// Registers every owned entry again after the session that held them
    /// was lost, retrying with backoff until all succeed.
    async fn reregister_owned(&self) {
        let mut pending = self.cache.owned_entries();
        let mut backoff_ms = self.retry.initial_backoff_ms;

        while !pending.is_empty() {
            let mut failed = Vec::new();
            for entry in pending {
                match self.create_node(&entry).await {
                    Ok(path) => {
                        if self.cache.owned(&entry.service_name, entry.role).is_none() {
                            // Unregistered meanwhile
                            let _ = self.backend.delete(&path).await;
                            continue;
                        }
                        info!(service = %entry.service_name, node = %path, "registered again");
                        let mut entry = entry;
                        entry.node_id = Some(path);
                        self.cache.insert_owned(entry);
                    }
                    Err(e) => {
                        warn!(service = %entry.service_name, error = %e, "re-registration failed");
                        failed.push(entry);
                    }
                }
            }
            if failed.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            }
            backoff_ms = self.retry.next_backoff(backoff_ms);
            pending = failed;
        }
    }

    async fn resubscribe(&self, path: &str, token: &CancellationToken) -> Option<ChildWatch> {
        let mut backoff_ms = self.retry.initial_backoff_ms;
        loop {
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            }
            match self.backend.watch_children(path).await {
                Ok(watch) => {
                    info!(path, "watch re-established");
                    return Some(watch);
                }
                Err(e) => {
                    warn!(path, error = %e, backoff_ms, "resubscribe failed");
                    backoff_ms = self.retry.next_backoff(backoff_ms);
                }
            }
        }
    }
}

async fn session_monitor(inner: Arc<Inner>, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(SessionEvent::Expired(session)) => {
                warn!(session, "registry session expired");
                inner.reregister_owned().await;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed session events");
                inner.reregister_owned().await;
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn watch_loop(
    inner: Arc<Inner>,
    service: String,
    watch: ChildWatch,
    token: CancellationToken,
) {
    let path = service_path(&service);
    let mut watch_id = watch.id;
    let mut updates = watch.updates;

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = updates.recv() => next,
        };
        match next {
            Some(snapshot) => {
                if token.is_cancelled() {
                    break;
                }
                let event = to_event(&service, &snapshot);
                if inner.publish(&event) {
                    debug!(
                        service = %service,
                        version = event.version,
                        entries = event.entries.len(),
                        "service membership changed"
                    );
                }
            }
            None => {
                warn!(service = %service, "watch stream ended, resubscribing");
                let Some(watch) = inner.resubscribe(&path, &token).await else {
                    break;
                };
                let event = to_event(&service, &watch.initial);
                inner.publish_fresh(&event);
                info!(
                    service = %service,
                    version = event.version,
                    providers = event.providers().count(),
                    "resynchronized after resubscribe"
                );
                watch_id = watch.id;
                updates = watch.updates;
            }
        }
    }

    let _ = inner.backend.unwatch(watch_id).await;
    debug!(service = %service, "watch loop stopped");
}

/// Decodes the children of a service node. Malformed nodes are skipped.
fn to_event(service: &str, snapshot: &ChildrenSnapshot) -> ServiceUpdateEvent {
    let entries = snapshot
        .children
        .iter()
        .filter_map(|child| match serde_json::from_slice::<RegistryEntry>(&child.data) {
            Ok(mut entry) => {
                entry.node_id = Some(child.path.clone());
                Some(entry)
            }
            Err(e) => {
                warn!(path = %child.path, error = %e, "skipping malformed registry node");
                None
            }
        })
        .collect();
    ServiceUpdateEvent {
        service_name: service.to_string(),
        version: snapshot.cversion,
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ChildData;

    #[test]
    fn test_exponential_backoff_calculation() {
        let config = RetryConfig::default();
        let mut backoff_ms = config.initial_backoff_ms;
        let expected = [50, 100, 200, 400, 800, 1600, 3200, 5000, 5000];
        for expected_ms in expected {
            assert_eq!(backoff_ms, expected_ms);
            backoff_ms = config.next_backoff(backoff_ms);
        }
    }

    #[test]
    fn test_to_event_skips_malformed_nodes() {
        let good = RegistryEntry::provider("Echo", "h", 1, "app");
        let snapshot = ChildrenSnapshot {
            path: "/warprpc/Echo".into(),
            cversion: 3,
            children: vec![
                ChildData {
                    path: "/warprpc/Echo/provider-h:1-0000000000".into(),
                    data: serde_json::to_vec(&good).unwrap(),
                },
                ChildData {
                    path: "/warprpc/Echo/junk".into(),
                    data: b"not json".to_vec(),
                },
            ],
        };
        let event = to_event("Echo", &snapshot);
        assert_eq!(event.version, 3);
        assert_eq!(event.entries.len(), 1);
        assert_eq!(
            event.entries[0].node_id.as_deref(),
            Some("/warprpc/Echo/provider-h:1-0000000000")
        );
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_member() {
        let registry = Registry::in_memory(Arc::new(NodeTree::new()));
        let first = registry
            .register(RegistryEntry::provider("Echo", "h", 1, "app"))
            .await
            .unwrap();
        let again = registry
            .register(RegistryEntry::provider("Echo", "h", 1, "app"))
            .await
            .unwrap();
        assert_eq!(first.node_id, again.node_id);
        assert_eq!(registry.query_providers("Echo").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_replaces_other_member() {
        let registry = Registry::in_memory(Arc::new(NodeTree::new()));
        registry
            .register(RegistryEntry::provider("Echo", "h", 1, "app"))
            .await
            .unwrap();
        registry
            .register(RegistryEntry::provider("Echo", "h", 2, "app"))
            .await
            .unwrap();
        let providers = registry.query_providers("Echo").await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].port, 2);
    }
}
