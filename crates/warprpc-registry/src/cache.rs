//! Process-local view of the registry.
//!
//! Holds the latest snapshot per subscribed service and the entries this
//! process registered itself. Readers only ever see whole snapshots: an
//! update replaces the `Arc` stored under its service in a single insert,
//! and entries are copied out on read.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::entry::{RegistryEntry, Role, ServiceUpdateEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub version: u64,
    pub entries: Vec<RegistryEntry>,
}

impl ServiceSnapshot {
    fn with_role(&self, role: Role) -> Vec<RegistryEntry> {
        self.entries
            .iter()
            .filter(|e| e.role == role)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct RegistryCache {
    services: DashMap<String, Arc<ServiceSnapshot>>,
    owned: DashMap<(String, Role), RegistryEntry>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot of the event's service.
    ///
    /// Returns `false` and leaves the cache untouched when the event is
    /// older than what is already cached.
    pub fn apply(&self, event: &ServiceUpdateEvent) -> bool {
        let snapshot = Arc::new(ServiceSnapshot {
            version: event.version,
            entries: event.entries.clone(),
        });
        match self.services.entry(event.service_name.clone()) {
            Entry::Occupied(mut current) => {
                if event.version < current.get().version {
                    debug!(
                        service = %event.service_name,
                        cached = current.get().version,
                        received = event.version,
                        "discarding stale snapshot"
                    );
                    return false;
                }
                current.insert(snapshot);
            }
            Entry::Vacant(slot) => {
                slot.insert(snapshot);
            }
        }
        true
    }

    /// Replaces the snapshot of the event's service whatever its version.
    ///
    /// Used for the first snapshot of a re-established watch. The backend
    /// behind the new watch may number its versions from scratch (a
    /// restarted coordinator), so the old version says nothing about it.
    pub fn replace(&self, event: &ServiceUpdateEvent) {
        let snapshot = Arc::new(ServiceSnapshot {
            version: event.version,
            entries: event.entries.clone(),
        });
        self.services.insert(event.service_name.clone(), snapshot);
    }

    pub fn snapshot(&self, service: &str) -> Option<Arc<ServiceSnapshot>> {
        self.services.get(service).map(|s| s.value().clone())
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn providers(&self, service: &str) -> Vec<RegistryEntry> {
        self.snapshot(service)
            .map(|s| s.with_role(Role::Provider))
            .unwrap_or_default()
    }

    pub fn consumers(&self, service: &str) -> Vec<RegistryEntry> {
        self.snapshot(service)
            .map(|s| s.with_role(Role::Consumer))
            .unwrap_or_default()
    }

    pub fn remove(&self, service: &str) -> Option<Arc<ServiceSnapshot>> {
        self.services.remove(service).map(|(_, s)| s)
    }

    pub fn services(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    pub fn insert_owned(&self, entry: RegistryEntry) {
        self.owned
            .insert((entry.service_name.clone(), entry.role), entry);
    }

    pub fn owned(&self, service: &str, role: Role) -> Option<RegistryEntry> {
        self.owned
            .get(&(service.to_string(), role))
            .map(|e| e.value().clone())
    }

    /// Forgets an owned entry, but only if it still has `node_id`.
    pub fn remove_owned(&self, service: &str, role: Role, node_id: &str) -> Option<RegistryEntry> {
        self.owned
            .remove_if(&(service.to_string(), role), |_, e| {
                e.node_id.as_deref() == Some(node_id)
            })
            .map(|(_, e)| e)
    }

    pub fn owned_entries(&self) -> Vec<RegistryEntry> {
        self.owned.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(version: u64, ports: &[u16]) -> ServiceUpdateEvent {
        ServiceUpdateEvent {
            service_name: "Echo".to_string(),
            version,
            entries: ports
                .iter()
                .map(|p| RegistryEntry::provider("Echo", "127.0.0.1", *p, "app"))
                .collect(),
        }
    }

    #[test]
    fn test_snapshot_replaces() {
        let cache = RegistryCache::new();
        assert!(cache.apply(&event(1, &[9001, 9002])));
        assert!(cache.apply(&event(2, &[9003])));
        let providers = cache.providers("Echo");
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].port, 9003);
    }

    #[test]
    fn test_stale_snapshot_discarded() {
        let cache = RegistryCache::new();
        assert!(cache.apply(&event(5, &[9001])));
        assert!(!cache.apply(&event(4, &[9002, 9003])));
        assert_eq!(cache.snapshot("Echo").unwrap().version, 5);
        assert_eq!(cache.providers("Echo")[0].port, 9001);
        // same version is re-applied
        assert!(cache.apply(&event(5, &[])));
        assert!(cache.providers("Echo").is_empty());
    }

    #[test]
    fn test_replace_ignores_older_version() {
        let cache = RegistryCache::new();
        assert!(cache.apply(&event(19, &[9010])));
        cache.replace(&event(1, &[9100]));
        assert_eq!(cache.snapshot("Echo").unwrap().version, 1);
        assert_eq!(cache.providers("Echo")[0].port, 9100);
        // later snapshots are ordered against the new numbering
        assert!(cache.apply(&event(2, &[9100, 9101])));
        assert_eq!(cache.providers("Echo").len(), 2);
    }

    #[test]
    fn test_roles_are_split() {
        let cache = RegistryCache::new();
        let mut ev = event(1, &[9001]);
        ev.entries
            .push(RegistryEntry::consumer("Echo", "10.0.0.9", 0, "caller"));
        cache.apply(&ev);
        assert_eq!(cache.providers("Echo").len(), 1);
        assert_eq!(cache.consumers("Echo").len(), 1);
        assert!(cache.providers("Other").is_empty());
    }

    #[test]
    fn test_owned_entries() {
        let cache = RegistryCache::new();
        let mut entry = RegistryEntry::provider("Echo", "h", 1, "app");
        entry.node_id = Some("/warprpc/Echo/provider-h:1-0000000000".into());
        cache.insert_owned(entry.clone());

        assert_eq!(cache.owned("Echo", Role::Provider), Some(entry.clone()));
        assert!(cache.owned("Echo", Role::Consumer).is_none());

        // a different node id does not remove the current one
        assert!(cache
            .remove_owned("Echo", Role::Provider, "/warprpc/Echo/provider-h:1-0000000007")
            .is_none());
        assert!(cache
            .remove_owned("Echo", Role::Provider, "/warprpc/Echo/provider-h:1-0000000000")
            .is_some());
        assert!(cache.owned_entries().is_empty());
    }
}
