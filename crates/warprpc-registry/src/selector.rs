use dashmap::DashMap;

use crate::entry::RegistryEntry;

/// Round-robin provider selection, one cursor per service.
///
/// The cursor is taken modulo the current list length, so providers coming
/// and going between calls never push it out of range.
#[derive(Default)]
pub struct RoundRobin {
    cursors: DashMap<String, usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the next provider of `service` from `providers`.
    pub fn next(&self, service: &str, providers: &[RegistryEntry]) -> Option<RegistryEntry> {
        if providers.is_empty() {
            return None;
        }
        let mut cursor = self.cursors.entry(service.to_string()).or_insert(0);
        let index = *cursor % providers.len();
        *cursor = cursor.wrapping_add(1);
        Some(providers[index].clone())
    }

    /// Forgets the cursor of `service`.
    pub fn reset(&self, service: &str) {
        self.cursors.remove(service);
    }
}
