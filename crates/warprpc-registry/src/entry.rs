//! Membership records stored in the coordination backend.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Root of every warprpc path in the coordination tree.
pub const ROOT_PATH: &str = "/warprpc";

/// Whether an entry offers or uses a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Provider,
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Provider => "provider",
            Role::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider or consumer of a service.
///
/// Stored as JSON in an ephemeral-sequential node under
/// `/warprpc/{service}`; `node_id` is that node's full path and is only
/// known once the backend has created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub application: String,
    pub role: Role,
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl RegistryEntry {
    pub fn new(
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        application: impl Into<String>,
        role: Role,
    ) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert("create_time".to_string(), serde_json::Value::from(now_millis()));
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            application: application.into(),
            role,
            attrs,
            node_id: None,
        }
    }

    pub fn provider(
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        application: impl Into<String>,
    ) -> Self {
        Self::new(service_name, host, port, application, Role::Provider)
    }

    pub fn consumer(
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        application: impl Into<String>,
    ) -> Self {
        Self::new(service_name, host, port, application, Role::Consumer)
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// `host:port`, the address callers dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Path of the node holding every entry of this entry's service.
    pub fn service_path(&self) -> String {
        service_path(&self.service_name)
    }

    /// Path prefix of this entry's node; the backend appends the sequence.
    pub fn node_prefix(&self) -> String {
        format!(
            "{}/{}-{}:{}-",
            self.service_path(),
            self.role,
            self.host,
            self.port
        )
    }

    /// Whether `other` describes the same member, ignoring attributes and
    /// node identity.
    pub fn same_member(&self, other: &RegistryEntry) -> bool {
        self.service_name == other.service_name
            && self.role == other.role
            && self.host == other.host
            && self.port == other.port
    }
}

pub fn service_path(service_name: &str) -> String {
    format!("{}/{}", ROOT_PATH, service_name)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Full membership of one service at one backend version.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceUpdateEvent {
    pub service_name: String,
    pub version: u64,
    pub entries: Vec<RegistryEntry>,
}

impl ServiceUpdateEvent {
    pub fn providers(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter().filter(|e| e.role == Role::Provider)
    }

    pub fn consumers(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter().filter(|e| e.role == Role::Consumer)
    }
}
