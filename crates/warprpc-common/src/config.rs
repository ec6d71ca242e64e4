//! Process configuration shared by servers and clients.
//!
//! Configuration is plain data: the binary fills it from command line flags
//! and the environment, tests build it directly. Enumerated settings parse
//! through `FromStr` and reject unknown values, so a typo fails startup
//! instead of silently falling back to a default.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::protocol::error::WarprpcError;

/// Environment variable that overrides the registry address.
pub const REGISTRY_ADDR_ENV: &str = "WARPRPC_REGISTRY_ADDR";

/// Supported coordination backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistryKind {
    /// The warprpc coordination service reached over TCP
    #[default]
    Coordinator,
}

impl FromStr for RegistryKind {
    type Err = WarprpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinator" => Ok(RegistryKind::Coordinator),
            other => Err(WarprpcError::Config(format!("unknown registry kind '{}'", other))),
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryKind::Coordinator => write!(f, "coordinator"),
        }
    }
}

/// Supported body encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializeKind {
    #[default]
    Binary,
    Json,
}

impl FromStr for SerializeKind {
    type Err = WarprpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(SerializeKind::Binary),
            "json" => Ok(SerializeKind::Json),
            other => Err(WarprpcError::Config(format!("unknown serialize kind '{}'", other))),
        }
    }
}

impl fmt::Display for SerializeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeKind::Binary => write!(f, "binary"),
            SerializeKind::Json => write!(f, "json"),
        }
    }
}

/// Settings shared by servers and clients.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub registry_kind: RegistryKind,
    pub registry_addr: String,
    pub serialize_kind: SerializeKind,
    pub application_name: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            registry_kind: RegistryKind::Coordinator,
            registry_addr: "127.0.0.1:2181".to_string(),
            serialize_kind: SerializeKind::Binary,
            application_name: "warprpc-app".to_string(),
        }
    }
}

impl CommonConfig {
    pub fn with_registry_addr(mut self, addr: impl Into<String>) -> Self {
        self.registry_addr = addr.into();
        self
    }

    pub fn with_serialize_kind(mut self, kind: SerializeKind) -> Self {
        self.serialize_kind = kind;
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Applies `WARPRPC_REGISTRY_ADDR` if it is set and non-empty.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var(REGISTRY_ADDR_ENV) {
            if !addr.trim().is_empty() {
                self.registry_addr = addr;
            }
        }
        self
    }

    /// Rejects settings that cannot work regardless of the environment.
    pub fn validate(&self) -> Result<(), WarprpcError> {
        if self.registry_addr.trim().is_empty() {
            return Err(WarprpcError::Config("registry address is empty".to_string()));
        }
        if self.application_name.trim().is_empty() {
            return Err(WarprpcError::Config("application name is empty".to_string()));
        }
        Ok(())
    }
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub common: CommonConfig,
    /// Listening port; 0 picks a free port
    pub port: u16,
    /// Interface to bind
    pub bind_host: String,
    /// Host published in registry entries
    pub advertise_host: String,
    /// Workers performing service registration
    pub registration_workers: usize,
    /// Pending registrations before callers run them inline
    pub registration_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            port: 9000,
            bind_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            registration_workers: 5,
            registration_queue: 100,
        }
    }
}

impl ServerConfig {
    pub fn with_common(mut self, common: CommonConfig) -> Self {
        self.common = common;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    pub fn with_registration_pool(mut self, workers: usize, queue: usize) -> Self {
        self.registration_workers = workers;
        self.registration_queue = queue;
        self
    }

    pub fn validate(&self) -> Result<(), WarprpcError> {
        self.common.validate()?;
        if self.registration_workers == 0 || self.registration_queue == 0 {
            return Err(WarprpcError::Config(
                "registration pool needs at least one worker and one queue slot".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub common: CommonConfig,
    /// Deadline for a single call
    pub call_timeout: Duration,
    /// Host published in consumer registry entries
    pub advertise_host: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            call_timeout: Duration::from_secs(3),
            advertise_host: "127.0.0.1".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_common(mut self, common: CommonConfig) -> Self {
        self.common = common;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    pub fn validate(&self) -> Result<(), WarprpcError> {
        self.common.validate()?;
        if self.call_timeout.is_zero() {
            return Err(WarprpcError::Config("call timeout must be positive".to_string()));
        }
        Ok(())
    }
}
