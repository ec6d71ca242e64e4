use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error category used by callers to decide how to react.
///
/// Every [`WarprpcError`] maps onto exactly one kind, so code can match on
/// the kind instead of on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad or unsupported configuration, fatal at startup
    Configuration,
    /// Malformed traffic on a connection (bad magic, oversized frame)
    Protocol,
    /// Bytes that could not be turned into a typed value or vice versa
    Serialization,
    /// Service or method lookup failed, or the invoked method failed
    Dispatch,
    /// Coordination backend failure
    Registry,
    /// No response before the deadline
    Timeout,
    /// No provider known for the requested service
    NoProvider,
    /// Connection could not be established or was lost
    Connection,
}

#[derive(Error, Debug)]
pub enum WarprpcError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: bad magic number {found:#06x} (expected {expected:#06x})")]
    BadMagic { expected: u16, found: u16 },

    #[error("Protocol error: frame of {len} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Argument type mismatch: {0}")]
    ArgumentMismatch(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    #[error("Ambiguous service: {0}")]
    AmbiguousService(String),

    #[error("Invocation failed: {0}")]
    Invocation(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// A timeout reported by the remote side
    #[error("Remote timeout: {0}")]
    RemoteTimeout(String),

    #[error("No provider available for service {0}")]
    NoProvider(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WarprpcError {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WarprpcError::Config(_) => ErrorKind::Configuration,
            WarprpcError::BadMagic { .. }
            | WarprpcError::FrameTooLarge { .. }
            | WarprpcError::Protocol(_) => ErrorKind::Protocol,
            WarprpcError::Serialization(_)
            | WarprpcError::JsonSerialization(_)
            | WarprpcError::ArgumentMismatch(_) => ErrorKind::Serialization,
            WarprpcError::ServiceNotFound(_)
            | WarprpcError::MethodNotFound { .. }
            | WarprpcError::AmbiguousService(_)
            | WarprpcError::Invocation(_) => ErrorKind::Dispatch,
            WarprpcError::Registry(_) => ErrorKind::Registry,
            WarprpcError::Timeout(_) | WarprpcError::RemoteTimeout(_) => ErrorKind::Timeout,
            WarprpcError::NoProvider(_) => ErrorKind::NoProvider,
            WarprpcError::ConnectionLost(_)
            | WarprpcError::Connection(_)
            | WarprpcError::Io(_) => ErrorKind::Connection,
        }
    }

    /// Whether the connection that produced this error must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Connection)
    }
}

impl From<std::net::AddrParseError> for WarprpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        WarprpcError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WarprpcError>;
