//! warprpc Client
//!
//! Calls remote services by name. Providers come from the registry, calls
//! share one multiplexed connection per provider, and responses are matched
//! to callers by correlation id.

pub mod client;
pub mod connection;
pub mod pool;

pub use client::RpcClient;
pub use connection::Connection;
pub use pool::ConnectionPool;
