//! warprpc Server
//!
//! This crate hosts service implementations: it accepts framed requests,
//! dispatches them by service and method name, and publishes each hosted
//! service as a provider entry in the registry.

pub mod dispatcher;
pub mod pool;
pub mod server;
pub mod service;

pub use dispatcher::Dispatcher;
pub use pool::RegistrationPool;
pub use server::{PendingRegistration, RpcServer};
pub use service::{echo_service, MethodTable, RpcService};
