//! warprpc Service Registry
//!
//! Membership of warprpc services: which processes provide a service and
//! which consume it.
//!
//! # Overview
//!
//! - [`Registry`] registers this process's entries and mirrors subscribed
//!   services into the local [`RegistryCache`]
//! - [`Backend`] is the coordination store the registry talks to, either a
//!   [`NodeTree`] in this process or a remote [`CoordinatorServer`]
//! - [`RoundRobin`] picks a provider from the cached list
//!
//! # Layout in the coordination tree
//!
//! ```text
//! /warprpc/{service}/{role}-{host}:{port}-{seq}   (ephemeral, JSON entry)
//! ```
//!
//! Entries are ephemeral: when the owning session ends they vanish and
//! every subscriber receives the new membership.

pub mod backend;
pub mod cache;
pub mod coordinator;
pub mod entry;
pub mod registry;
pub mod selector;
pub mod tree;

pub use backend::{Backend, BackendError, MemoryBackend, RemoteBackend, RemoteBackendConfig, SessionEvent};
pub use cache::{RegistryCache, ServiceSnapshot};
pub use coordinator::{CoordinatorConfig, CoordinatorServer};
pub use entry::{RegistryEntry, Role, ServiceUpdateEvent};
pub use registry::{Registry, RetryConfig};
pub use selector::RoundRobin;
pub use tree::NodeTree;
