//! Request dispatch.
//!
//! Turns one decoded request into one response. Every failure a caller can
//! cause (unknown service or method, bad arguments, a failing or panicking
//! method) becomes a failure response with the request's id; the dispatcher
//! itself never fails.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, warn};
use warprpc_common::transport::Codec;
use warprpc_common::{ErrorKind, Request, Response, WarprpcError};

use crate::service::RpcService;

#[derive(Default)]
pub struct Dispatcher {
    services: DashMap<String, Arc<dyn RpcService>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `service` callable as `name`, returning the one it replaces.
    pub fn insert(&self, name: impl Into<String>, service: Arc<dyn RpcService>) -> Option<Arc<dyn RpcService>> {
        self.services.insert(name.into(), service)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn RpcService>> {
        self.services.remove(name).map(|(_, s)| s)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Invokes the request's method on the calling thread.
    ///
    /// Runs user code, so callers on an async runtime go through
    /// [`Dispatcher::handle`] instead.
    pub fn dispatch(&self, request: Request) -> Response {
        let id = request.id;
        if let Err(e) = request.validate_args() {
            warn!(id, error = %e, "rejecting request");
            return Response::from_error(id, &e);
        }

        let Request {
            service: service_name,
            method,
            args,
            ..
        } = request;

        // Clone out of the map so no shard lock is held while user code runs
        let service = match self.services.get(&service_name) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(id, service = %service_name, "service not found");
                return Response::from_error(id, &WarprpcError::ServiceNotFound(service_name));
            }
        };

        match catch_unwind(AssertUnwindSafe(|| service.invoke(&method, args))) {
            Ok(Ok(value)) => Response::success(id, value),
            Ok(Err(e)) => {
                debug!(id, service = %service_name, method = %method, error = %e, "method failed");
                Response::from_error(id, &e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(id, service = %service_name, method = %method, panic = %message, "method panicked");
                Response::error(
                    id,
                    ErrorKind::Dispatch,
                    format!("{}.{} panicked: {}", service_name, method, message),
                )
            }
        }
    }

    /// Decodes `body`, dispatches it on the blocking pool and returns the
    /// response to send back.
    ///
    /// An undecodable body yields a `Serialization` failure with id 0, since
    /// the real id is unknown.
    pub async fn handle(self: &Arc<Self>, codec: Codec, body: &[u8]) -> Response {
        let request = match codec.decode_request(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, len = body.len(), "undecodable request");
                return Response::error(0, ErrorKind::Serialization, e.to_string());
            }
        };

        let id = request.id;
        let dispatcher = Arc::clone(self);
        match tokio::task::spawn_blocking(move || dispatcher.dispatch(request)).await {
            Ok(response) => response,
            Err(e) => {
                error!(id, error = %e, "dispatch task failed");
                Response::error(id, ErrorKind::Dispatch, format!("dispatch task failed: {}", e))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
