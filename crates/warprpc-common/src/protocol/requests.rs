use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{Result, WarprpcError};
use super::value::RpcValue;

pub type RequestId = u64;
pub type ServiceName = String;
pub type MethodName = String;

/// A unary call addressed to `service.method`.
///
/// `arg_types` holds one descriptor per argument so the receiving side can
/// check what it decoded against what the caller meant to send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub service: ServiceName,
    pub method: MethodName,
    pub args: Vec<RpcValue>,
    pub arg_types: Vec<String>,
}

impl Request {
    pub fn new(
        id: RequestId,
        service: impl Into<String>,
        method: impl Into<String>,
        args: Vec<RpcValue>,
    ) -> Self {
        let arg_types = args.iter().map(|a| a.type_name().to_string()).collect();
        Request {
            id,
            service: service.into(),
            method: method.into(),
            args,
            arg_types,
        }
    }

    /// Checks that the decoded arguments agree with their descriptors.
    pub fn validate_args(&self) -> Result<()> {
        if self.args.len() != self.arg_types.len() {
            return Err(WarprpcError::ArgumentMismatch(format!(
                "{} arguments but {} type descriptors",
                self.args.len(),
                self.arg_types.len()
            )));
        }
        for (index, (arg, declared)) in self.args.iter().zip(&self.arg_types).enumerate() {
            if arg.type_name() != declared {
                return Err(WarprpcError::ArgumentMismatch(format!(
                    "argument {} declared as {} but decoded as {}",
                    index,
                    declared,
                    arg.type_name()
                )));
            }
        }
        Ok(())
    }
}

/// Hands out correlation ids for one client instance.
///
/// Ids start at 1 and increase monotonically, so they are unique among all
/// in-flight requests of the owning client until the counter wraps.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
