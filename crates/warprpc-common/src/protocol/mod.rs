pub mod error;
pub mod requests;
pub mod responses;
pub mod value;

#[cfg(test)]
mod tests;

pub use error::{ErrorKind, Result, WarprpcError};
pub use requests::{IdGenerator, MethodName, Request, RequestId, ServiceName};
pub use responses::{Outcome, Response, RpcFailure};
pub use value::RpcValue;
