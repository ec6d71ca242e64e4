//! RPC response types.

use serde::{Deserialize, Serialize};

use super::error::{ErrorKind, WarprpcError};
use super::requests::RequestId;
use super::value::RpcValue;

/// Failure description carried back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of one invocation: a value or a failure, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Outcome {
    Success(RpcValue),
    Failure(RpcFailure),
}

/// An RPC response returned from a server to the client.
///
/// # Response Flow
///
/// 1. Server receives and decodes a `Request`
/// 2. Dispatcher invokes the service and builds a `Response` with the same id
/// 3. Response is encoded with the configured codec and framed
/// 4. Client reader task hands it to the waiting caller by id
///
/// # Example
///
/// ```
/// use warprpc_common::protocol::{ErrorKind, Response, RpcValue};
///
/// let ok = Response::success(7, RpcValue::from("hello"));
/// assert!(ok.is_success());
///
/// let failed = Response::error(7, ErrorKind::Dispatch, "division by zero");
/// assert!(!failed.is_success());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Request identifier this response corresponds to
    pub id: RequestId,
    pub outcome: Outcome,
}

impl Response {
    /// Creates a successful response.
    pub fn success(id: RequestId, result: RpcValue) -> Self {
        Response {
            id,
            outcome: Outcome::Success(result),
        }
    }

    /// Creates an error response.
    pub fn error(id: RequestId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Response {
            id,
            outcome: Outcome::Failure(RpcFailure {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Creates an error response describing `err`.
    pub fn from_error(id: RequestId, err: &WarprpcError) -> Self {
        Self::error(id, err.kind(), err.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    /// Converts the response into the caller-facing result.
    ///
    /// Remote dispatch failures keep their message; the kind is restored so
    /// callers can still match on it.
    pub fn into_result(self) -> Result<RpcValue, WarprpcError> {
        match self.outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(match failure.kind {
                ErrorKind::Serialization => WarprpcError::ArgumentMismatch(failure.message),
                ErrorKind::Configuration => WarprpcError::Config(failure.message),
                ErrorKind::Protocol => WarprpcError::Protocol(failure.message),
                ErrorKind::Registry => WarprpcError::Registry(failure.message),
                ErrorKind::NoProvider => WarprpcError::NoProvider(failure.message),
                ErrorKind::Connection => WarprpcError::Connection(failure.message),
                ErrorKind::Timeout => WarprpcError::RemoteTimeout(failure.message),
                ErrorKind::Dispatch => WarprpcError::Invocation(failure.message),
            }),
        }
    }
}
