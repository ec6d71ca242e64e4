//! warprpc Common Types and Transport
//!
//! This crate provides the wire protocol, codecs and shared plumbing used by
//! every warprpc component.
//!
//! # Overview
//!
//! warprpc is a registry-driven RPC framework: providers publish themselves
//! in a coordination service, consumers discover them there and call methods
//! over long-lived multiplexed TCP connections. This crate contains:
//!
//! - **Protocol Layer**: Request/Response types, values, error taxonomy
//! - **Transport Layer**: envelope framing, body codecs and TCP connect
//! - **Configuration**: settings shared by servers and clients
//! - **Correlation**: matching asynchronous replies with waiting callers
//!
//! # Wire format
//!
//! - **Envelope**: `[2-byte magic 0x5752] [4-byte length, u32 big-endian] [body]`
//! - **Body**: postcard (`binary`) or JSON (`json`), fixed per process
//! - **Max Body Size**: 100 MB
//!
//! # Example
//!
//! ```
//! use warprpc_common::{Request, Response, RpcValue};
//!
//! let request = Request::new(1, "Echo", "echo", vec![RpcValue::from("hi")]);
//! assert!(request.validate_args().is_ok());
//!
//! let response = Response::success(request.id, RpcValue::from("hi"));
//! assert_eq!(response.into_result().unwrap(), RpcValue::from("hi"));
//! ```

pub mod config;
pub mod correlation;
pub mod protocol;
pub mod transport;

pub use protocol::*;
