//! warprpc Transport Layer
//!
//! This module provides envelope framing, body codecs and TCP connection
//! helpers.
//!
//! # Components
//!
//! - **[`frame`]**: `[magic][length][body]` envelopes and the incremental
//!   [`FrameDecoder`]
//! - **[`Codec`]**: binary (postcard) or JSON bodies
//! - **[`TcpTransport`]**: async TCP connector
//!
//! # Message Size Limits
//!
//! Decoders refuse bodies above 100 MB by default so a peer cannot make
//! the process allocate an arbitrary amount of memory.

pub mod codec;
pub mod frame;
pub mod tcp;

pub use codec::{BinaryCodec, Codec, JsonCodec};
pub use frame::{encode_frame, read_frame, write_frame, FrameDecoder, HEADER_LEN, MAGIC, MAX_BODY_SIZE};
pub use tcp::TcpTransport;
