//! Envelope framing.
//!
//! Every message on a warprpc connection is wrapped in an envelope:
//!
//! ```text
//! [2-byte magic 0x5752] [4-byte body length, u32 big-endian] [body]
//! ```
//!
//! [`FrameDecoder`] turns an arbitrary sequence of reads into whole bodies.
//! A single read may hold zero, one or several envelopes plus a trailing
//! partial one; the partial bytes stay buffered until the rest arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{Result, WarprpcError};

/// Sentinel identifying warprpc traffic ("WR").
pub const MAGIC: u16 = 0x5752;

/// Magic plus length.
pub const HEADER_LEN: usize = 6;

/// Default upper bound for a single body (100 MB).
pub const MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

const READ_CAPACITY: usize = 8 * 1024;

/// Appends one envelope around `body` to `dst`.
pub fn encode_frame_into(body: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| WarprpcError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_LEN + body.len());
    dst.put_u16(MAGIC);
    dst.put_u32(len);
    dst.put_slice(body);
    Ok(())
}

/// Builds one envelope around `body`, ready for a single write.
pub fn encode_frame(body: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    encode_frame_into(body, &mut buf)?;
    Ok(buf.freeze())
}

/// Incremental envelope decoder.
///
/// # Example
///
/// ```
/// use warprpc_common::transport::frame::{encode_frame, FrameDecoder};
///
/// let frame = encode_frame(b"hello").unwrap();
/// let mut decoder = FrameDecoder::new();
///
/// decoder.extend(&frame[..3]);
/// assert!(decoder.decode().unwrap().is_none());
///
/// decoder.extend(&frame[3..]);
/// assert_eq!(&decoder.decode().unwrap().unwrap()[..], b"hello");
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_body: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_body(MAX_BODY_SIZE)
    }

    pub fn with_max_body(max_body: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CAPACITY),
            max_body,
        }
    }

    /// Buffers bytes received from the peer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read into directly, e.g. with `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of bytes buffered but not yet returned as a body.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete body, or `None` when more bytes are needed.
    ///
    /// The magic is checked as soon as two bytes are present, so foreign
    /// traffic is rejected without waiting for a full header.
    pub fn decode(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() >= 2 {
            let magic = u16::from_be_bytes([self.buf[0], self.buf[1]]);
            if magic != MAGIC {
                return Err(WarprpcError::BadMagic {
                    expected: MAGIC,
                    found: magic,
                });
            }
        }

        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
        if len > self.max_body {
            return Err(WarprpcError::FrameTooLarge {
                len,
                max: self.max_body,
            });
        }

        let total = HEADER_LEN + len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the next body from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream between envelopes. An end of
/// stream in the middle of an envelope is a protocol error.
pub async fn read_frame<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(body) = decoder.decode()? {
            return Ok(Some(body));
        }

        if decoder.buf.capacity() == decoder.buf.len() {
            decoder.buf.reserve(READ_CAPACITY);
        }
        let n = reader.read_buf(&mut decoder.buf).await?;
        if n == 0 {
            if decoder.buffered_len() == 0 {
                return Ok(None);
            }
            return Err(WarprpcError::Protocol(format!(
                "connection closed with {} bytes of an incomplete frame",
                decoder.buffered_len()
            )));
        }
    }
}

/// Writes `body` as one envelope and flushes.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
