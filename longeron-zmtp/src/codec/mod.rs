//! Wire codecs.
//!
//! One decoder and one encoder exist per connection once the greeting has
//! settled the protocol revision:
//!
//! - **V1**: ZMTP 1.0/2.0-era framing: length field first (long form via
//!   0xFF marker), then a flags byte; the length counts the flags byte.
//! - **V2**: ZMTP 3.x framing: flags byte first, then a 1-byte length for
//!   bodies ≤ 255 or an 8-byte big-endian length.
//! - **Raw**: no framing; opaque payloads, with zero-length messages
//!   synthesized by the engine to signal connect/disconnect.
//!
//! Decoders consume from the engine's input buffer and never consume more
//! than one frame at a time; max-message-size enforcement happens here, as
//! soon as a frame length is known. Encoders queue exactly one message and
//! emit it in `limit`-bounded slices so the engine can batch.

pub mod raw;
pub mod v1;
pub mod v2;

use bytes::{Bytes, BytesMut};
use longeron_core::msg::Msg;
use thiserror::Error;

pub use raw::{RawDecoder, RawEncoder};
pub use v1::{V1Decoder, V1Encoder};
pub use v2::{V2Decoder, V2Encoder};

/// Wire-level flag bits (V2 framing; V1 uses only MORE, in its own slot).
pub const WIRE_MORE: u8 = 0x01;
pub const WIRE_LONG: u8 = 0x02;
pub const WIRE_COMMAND: u8 = 0x04;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("protocol violation: reserved bits set")]
    ReservedBits,

    #[error("frame size field malformed")]
    BadLength,

    #[error("frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: u64, max: u64 },
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Stateful frame decoder.
///
/// `decode` consumes at most one frame's worth of bytes from `src`:
/// - `Ok(Some(msg))` → frame complete
/// - `Ok(None)` → need more data (partial header or body left in `src`)
/// - `Err` → protocol violation; the connection is done for
pub trait Decoder {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>>;
}

/// Stateful frame encoder.
///
/// `load_msg` queues exactly one message; `encode` appends at most `limit`
/// bytes of it to `dst` and returns the count, returning 0 once the queued
/// message is exhausted (the engine then loads the next message or stops).
/// `encoded` is called after a write batch so the encoder can release any
/// per-message state.
pub trait Encoder {
    fn load_msg(&mut self, msg: Msg);
    fn encode(&mut self, dst: &mut BytesMut, limit: usize) -> usize;
    fn has_msg(&self) -> bool;
    fn encoded(&mut self) {}
}

/// Shared scratch for encoders: a frame header plus the payload, emitted
/// in bounded slices.
#[derive(Debug, Default)]
pub(crate) struct PendingFrame {
    header: [u8; 10],
    header_len: usize,
    header_sent: usize,
    payload: Bytes,
    payload_sent: usize,
}

impl PendingFrame {
    pub(crate) fn new(header: &[u8], payload: Bytes) -> Self {
        debug_assert!(header.len() <= 10);
        let mut hdr = [0u8; 10];
        hdr[..header.len()].copy_from_slice(header);
        Self {
            header: hdr,
            header_len: header.len(),
            header_sent: 0,
            payload,
            payload_sent: 0,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.header_sent == self.header_len && self.payload_sent == self.payload.len()
    }

    /// Append up to `limit` bytes to `dst`; returns bytes written.
    pub(crate) fn emit(&mut self, dst: &mut BytesMut, limit: usize) -> usize {
        let mut written = 0;

        if self.header_sent < self.header_len {
            let take = (self.header_len - self.header_sent).min(limit);
            dst.extend_from_slice(&self.header[self.header_sent..self.header_sent + take]);
            self.header_sent += take;
            written += take;
        }

        if written < limit && self.payload_sent < self.payload.len() {
            let take = (self.payload.len() - self.payload_sent).min(limit - written);
            dst.extend_from_slice(&self.payload[self.payload_sent..self.payload_sent + take]);
            self.payload_sent += take;
            written += take;
        }

        written
    }
}
