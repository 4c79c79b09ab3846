//! ZMTP 1.0/2.0-era framing: length field first, then a flags byte.
//!
//! The length counts the flags byte, so it is always at least 1. Lengths
//! below 255 use a single byte; 0xFF marks an 8-byte big-endian length.
//! Only the MORE bit of the flags byte is meaningful.

use super::{CodecError, Decoder, Encoder, PendingFrame, Result};
use bytes::{Buf, BytesMut};
use longeron_core::msg::{flags, Msg};

const LONG_MARKER: u8 = 0xFF;
const FLAG_MORE: u8 = 0x01;

pub struct V1Decoder {
    max_msg_size: Option<u64>,
}

impl V1Decoder {
    #[must_use]
    pub fn new(max_msg_size: Option<u64>) -> Self {
        Self { max_msg_size }
    }
}

impl Decoder for V1Decoder {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>> {
        if src.is_empty() {
            return Ok(None);
        }

        let (length_len, frame_len) = if src[0] == LONG_MARKER {
            if src.len() < 9 {
                return Ok(None);
            }
            let size = u64::from_be_bytes(src[1..9].try_into().expect("slice is 8 bytes"));
            (9usize, size)
        } else {
            (1usize, u64::from(src[0]))
        };

        // The flags byte is included in the length.
        if frame_len == 0 {
            return Err(CodecError::BadLength);
        }
        let body_len = frame_len - 1;

        if let Some(max) = self.max_msg_size {
            if body_len > max {
                return Err(CodecError::TooLarge {
                    size: body_len,
                    max,
                });
            }
        }

        let total = length_len + 1 + body_len as usize;
        if src.len() < total {
            return Ok(None);
        }

        let frame_flags = src[length_len];
        src.advance(length_len + 1);
        let payload = src.split_to(body_len as usize).freeze();

        let mut msg = Msg::new(payload);
        if (frame_flags & FLAG_MORE) != 0 {
            msg.set_flags(flags::MORE);
        }
        Ok(Some(msg))
    }
}

#[derive(Default)]
pub struct V1Encoder {
    pending: Option<PendingFrame>,
}

impl V1Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Header length for a payload of `len` bytes, including the flags
    /// byte. The engine uses this to elide the identity-message header
    /// already carried by an unversioned greeting.
    #[must_use]
    pub fn header_len(len: usize) -> usize {
        if len + 1 < LONG_MARKER as usize {
            2
        } else {
            10
        }
    }
}

impl Encoder for V1Encoder {
    fn load_msg(&mut self, msg: Msg) {
        debug_assert!(self.pending.is_none(), "one message at a time");

        let more = msg.has_more();
        let payload = msg.into_data();
        let frame_len = payload.len() as u64 + 1;

        let mut header = [0u8; 10];
        let header_len = if frame_len < u64::from(LONG_MARKER) {
            header[0] = frame_len as u8;
            header[1] = u8::from(more);
            2
        } else {
            header[0] = LONG_MARKER;
            header[1..9].copy_from_slice(&frame_len.to_be_bytes());
            header[9] = u8::from(more);
            10
        };

        self.pending = Some(PendingFrame::new(&header[..header_len], payload));
    }

    fn encode(&mut self, dst: &mut BytesMut, limit: usize) -> usize {
        let Some(frame) = self.pending.as_mut() else {
            return 0;
        };
        let written = frame.emit(dst, limit);
        if frame.is_done() {
            self.pending = None;
        }
        written
    }

    fn has_msg(&self) -> bool {
        self.pending.is_some()
    }
}
