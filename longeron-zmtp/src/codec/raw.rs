//! Raw codec: no framing at all.
//!
//! Each read becomes one message; each message is written as its bare
//! payload. The engine (not the codec) synthesizes the zero-length
//! messages that signal peer connect and disconnect to the application.

use super::{Decoder, Encoder, PendingFrame, Result};
use bytes::BytesMut;
use longeron_core::msg::Msg;

#[derive(Default)]
pub struct RawDecoder;

impl RawDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RawDecoder {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>> {
        if src.is_empty() {
            return Ok(None);
        }
        let payload = src.split().freeze();
        Ok(Some(Msg::new(payload)))
    }
}

#[derive(Default)]
pub struct RawEncoder {
    pending: Option<PendingFrame>,
}

impl RawEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for RawEncoder {
    fn load_msg(&mut self, msg: Msg) {
        debug_assert!(self.pending.is_none(), "one message at a time");
        self.pending = Some(PendingFrame::new(&[], msg.into_data()));
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

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn passes_bytes_through_unframed() {
        let mut enc = RawEncoder::new();
        enc.load_msg(Msg::new(Bytes::from_static(b"GET / HTTP/1.0\r\n")));
        let mut out = BytesMut::new();
        while enc.encode(&mut out, 4) > 0 {}
        assert_eq!(&out[..], b"GET / HTTP/1.0\r\n");

        let mut dec = RawDecoder::new();
        let msg = dec.decode(&mut out).unwrap().unwrap();
        assert_eq!(msg.data().as_ref(), b"GET / HTTP/1.0\r\n");
        assert!(dec.decode(&mut BytesMut::new()).unwrap().is_none());
    }

    #[test]
    fn empty_payload_encodes_to_nothing() {
        let mut enc = RawEncoder::new();
        enc.load_msg(Msg::empty());
        let mut out = BytesMut::new();
        assert_eq!(enc.encode(&mut out, 64), 0);
        assert!(!enc.has_msg());
    }
}
