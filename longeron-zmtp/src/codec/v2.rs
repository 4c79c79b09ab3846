//! ZMTP 3.x framing: flags byte, then 1-byte length for bodies up to 255
//! bytes or an 8-byte big-endian length.

use super::{CodecError, Decoder, Encoder, PendingFrame, Result, WIRE_COMMAND, WIRE_LONG, WIRE_MORE};
use bytes::{Buf, BytesMut};
use longeron_core::msg::{flags, Msg};

pub struct V2Decoder {
    max_msg_size: Option<u64>,
}

impl V2Decoder {
    #[must_use]
    pub fn new(max_msg_size: Option<u64>) -> Self {
        Self { max_msg_size }
    }
}

impl Decoder for V2Decoder {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let wire_flags = src[0];

        // Reserved bits must be zero (bits 3-7)
        if (wire_flags & 0xF8) != 0 {
            return Err(CodecError::ReservedBits);
        }

        let is_long = (wire_flags & WIRE_LONG) != 0;
        let (header_len, body_len) = if is_long {
            if src.len() < 9 {
                return Ok(None);
            }
            let size = u64::from_be_bytes(src[1..9].try_into().expect("slice is 8 bytes"));

            // MSB must be zero in ZMTP 3.x
            if size > i64::MAX as u64 {
                return Err(CodecError::BadLength);
            }
            (9usize, size)
        } else {
            (2usize, u64::from(src[1]))
        };

        if let Some(max) = self.max_msg_size {
            if body_len > max {
                return Err(CodecError::TooLarge {
                    size: body_len,
                    max,
                });
            }
        }

        let total = header_len + body_len as usize;
        if src.len() < total {
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(body_len as usize).freeze();

        let mut msg = if (wire_flags & WIRE_COMMAND) != 0 {
            Msg::command(payload)
        } else {
            Msg::new(payload)
        };
        if (wire_flags & WIRE_MORE) != 0 {
            msg.set_flags(flags::MORE);
        }
        Ok(Some(msg))
    }
}

#[derive(Default)]
pub struct V2Encoder {
    pending: Option<PendingFrame>,
}

impl V2Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for V2Encoder {
    fn load_msg(&mut self, msg: Msg) {
        debug_assert!(self.pending.is_none(), "one message at a time");

        let mut wire_flags = 0u8;
        if msg.has_more() {
            wire_flags |= WIRE_MORE;
        }
        if msg.is_command() {
            wire_flags |= WIRE_COMMAND;
        }

        let payload = msg.into_data();
        let mut header = [0u8; 9];
        let header_len = if payload.len() > 255 {
            header[0] = wire_flags | WIRE_LONG;
            header[1..9].copy_from_slice(&(payload.len() as u64).to_be_bytes());
            9
        } else {
            header[0] = wire_flags;
            header[1] = payload.len() as u8;
            2
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

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encode_all(msg: Msg) -> BytesMut {
        let mut enc = V2Encoder::new();
        enc.load_msg(msg);
        let mut out = BytesMut::new();
        while enc.encode(&mut out, 7) > 0 {}
        out
    }

    #[test]
    fn short_frame_round_trip() {
        let mut wire = encode_all(Msg::new(Bytes::from_static(b"hello")).with_more(true));
        assert_eq!(&wire[..2], &[WIRE_MORE, 5]);

        let mut dec = V2Decoder::new(None);
        let msg = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(msg.data().as_ref(), b"hello");
        assert!(msg.has_more());
        assert!(wire.is_empty());
    }

    #[test]
    fn long_frame_uses_nine_byte_header() {
        let payload = Bytes::from(vec![0x42u8; 300]);
        let mut wire = encode_all(Msg::new(payload));
        assert_eq!(wire[0], WIRE_LONG);
        assert_eq!(wire.len(), 9 + 300);

        let mut dec = V2Decoder::new(None);
        let msg = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(msg.len(), 300);
        assert!(!msg.has_more());
    }

    #[test]
    fn command_flag_survives() {
        let mut wire = encode_all(Msg::command(Bytes::from_static(b"\x04PING")));
        let mut dec = V2Decoder::new(None);
        let msg = dec.decode(&mut wire).unwrap().unwrap();
        assert!(msg.is_command());
    }

    #[test]
    fn partial_input_yields_none_and_consumes_nothing() {
        let wire_full = encode_all(Msg::new(Bytes::from_static(b"hello")));
        let mut dec = V2Decoder::new(None);

        for cut in 0..wire_full.len() {
            let mut partial = BytesMut::from(&wire_full[..cut]);
            assert!(dec.decode(&mut partial).unwrap().is_none(), "cut={cut}");
            assert_eq!(partial.len(), cut, "cut={cut}");
        }
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut wire = BytesMut::from(&[0x10u8, 0x00][..]);
        let mut dec = V2Decoder::new(None);
        assert_eq!(dec.decode(&mut wire).unwrap_err(), CodecError::ReservedBits);
    }

    #[test]
    fn oversized_frame_rejected_before_body_arrives() {
        // Header announces 1 MiB; limit is 1 KiB. No body bytes present yet.
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[WIRE_LONG]);
        wire.extend_from_slice(&(1_048_576u64).to_be_bytes());

        let mut dec = V2Decoder::new(Some(1024));
        assert!(matches!(
            dec.decode(&mut wire),
            Err(CodecError::TooLarge { size: 1_048_576, max: 1024 })
        ));
    }

    #[test]
    fn length_msb_rejected() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[WIRE_LONG]);
        wire.extend_from_slice(&u64::MAX.to_be_bytes());
        let mut dec = V2Decoder::new(None);
        assert_eq!(dec.decode(&mut wire).unwrap_err(), CodecError::BadLength);
    }

    #[test]
    fn two_frames_decode_in_sequence() {
        let mut wire = encode_all(Msg::new(Bytes::from_static(b"one")).with_more(true));
        wire.extend_from_slice(&encode_all(Msg::new(Bytes::from_static(b"two"))));

        let mut dec = V2Decoder::new(None);
        let a = dec.decode(&mut wire).unwrap().unwrap();
        let b = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(a.data().as_ref(), b"one");
        assert!(a.has_more());
        assert_eq!(b.data().as_ref(), b"two");
        assert!(!b.has_more());
        assert!(dec.decode(&mut wire).unwrap().is_none());
    }
}
