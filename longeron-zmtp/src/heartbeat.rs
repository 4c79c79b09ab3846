//! Heartbeat commands.
//!
//! PING carries a 2-byte TTL in deciseconds plus up to 16 bytes of opaque
//! context; PONG echoes the context back. Both are COMMAND frames
//! multiplexed with data traffic.

use crate::command::{begin_command, parse_command};
use bytes::{BufMut, Bytes, BytesMut};
use longeron_core::error::EngineError;
use longeron_core::msg::Msg;
use std::time::Duration;

pub const PING: &[u8] = b"PING";
pub const PONG: &[u8] = b"PONG";

/// Context bytes beyond this are truncated when echoing a PONG.
pub const MAX_CONTEXT: usize = 16;

/// A parsed PING command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    /// Peer-announced time-to-live; zero means none.
    pub ttl: Duration,
    /// Context to echo back, already truncated to [`MAX_CONTEXT`].
    pub context: Bytes,
}

/// Build a PING command frame.
#[must_use]
pub fn build_ping(ttl_deciseconds: u16, context: &[u8]) -> Msg {
    debug_assert!(context.len() <= MAX_CONTEXT);
    let mut body = BytesMut::with_capacity(1 + PING.len() + 2 + context.len());
    begin_command(&mut body, "PING");
    body.put_u16(ttl_deciseconds);
    body.extend_from_slice(context);
    Msg::command(body.freeze())
}

/// Build the PONG reply for a received context.
#[must_use]
pub fn build_pong(context: &[u8]) -> Msg {
    debug_assert!(context.len() <= MAX_CONTEXT);
    let mut body = BytesMut::with_capacity(1 + PONG.len() + context.len());
    begin_command(&mut body, "PONG");
    body.extend_from_slice(context);
    Msg::command(body.freeze())
}

/// Parse a PING body (full command payload).
pub fn parse_ping(payload: &Bytes) -> Result<Ping, EngineError> {
    let cmd = parse_command(payload)?;
    debug_assert_eq!(cmd.name, PING);
    if cmd.data.len() < 2 {
        return Err(EngineError::Framing("PING missing TTL"));
    }
    let ttl_ds = u16::from_be_bytes([cmd.data[0], cmd.data[1]]);
    let context = &cmd.data[2..];
    let take = context.len().min(MAX_CONTEXT);
    Ok(Ping {
        ttl: Duration::from_millis(u64::from(ttl_ds) * 100),
        context: Bytes::copy_from_slice(&context[..take]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trip() {
        let msg = build_ping(25, b"ctx");
        assert!(msg.is_command());
        let ping = parse_ping(msg.data()).unwrap();
        assert_eq!(ping.ttl, Duration::from_millis(2500));
        assert_eq!(ping.context.as_ref(), b"ctx");
    }

    #[test]
    fn oversized_context_is_truncated() {
        let long = [b'x'; 40];
        let mut body = BytesMut::new();
        begin_command(&mut body, "PING");
        body.put_u16(0);
        body.extend_from_slice(&long);

        let ping = parse_ping(&body.freeze()).unwrap();
        assert_eq!(ping.context.len(), MAX_CONTEXT);
        assert_eq!(ping.ttl, Duration::ZERO);
    }

    #[test]
    fn missing_ttl_is_rejected() {
        let mut body = BytesMut::new();
        begin_command(&mut body, "PING");
        body.put_u8(0);
        assert!(parse_ping(&body.freeze()).is_err());
    }

    #[test]
    fn pong_echoes_context() {
        let msg = build_pong(b"abc");
        let cmd = parse_command(msg.data()).unwrap();
        assert_eq!(cmd.name, PONG);
        assert_eq!(cmd.data, b"abc");
    }
}
