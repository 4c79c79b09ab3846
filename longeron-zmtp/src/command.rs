//! ZMTP command body helpers.
//!
//! A command body is `name-length(u8) || name || data`; handshake commands
//! (READY, INITIATE metadata) follow the name with a property dictionary.

use bytes::{BufMut, Bytes, BytesMut};
use longeron_core::error::EngineError;
use longeron_core::metadata::Metadata;

/// Parsed command: name plus the body remainder (borrowed view).
#[derive(Debug, Clone)]
pub struct Command<'a> {
    pub name: &'a [u8],
    pub data: &'a [u8],
}

/// Split a command body into name and data.
pub fn parse_command(payload: &[u8]) -> Result<Command<'_>, EngineError> {
    if payload.is_empty() {
        return Err(EngineError::Framing("empty command"));
    }
    let name_len = payload[0] as usize;
    if payload.len() < 1 + name_len {
        return Err(EngineError::Framing("truncated command name"));
    }
    Ok(Command {
        name: &payload[1..1 + name_len],
        data: &payload[1 + name_len..],
    })
}

/// Start a command body with its short-string name.
pub fn begin_command(dst: &mut BytesMut, name: &str) {
    debug_assert!(name.len() <= u8::MAX as usize);
    dst.put_u8(name.len() as u8);
    dst.extend_from_slice(name.as_bytes());
}

/// Append a short string (1-byte length prefix).
pub fn put_short_string(dst: &mut BytesMut, value: &[u8]) {
    debug_assert!(value.len() <= u8::MAX as usize);
    dst.put_u8(value.len() as u8);
    dst.extend_from_slice(value);
}

/// Read a short string, returning (value, rest).
pub fn parse_short_string(src: &[u8]) -> Result<(&[u8], &[u8]), EngineError> {
    if src.is_empty() {
        return Err(EngineError::Framing("truncated short string"));
    }
    let len = src[0] as usize;
    if src.len() < 1 + len {
        return Err(EngineError::Framing("truncated short string"));
    }
    Ok((&src[1..1 + len], &src[1 + len..]))
}

/// Build a command body from a name and pre-encoded properties
/// (READY, PLAIN INITIATE).
pub fn build_command_with_properties(name: &str, properties: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(1 + name.len() + properties.len());
    begin_command(&mut body, name);
    body.extend_from_slice(properties);
    body.freeze()
}

/// READY body from pre-encoded properties.
pub fn build_ready_from_properties(properties: &[u8]) -> Bytes {
    build_command_with_properties("READY", properties)
}

/// Build an ERROR body carrying a short-string status.
pub fn build_error(status: &[u8]) -> Bytes {
    let mut body = BytesMut::new();
    begin_command(&mut body, "ERROR");
    put_short_string(&mut body, status);
    body.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_body_parses_back() {
        let mut props = BytesMut::new();
        Metadata::put_property(&mut props, longeron_core::metadata::SOCKET_TYPE, b"DEALER");
        Metadata::put_property(&mut props, longeron_core::metadata::IDENTITY, b"w1");

        let body = build_ready_from_properties(&props);
        let cmd = parse_command(&body).unwrap();
        assert_eq!(cmd.name, b"READY");

        let parsed = Metadata::parse(&Bytes::copy_from_slice(cmd.data)).unwrap();
        assert_eq!(
            parsed.get(longeron_core::metadata::SOCKET_TYPE).unwrap().as_ref(),
            b"DEALER"
        );
        assert_eq!(
            parsed.get(longeron_core::metadata::IDENTITY).unwrap().as_ref(),
            b"w1"
        );
    }

    #[test]
    fn error_body_round_trips() {
        let body = build_error(b"400");
        let cmd = parse_command(&body).unwrap();
        assert_eq!(cmd.name, b"ERROR");
        let (status, rest) = parse_short_string(cmd.data).unwrap();
        assert_eq!(status, b"400");
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_name_is_rejected() {
        assert!(parse_command(&[5, b'R', b'E']).is_err());
        assert!(parse_command(&[]).is_err());
    }
}
