//! ZAP (ZeroMQ Authentication Protocol) exchange.
//!
//! The mechanism talks to the authenticator through the session's ZAP pipe
//! as multipart messages. A request is seven-plus frames, a reply exactly
//! seven, both starting with an empty delimiter frame:
//!
//! **Request**: delimiter, version "1.0", request id, domain, address,
//! identity, mechanism, credentials...
//!
//! **Reply**: delimiter, version "1.0", request id, status code, status
//! text, user id, metadata.
//!
//! Status codes: "200" accepted, "300" temporary error, "400" denied,
//! "500" internal error.

use crate::session::Session;
use bytes::Bytes;
use longeron_core::error::EngineError;
use longeron_core::metadata::Metadata;
use longeron_core::msg::Msg;
use smallvec::SmallVec;
use tracing::{debug, warn};

pub const ZAP_VERSION: &[u8] = b"1.0";
/// One request per connection; the id only disambiguates pipelining.
pub const REQUEST_ID: &[u8] = b"1";

pub const STATUS_SUCCESS: &[u8] = b"200";

/// An authentication request ready to be written to the ZAP pipe.
pub struct ZapRequest {
    pub domain: String,
    pub address: String,
    pub identity: Bytes,
    pub mechanism: &'static str,
    pub credentials: SmallVec<[Bytes; 2]>,
}

impl ZapRequest {
    /// Write the request frames through the session.
    pub fn send(&self, session: &mut dyn Session) -> Result<(), EngineError> {
        let mut frames: SmallVec<[Bytes; 8]> = SmallVec::new();
        frames.push(Bytes::new());
        frames.push(Bytes::from_static(ZAP_VERSION));
        frames.push(Bytes::from_static(REQUEST_ID));
        frames.push(Bytes::copy_from_slice(self.domain.as_bytes()));
        frames.push(Bytes::copy_from_slice(self.address.as_bytes()));
        frames.push(self.identity.clone());
        frames.push(Bytes::from_static(self.mechanism.as_bytes()));
        frames.extend(self.credentials.iter().cloned());

        let last = frames.len() - 1;
        for (i, data) in frames.into_iter().enumerate() {
            let msg = Msg::new(data).with_more(i < last);
            session
                .write_zap_msg(msg)
                .map_err(|_| EngineError::Mechanism("ZAP pipe rejected request"))?;
        }
        debug!(mechanism = self.mechanism, domain = %self.domain, "ZAP request sent");
        Ok(())
    }
}

/// A validated authenticator reply.
#[derive(Debug)]
pub struct ZapReply {
    pub status_code: Bytes,
    pub status_text: Bytes,
    pub user_id: Bytes,
    pub metadata: Metadata,
}

impl ZapReply {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_code.as_ref() == STATUS_SUCCESS
    }
}

/// Drain a reply from the ZAP pipe.
///
/// Returns `Ok(None)` when no reply has arrived yet. Once the first frame
/// is readable the whole reply must be: a reply truncated mid-way is a
/// mechanism failure, not backpressure.
pub fn try_receive_reply(session: &mut dyn Session) -> Result<Option<ZapReply>, EngineError> {
    let Some(delimiter) = session.read_zap_msg() else {
        return Ok(None);
    };
    if !delimiter.is_empty() || !delimiter.has_more() {
        return Err(EngineError::Mechanism("malformed ZAP reply delimiter"));
    }

    let mut frames: SmallVec<[Msg; 6]> = SmallVec::new();
    for _ in 0..6 {
        let frame = session
            .read_zap_msg()
            .ok_or(EngineError::Mechanism("truncated ZAP reply"))?;
        frames.push(frame);
    }
    if frames[5].has_more() {
        return Err(EngineError::Mechanism("overlong ZAP reply"));
    }

    if frames[0].data().as_ref() != ZAP_VERSION {
        return Err(EngineError::Mechanism("bad ZAP version"));
    }
    if frames[1].data().as_ref() != REQUEST_ID {
        return Err(EngineError::Mechanism("ZAP request id mismatch"));
    }

    let status_code = frames[2].data().clone();
    if status_code.len() != 3 || !status_code.iter().all(u8::is_ascii_digit) {
        return Err(EngineError::Mechanism("malformed ZAP status code"));
    }

    let metadata = Metadata::parse(frames[5].data())
        .map_err(|_| EngineError::Mechanism("malformed ZAP metadata"))?;

    let reply = ZapReply {
        status_code,
        status_text: frames[3].data().clone(),
        user_id: frames[4].data().clone(),
        metadata,
    };
    if reply.is_success() {
        debug!(user_id = ?reply.user_id, "ZAP accepted");
    } else {
        warn!(status = ?reply.status_code, text = ?reply.status_text, "ZAP denied");
    }
    Ok(Some(reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PushError;
    use longeron_core::error::ErrorReason;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct PipeSession {
        written: Vec<Msg>,
        replies: VecDeque<Msg>,
    }

    impl Session for PipeSession {
        fn pull_msg(&mut self) -> Option<Msg> {
            None
        }
        fn push_msg(&mut self, _msg: Msg) -> Result<(), PushError> {
            Ok(())
        }
        fn flush(&mut self) {}
        fn read_zap_msg(&mut self) -> Option<Msg> {
            self.replies.pop_front()
        }
        fn write_zap_msg(&mut self, msg: Msg) -> Result<(), PushError> {
            self.written.push(msg);
            Ok(())
        }
        fn engine_error(&mut self, _handshaked: bool, _reason: ErrorReason) {}
    }

    fn reply_frames(status: &'static [u8]) -> VecDeque<Msg> {
        let parts: [&'static [u8]; 7] =
            [b"", b"1.0", b"1", status, b"OK", b"admin", b""];
        parts
            .iter()
            .enumerate()
            .map(|(i, p)| Msg::new(Bytes::from_static(p)).with_more(i < 6))
            .collect()
    }

    #[test]
    fn request_frames_have_more_chain() {
        let mut session = PipeSession::default();
        let req = ZapRequest {
            domain: "global".into(),
            address: "127.0.0.1:4444".into(),
            identity: Bytes::new(),
            mechanism: "CURVE",
            credentials: SmallVec::from_vec(vec![Bytes::from_static(&[0x11; 32])]),
        };
        req.send(&mut session).unwrap();

        assert_eq!(session.written.len(), 8);
        assert!(session.written[..7].iter().all(Msg::has_more));
        assert!(!session.written[7].has_more());
        assert_eq!(session.written[6].data().as_ref(), b"CURVE");
    }

    #[test]
    fn reply_parses_and_reports_success() {
        let mut session = PipeSession {
            replies: reply_frames(b"200"),
            ..Default::default()
        };
        let reply = try_receive_reply(&mut session).unwrap().unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.user_id.as_ref(), b"admin");
    }

    #[test]
    fn denial_is_not_success() {
        let mut session = PipeSession {
            replies: reply_frames(b"400"),
            ..Default::default()
        };
        let reply = try_receive_reply(&mut session).unwrap().unwrap();
        assert!(!reply.is_success());
    }

    #[test]
    fn empty_pipe_returns_none() {
        let mut session = PipeSession::default();
        assert!(try_receive_reply(&mut session).unwrap().is_none());
    }

    #[test]
    fn truncated_reply_is_an_error() {
        let mut frames = reply_frames(b"200");
        frames.truncate(3);
        let mut session = PipeSession {
            replies: frames,
            ..Default::default()
        };
        assert!(try_receive_reply(&mut session).is_err());
    }

    #[test]
    fn garbage_status_is_rejected() {
        let mut session = PipeSession {
            replies: reply_frames(b"ok!"),
            ..Default::default()
        };
        assert!(try_receive_reply(&mut session).is_err());
    }
}
