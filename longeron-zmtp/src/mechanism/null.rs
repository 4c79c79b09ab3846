//! NULL mechanism: a READY exchange and nothing more.
//!
//! Clients emit READY eagerly; a server defers its READY until the peer's
//! has arrived so an authenticator (when one is reachable) can veto the
//! connection first.

use super::zap::{ZapReply, ZapRequest};
use super::{begin_zap, MechanismStatus, ZapFlow};
use crate::command::{build_error, build_ready_from_properties, parse_command, parse_short_string};
use crate::session::Session;
use bytes::Bytes;
use longeron_core::error::EngineError;
use longeron_core::metadata::Metadata;
use longeron_core::msg::Msg;
use longeron_core::options::Options;
use smallvec::SmallVec;
use tracing::debug;

pub struct NullMechanism {
    as_server: bool,
    /// Encoded local handshake properties embedded in our READY.
    properties: Bytes,

    ready_sent: bool,
    ready_received: bool,
    awaiting_zap: bool,
    pending_error: Option<Bytes>,
    error_sent: bool,

    zap_domain: String,
    peer_address: String,
    identity: Bytes,

    peer_metadata: Metadata,
    user_id: Option<Bytes>,
}

impl NullMechanism {
    pub fn new(options: &Options, properties: Bytes, peer_address: Option<&str>) -> Self {
        Self {
            as_server: options.as_server,
            properties,
            ready_sent: false,
            ready_received: false,
            awaiting_zap: false,
            pending_error: None,
            error_sent: false,
            zap_domain: options.zap_domain.clone(),
            peer_address: peer_address.unwrap_or_default().to_owned(),
            identity: options.identity.clone(),
            peer_metadata: Metadata::new(),
            user_id: None,
        }
    }

    pub fn status(&self) -> MechanismStatus {
        if self.error_sent || self.pending_error.is_some() {
            MechanismStatus::Error
        } else if self.ready_sent && self.ready_received {
            MechanismStatus::Ready
        } else {
            MechanismStatus::Handshaking
        }
    }

    pub fn next_handshake_command(&mut self) -> Result<Option<Msg>, EngineError> {
        if let Some(status) = self.pending_error.take() {
            self.error_sent = true;
            return Ok(Some(Msg::command(build_error(&status))));
        }
        if self.error_sent || self.ready_sent || self.awaiting_zap {
            return Ok(None);
        }
        // A server speaks second.
        if self.as_server && !self.ready_received {
            return Ok(None);
        }
        self.ready_sent = true;
        Ok(Some(Msg::command(build_ready_from_properties(
            &self.properties,
        ))))
    }

    pub fn process_handshake_command(
        &mut self,
        msg: &Msg,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        let cmd = parse_command(msg.data())?;
        match cmd.name {
            b"READY" => {
                if self.ready_received {
                    return Err(EngineError::Mechanism("duplicate READY"));
                }
                self.peer_metadata = Metadata::parse(&msg.data().slice_ref(cmd.data))
                    .map_err(|_| EngineError::Mechanism("malformed READY metadata"))?;
                self.ready_received = true;
                debug!(props = self.peer_metadata.len(), "NULL peer READY");

                if self.as_server {
                    let request = ZapRequest {
                        domain: self.zap_domain.clone(),
                        address: self.peer_address.clone(),
                        identity: self.identity.clone(),
                        mechanism: "NULL",
                        credentials: SmallVec::new(),
                    };
                    match begin_zap(&request, session)? {
                        ZapFlow::NotRequired => {}
                        ZapFlow::Pending => self.awaiting_zap = true,
                        ZapFlow::Decided(reply) => self.handle_zap_reply(&reply),
                    }
                }
                Ok(())
            }
            b"ERROR" => {
                let (status, _) = parse_short_string(cmd.data)?;
                Err(EngineError::PeerError(
                    String::from_utf8_lossy(status).into_owned(),
                ))
            }
            _ => Err(EngineError::Mechanism("unexpected command in NULL handshake")),
        }
    }

    pub fn zap_msg_available(&mut self, session: &mut dyn Session) -> Result<(), EngineError> {
        if !self.awaiting_zap {
            return Ok(());
        }
        if let Some(reply) = super::zap::try_receive_reply(session)? {
            self.awaiting_zap = false;
            self.handle_zap_reply(&reply);
        }
        Ok(())
    }

    fn handle_zap_reply(&mut self, reply: &ZapReply) {
        if reply.is_success() {
            self.user_id = Some(reply.user_id.clone());
        } else {
            self.pending_error = Some(reply.status_code.clone());
        }
    }

    pub fn awaiting_zap_reply(&self) -> bool {
        self.awaiting_zap
    }

    pub fn peer_metadata(&self) -> &Metadata {
        &self.peer_metadata
    }

    pub fn user_id(&self) -> Option<&Bytes> {
        self.user_id.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::local_properties;
    use crate::session::PushError;
    use longeron_core::error::ErrorReason;
    use longeron_core::socket_type::SocketType;

    struct NoZapSession;

    impl Session for NoZapSession {
        fn pull_msg(&mut self) -> Option<Msg> {
            None
        }
        fn push_msg(&mut self, _msg: Msg) -> Result<(), PushError> {
            Ok(())
        }
        fn flush(&mut self) {}
        fn engine_error(&mut self, _handshaked: bool, _reason: ErrorReason) {}
    }

    fn mechanism(as_server: bool) -> NullMechanism {
        let options = Options::new(SocketType::Dealer)
            .with_identity(&b"peer-a"[..])
            .with_as_server(as_server);
        let props = local_properties(&options, None);
        NullMechanism::new(&options, props, None)
    }

    #[test]
    fn client_and_server_exchange_ready() {
        let mut client = mechanism(false);
        let mut server = mechanism(true);
        let mut session = NoZapSession;

        // Server speaks second.
        assert!(server.next_handshake_command().unwrap().is_none());

        let client_ready = client.next_handshake_command().unwrap().unwrap();
        server
            .process_handshake_command(&client_ready, &mut session)
            .unwrap();

        let server_ready = server.next_handshake_command().unwrap().unwrap();
        client
            .process_handshake_command(&server_ready, &mut session)
            .unwrap();

        assert_eq!(client.status(), MechanismStatus::Ready);
        assert_eq!(server.status(), MechanismStatus::Ready);
        assert_eq!(
            server
                .peer_metadata()
                .get(longeron_core::metadata::SOCKET_TYPE)
                .unwrap()
                .as_ref(),
            b"DEALER"
        );
    }

    #[test]
    fn duplicate_ready_is_rejected() {
        let mut server = mechanism(true);
        let mut client = mechanism(false);
        let mut session = NoZapSession;

        let ready = client.next_handshake_command().unwrap().unwrap();
        server
            .process_handshake_command(&ready, &mut session)
            .unwrap();
        assert!(server
            .process_handshake_command(&ready, &mut session)
            .is_err());
    }

    #[test]
    fn peer_error_command_fails_handshake() {
        let mut client = mechanism(false);
        let mut session = NoZapSession;
        let error = Msg::command(build_error(b"400"));
        assert!(matches!(
            client.process_handshake_command(&error, &mut session),
            Err(EngineError::PeerError(s)) if s == "400"
        ));
    }
}
