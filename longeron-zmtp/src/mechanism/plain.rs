//! PLAIN mechanism (RFC 24): cleartext username/password.
//!
//! ```text
//! Client                         Server
//!   |--- HELLO (user, pass) ------->|
//!   |                               |   (ZAP check)
//!   |<-- WELCOME -------------------|
//!   |--- INITIATE (metadata) ------>|
//!   |<-- READY (metadata) ----------|
//! ```
//!
//! Credentials travel unencrypted; this mechanism exists for loopback and
//! already-protected links.

use super::zap::{ZapReply, ZapRequest};
use super::{begin_zap, MechanismStatus, ZapFlow};
use crate::command::{
    build_command_with_properties, build_error, build_ready_from_properties, parse_command,
    parse_short_string, put_short_string,
};
use crate::session::Session;
use bytes::{Bytes, BytesMut};
use longeron_core::error::EngineError;
use longeron_core::metadata::Metadata;
use longeron_core::msg::Msg;
use longeron_core::options::Options;
use smallvec::SmallVec;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    SendHello,
    ExpectWelcome,
    SendInitiate,
    ExpectReady,
    Connected,
}

pub struct PlainClient {
    state: ClientState,
    username: String,
    password: String,
    properties: Bytes,
    peer_metadata: Metadata,
}

impl PlainClient {
    pub fn new(options: &Options, properties: Bytes) -> Self {
        Self {
            state: ClientState::SendHello,
            username: options.plain_username.clone(),
            password: options.plain_password.clone(),
            properties,
            peer_metadata: Metadata::new(),
        }
    }

    pub fn status(&self) -> MechanismStatus {
        if self.state == ClientState::Connected {
            MechanismStatus::Ready
        } else {
            MechanismStatus::Handshaking
        }
    }

    pub fn next_handshake_command(&mut self) -> Result<Option<Msg>, EngineError> {
        match self.state {
            ClientState::SendHello => {
                let mut body = BytesMut::new();
                crate::command::begin_command(&mut body, "HELLO");
                put_short_string(&mut body, self.username.as_bytes());
                put_short_string(&mut body, self.password.as_bytes());
                self.state = ClientState::ExpectWelcome;
                Ok(Some(Msg::command(body.freeze())))
            }
            ClientState::SendInitiate => {
                let body = build_command_with_properties("INITIATE", &self.properties);
                self.state = ClientState::ExpectReady;
                Ok(Some(Msg::command(body)))
            }
            _ => Ok(None),
        }
    }

    pub fn process_handshake_command(&mut self, msg: &Msg) -> Result<(), EngineError> {
        let cmd = parse_command(msg.data())?;
        match (cmd.name, self.state) {
            (b"WELCOME", ClientState::ExpectWelcome) => {
                if !cmd.data.is_empty() {
                    return Err(EngineError::Mechanism("WELCOME carries no body"));
                }
                self.state = ClientState::SendInitiate;
                Ok(())
            }
            (b"READY", ClientState::ExpectReady) => {
                self.peer_metadata = Metadata::parse(&msg.data().slice_ref(cmd.data))
                    .map_err(|_| EngineError::Mechanism("malformed READY metadata"))?;
                self.state = ClientState::Connected;
                debug!("PLAIN client connected");
                Ok(())
            }
            (b"ERROR", _) => {
                let (status, _) = parse_short_string(cmd.data)?;
                Err(EngineError::PeerError(
                    String::from_utf8_lossy(status).into_owned(),
                ))
            }
            _ => Err(EngineError::Mechanism("unexpected command in PLAIN handshake")),
        }
    }

    pub fn peer_metadata(&self) -> &Metadata {
        &self.peer_metadata
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    ExpectHello,
    ExpectZapReply,
    SendWelcome,
    ExpectInitiate,
    SendReady,
    SendError,
    Connected,
    ErrorSent,
}

pub struct PlainServer {
    state: ServerState,
    properties: Bytes,
    zap_domain: String,
    peer_address: String,
    identity: Bytes,

    pending_error: Option<Bytes>,
    peer_metadata: Metadata,
    user_id: Option<Bytes>,
}

impl PlainServer {
    pub fn new(options: &Options, properties: Bytes, peer_address: Option<&str>) -> Self {
        Self {
            state: ServerState::ExpectHello,
            properties,
            zap_domain: options.zap_domain.clone(),
            peer_address: peer_address.unwrap_or_default().to_owned(),
            identity: options.identity.clone(),
            pending_error: None,
            peer_metadata: Metadata::new(),
            user_id: None,
        }
    }

    pub fn status(&self) -> MechanismStatus {
        match self.state {
            ServerState::Connected => MechanismStatus::Ready,
            ServerState::SendError | ServerState::ErrorSent => MechanismStatus::Error,
            _ => MechanismStatus::Handshaking,
        }
    }

    pub fn next_handshake_command(&mut self) -> Result<Option<Msg>, EngineError> {
        match self.state {
            ServerState::SendWelcome => {
                self.state = ServerState::ExpectInitiate;
                let mut body = BytesMut::new();
                crate::command::begin_command(&mut body, "WELCOME");
                Ok(Some(Msg::command(body.freeze())))
            }
            ServerState::SendReady => {
                self.state = ServerState::Connected;
                debug!("PLAIN server connected");
                Ok(Some(Msg::command(build_ready_from_properties(
                    &self.properties,
                ))))
            }
            ServerState::SendError => {
                self.state = ServerState::ErrorSent;
                let status = self.pending_error.take().unwrap_or_default();
                Ok(Some(Msg::command(build_error(&status))))
            }
            _ => Ok(None),
        }
    }

    pub fn process_handshake_command(
        &mut self,
        msg: &Msg,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        let cmd = parse_command(msg.data())?;
        match (cmd.name, self.state) {
            (b"HELLO", ServerState::ExpectHello) => {
                let (username, rest) = parse_short_string(cmd.data)?;
                let (password, rest) = parse_short_string(rest)?;
                if !rest.is_empty() {
                    return Err(EngineError::Mechanism("trailing bytes in HELLO"));
                }

                let request = ZapRequest {
                    domain: self.zap_domain.clone(),
                    address: self.peer_address.clone(),
                    identity: self.identity.clone(),
                    mechanism: "PLAIN",
                    credentials: SmallVec::from_vec(vec![
                        Bytes::copy_from_slice(username),
                        Bytes::copy_from_slice(password),
                    ]),
                };
                match begin_zap(&request, session)? {
                    ZapFlow::NotRequired => self.state = ServerState::SendWelcome,
                    ZapFlow::Pending => self.state = ServerState::ExpectZapReply,
                    ZapFlow::Decided(reply) => self.handle_zap_reply(&reply),
                }
                Ok(())
            }
            (b"INITIATE", ServerState::ExpectInitiate) => {
                self.peer_metadata = Metadata::parse(&msg.data().slice_ref(cmd.data))
                    .map_err(|_| EngineError::Mechanism("malformed INITIATE metadata"))?;
                self.state = ServerState::SendReady;
                Ok(())
            }
            (b"ERROR", _) => {
                let (status, _) = parse_short_string(cmd.data)?;
                Err(EngineError::PeerError(
                    String::from_utf8_lossy(status).into_owned(),
                ))
            }
            _ => Err(EngineError::Mechanism("unexpected command in PLAIN handshake")),
        }
    }

    pub fn zap_msg_available(&mut self, session: &mut dyn Session) -> Result<(), EngineError> {
        if self.state != ServerState::ExpectZapReply {
            return Ok(());
        }
        if let Some(reply) = super::zap::try_receive_reply(session)? {
            self.handle_zap_reply(&reply);
        }
        Ok(())
    }

    fn handle_zap_reply(&mut self, reply: &ZapReply) {
        if reply.is_success() {
            self.user_id = Some(reply.user_id.clone());
            self.state = ServerState::SendWelcome;
        } else {
            self.pending_error = Some(reply.status_code.clone());
            self.state = ServerState::SendError;
        }
    }

    pub fn awaiting_zap_reply(&self) -> bool {
        self.state == ServerState::ExpectZapReply
    }

    pub fn peer_metadata(&self) -> &Metadata {
        &self.peer_metadata
    }

    pub fn user_id(&self) -> Option<&Bytes> {
        self.user_id.as_ref()
    }
}
