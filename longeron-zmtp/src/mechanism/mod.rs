//! Security mechanisms.
//!
//! Each variant is its own state machine; the engine drives whichever one
//! the greeting selected through the shared capability set below:
//!
//! - `process_handshake_command`: feed an inbound command frame
//! - `next_handshake_command`: poll the next outbound command frame
//! - `status`: Handshaking until a terminal Ready or Error
//! - `encode` / `decode`: per-message transform once Ready
//! - `zap_msg_available`: continuation when a deferred ZAP reply lands
//!
//! Modeled as a sum type rather than trait objects: the engine owns exactly
//! one mechanism whose variant is fixed at greeting time, and match-based
//! dispatch keeps the per-variant state visible.

pub mod curve;
pub mod null;
pub mod plain;
pub mod zap;

use crate::session::Session;
use bytes::{Bytes, BytesMut};
use longeron_core::error::EngineError;
use longeron_core::metadata::{self, Metadata};
use longeron_core::msg::Msg;
use longeron_core::options::{MechanismKind, Options};
use longeron_core::socket_type::SocketType;

pub use curve::{CurveClient, CurveKeyPair, CurvePublicKey, CurveSecretKey, CurveServer};
pub use null::NullMechanism;
pub use plain::{PlainClient, PlainServer};
pub use zap::{ZapReply, ZapRequest};

/// Where a mechanism stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismStatus {
    /// Handshake still in flight.
    Handshaking,
    /// Terminal: the message phase may begin.
    Ready,
    /// Terminal: an ERROR command is queued or already sent; the engine
    /// flushes it and then fails the connection.
    Error,
}

/// In handshake, any non-command frame is a violation.
#[inline]
pub fn require_command(msg: &Msg) -> Result<(), EngineError> {
    if msg.is_command() {
        Ok(())
    } else {
        Err(EngineError::Mechanism("data frame during handshake"))
    }
}

/// Handshake metadata we announce to the peer, in emission order:
/// `Socket-Type`, then `Identity` for the socket types that carry one,
/// then the optional self-address property.
pub(crate) fn local_properties(options: &Options, local_address: Option<&str>) -> Bytes {
    let mut dst = BytesMut::new();
    Metadata::put_property(
        &mut dst,
        metadata::SOCKET_TYPE,
        options.socket_type.as_str().as_bytes(),
    );
    if matches!(
        options.socket_type,
        SocketType::Req | SocketType::Dealer | SocketType::Router
    ) && !options.identity.is_empty()
    {
        Metadata::put_property(&mut dst, metadata::IDENTITY, &options.identity);
    }
    if let (Some(name), Some(addr)) = (&options.self_address_property_name, local_address) {
        Metadata::put_property(&mut dst, name, addr.as_bytes());
    }
    dst.freeze()
}

/// Outcome of kicking off a ZAP exchange.
pub(crate) enum ZapFlow {
    /// No authenticator reachable; proceed unauthenticated.
    NotRequired,
    /// Request sent, reply not yet available.
    Pending,
    /// Reply already arrived.
    Decided(ZapReply),
}

/// Connect to the ZAP handler, send the request, and poll once for the
/// reply. Both the synchronous and the deferred path continue through the
/// caller's single status handler.
pub(crate) fn begin_zap(
    request: &ZapRequest,
    session: &mut dyn Session,
) -> Result<ZapFlow, EngineError> {
    if session.zap_connect().is_err() {
        return Ok(ZapFlow::NotRequired);
    }
    request.send(session)?;
    match zap::try_receive_reply(session)? {
        Some(reply) => Ok(ZapFlow::Decided(reply)),
        None => Ok(ZapFlow::Pending),
    }
}

/// The one-of-a-kind security mechanism of a connection.
pub enum SecurityMechanism {
    Null(NullMechanism),
    PlainClient(PlainClient),
    PlainServer(PlainServer),
    CurveClient(CurveClient),
    CurveServer(CurveServer),
}

impl SecurityMechanism {
    /// Instantiate the variant the options select.
    pub fn new(
        options: &Options,
        local_address: Option<&str>,
        peer_address: Option<&str>,
    ) -> Result<Self, EngineError> {
        let properties = local_properties(options, local_address);
        match options.mechanism {
            MechanismKind::Null => Ok(Self::Null(NullMechanism::new(
                options,
                properties,
                peer_address,
            ))),
            MechanismKind::Plain => {
                if options.as_server {
                    Ok(Self::PlainServer(PlainServer::new(
                        options,
                        properties,
                        peer_address,
                    )))
                } else {
                    Ok(Self::PlainClient(PlainClient::new(options, properties)))
                }
            }
            MechanismKind::Curve => {
                if options.as_server {
                    Ok(Self::CurveServer(CurveServer::new(
                        options,
                        properties,
                        peer_address,
                    )?))
                } else {
                    Ok(Self::CurveClient(CurveClient::new(options, properties)?))
                }
            }
            MechanismKind::Gssapi => Err(EngineError::Mechanism("GSSAPI is not built")),
        }
    }

    #[must_use]
    pub fn status(&self) -> MechanismStatus {
        match self {
            Self::Null(m) => m.status(),
            Self::PlainClient(m) => m.status(),
            Self::PlainServer(m) => m.status(),
            Self::CurveClient(m) => m.status(),
            Self::CurveServer(m) => m.status(),
        }
    }

    /// Poll the next outbound handshake command.
    pub fn next_handshake_command(&mut self) -> Result<Option<Msg>, EngineError> {
        match self {
            Self::Null(m) => m.next_handshake_command(),
            Self::PlainClient(m) => m.next_handshake_command(),
            Self::PlainServer(m) => m.next_handshake_command(),
            Self::CurveClient(m) => m.next_handshake_command(),
            Self::CurveServer(m) => m.next_handshake_command(),
        }
    }

    /// Feed an inbound handshake command.
    pub fn process_handshake_command(
        &mut self,
        msg: &Msg,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        require_command(msg)?;
        match self {
            Self::Null(m) => m.process_handshake_command(msg, session),
            Self::PlainClient(m) => m.process_handshake_command(msg),
            Self::PlainServer(m) => m.process_handshake_command(msg, session),
            Self::CurveClient(m) => m.process_handshake_command(msg),
            Self::CurveServer(m) => m.process_handshake_command(msg, session),
        }
    }

    /// Continuation once the session signals a readable ZAP reply.
    pub fn zap_msg_available(&mut self, session: &mut dyn Session) -> Result<(), EngineError> {
        match self {
            Self::Null(m) => m.zap_msg_available(session),
            Self::PlainServer(m) => m.zap_msg_available(session),
            Self::CurveServer(m) => m.zap_msg_available(session),
            Self::PlainClient(_) | Self::CurveClient(_) => Ok(()),
        }
    }

    /// Whether the handshake is stalled on an authenticator reply.
    #[must_use]
    pub fn awaiting_zap_reply(&self) -> bool {
        match self {
            Self::Null(m) => m.awaiting_zap_reply(),
            Self::PlainServer(m) => m.awaiting_zap_reply(),
            Self::CurveServer(m) => m.awaiting_zap_reply(),
            Self::PlainClient(_) | Self::CurveClient(_) => false,
        }
    }

    /// Transform an outbound message once Ready.
    pub fn encode(&mut self, msg: Msg) -> Result<Msg, EngineError> {
        match self {
            Self::CurveClient(m) => m.encode(msg),
            Self::CurveServer(m) => m.encode(msg),
            _ => Ok(msg),
        }
    }

    /// Transform an inbound message once Ready.
    pub fn decode(&mut self, msg: Msg) -> Result<Msg, EngineError> {
        match self {
            Self::CurveClient(m) => m.decode(&msg),
            Self::CurveServer(m) => m.decode(&msg),
            _ => Ok(msg),
        }
    }

    /// Peer metadata gathered from READY/INITIATE plus the authenticated
    /// user id, available once Ready.
    #[must_use]
    pub fn peer_metadata(&self) -> Metadata {
        let mut meta = match self {
            Self::Null(m) => m.peer_metadata().clone(),
            Self::PlainClient(m) => m.peer_metadata().clone(),
            Self::PlainServer(m) => m.peer_metadata().clone(),
            Self::CurveClient(m) => m.peer_metadata().clone(),
            Self::CurveServer(m) => m.peer_metadata().clone(),
        };
        if let Some(user_id) = self.user_id() {
            meta.insert(metadata::USER_ID, user_id.clone());
        }
        meta
    }

    /// Authenticated user id from the ZAP reply, when there was one.
    #[must_use]
    pub fn user_id(&self) -> Option<&Bytes> {
        match self {
            Self::Null(m) => m.user_id(),
            Self::PlainServer(m) => m.user_id(),
            Self::CurveServer(m) => m.user_id(),
            Self::PlainClient(_) | Self::CurveClient(_) => None,
        }
    }
}
