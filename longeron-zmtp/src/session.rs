//! The session contract.
//!
//! The session owns the application-visible queues; the engine only ever
//! talks to it through this trait, on the reactor thread. The engine holds
//! no owning reference; the reactor passes the session into each callback,
//! which is the borrow-checker-native form of the weak back-reference.

use longeron_core::error::ErrorReason;
use longeron_core::msg::Msg;

/// Why `push_msg` refused a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Queue full (EAGAIN): the session will call `restart_input` when it
    /// can accept again.
    Full,
    /// Refused for a non-backpressure reason; the engine treats this as a
    /// protocol error.
    Rejected,
}

/// The engine's upstream collaborator.
pub trait Session {
    /// Next application message to send, if any.
    fn pull_msg(&mut self) -> Option<Msg>;

    /// Deliver an inbound message.
    fn push_msg(&mut self, msg: Msg) -> Result<(), PushError>;

    /// Make previously pushed messages visible to the application.
    fn flush(&mut self);

    /// Whether a ZAP authenticator is configured.
    fn zap_enabled(&self) -> bool {
        false
    }

    /// Open the pipe to the ZAP handler. An error means no handler is
    /// reachable; the mechanism then proceeds unauthenticated.
    fn zap_connect(&mut self) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::NotConnected))
    }

    /// Next frame of a ZAP reply, or `None` if the reply has not arrived.
    fn read_zap_msg(&mut self) -> Option<Msg> {
        None
    }

    /// Queue one frame of a ZAP request.
    fn write_zap_msg(&mut self, msg: Msg) -> Result<(), PushError> {
        let _ = msg;
        Err(PushError::Rejected)
    }

    /// Terminal error notification. `handshaked` tells the session whether
    /// the connection ever reached the message phase (its cue for
    /// reconnect bookkeeping).
    fn engine_error(&mut self, handshaked: bool, reason: ErrorReason);

    /// Handshake completed; `revision` is the negotiated wire revision.
    fn event_handshaken(&mut self, endpoint: &str, revision: u8) {
        let _ = (endpoint, revision);
    }

    /// Transport-level disconnect observed.
    fn event_disconnected(&mut self, endpoint: &str) {
        let _ = endpoint;
    }

    /// Handshake failed with a peer-visible status (ERROR command status
    /// or a short violation description).
    fn event_handshake_failed(&mut self, endpoint: &str, status: &str) {
        let _ = (endpoint, status);
    }
}
