//! Error taxonomy for the stream engine.
//!
//! Three kinds surface to the session: connection (transport-level),
//! protocol (peer misbehavior, crypto failure, framing violation) and
//! timeout (handshake / heartbeat timers). Everything the engine can fail
//! with maps onto one of the three via [`EngineError::reason`].

use std::io;
use std::time::Duration;
use thiserror::Error;

/// The coarse error kind reported through `Session::engine_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    /// Transport-level failure: peer closed, read/write error.
    Connection,
    /// Protocol violation: framing, greeting, mechanism or crypto failure.
    Protocol,
    /// A handshake or heartbeat timer expired.
    Timeout,
}

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Read returned zero bytes
    #[error("Peer closed the connection")]
    PeerClosed,

    /// Frame-level protocol violation
    #[error("Framing error: {0}")]
    Framing(&'static str),

    /// Message exceeded the configured limit
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u64, max: u64 },

    /// Malformed or disallowed greeting
    #[error("Invalid greeting: {0}")]
    InvalidGreeting(&'static str),

    /// ZAP is enabled but the peer negotiated a pre-v3 protocol
    #[error("ZAP authentication requires ZMTP 3.x")]
    ZapRequiresV3,

    /// Security mechanism state violation or crypto failure
    #[error("Mechanism error: {0}")]
    Mechanism(&'static str),

    /// Peer sent an ERROR command with the given status
    #[error("Peer rejected handshake: {0:?}")]
    PeerError(String),

    /// Session rejected a message for a reason other than backpressure
    #[error("Session rejected message")]
    SessionRejected,

    /// Handshake did not complete within the configured interval
    #[error("Handshake timeout after {0:?}")]
    HandshakeTimeout(Duration),

    /// Peer did not answer a PING in time
    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    /// Peer-announced TTL elapsed with no traffic
    #[error("Heartbeat TTL expired")]
    TtlExpired,
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Map onto the kind the session sees.
    #[must_use]
    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::Io(_) | Self::PeerClosed => ErrorReason::Connection,
            Self::HandshakeTimeout(_) | Self::HeartbeatTimeout | Self::TtlExpired => {
                ErrorReason::Timeout
            }
            _ => ErrorReason::Protocol,
        }
    }

    /// EAGAIN-class errors that mean "try again on the next readiness
    /// callback" rather than "tear the connection down".
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
