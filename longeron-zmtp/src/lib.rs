//! # Longeron ZMTP
//!
//! **Stream engine core for the Longeron messaging library.**
//!
//! This crate drives one connected stream transport from peer attachment to
//! teardown: protocol version negotiation, the security handshake, message
//! framing with batching and backpressure, and heartbeat traffic, all on a
//! single non-blocking socket, scheduled by an external reactor.
//!
//! ## Architecture
//!
//! ```text
//!   reactor callbacks          session (queues)
//!   readable/writable/timer    pull_msg / push_msg
//!            │                        ▲
//!            ▼                        │
//!        StreamEngine ── mechanism ── codec
//!            │
//!         transport (TCP / UNIX)
//! ```
//!
//! The reactor, session and ZAP authenticator are collaborators the engine
//! only knows through traits (`longeron_core::reactor::Poller`,
//! [`session::Session`]); the concrete cryptographic primitives come from
//! `x25519-dalek` / `chacha20poly1305`.
//!
//! ## Features
//!
//! - **Zero-copy**: payloads travel as `Bytes` end to end
//! - **Sans-runtime**: no async executor; the engine is a state machine
//!   driven by readiness callbacks
//! - **ZMTP v0-v3**: downgrade paths for unversioned and 1.0/2.0 peers
//! - **NULL / PLAIN / CURVE**: pluggable security with ZAP authentication

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)] // Style preference
#![allow(clippy::never_loop)] // State machines use loop with early returns

// Internal modules
mod command;

// Public protocol types
pub mod codec;
pub mod engine;
pub mod greeting;
pub mod heartbeat;
pub mod mechanism;
pub mod session;

// Re-export the core building blocks downstream code always needs
pub use engine::StreamEngine;
pub use longeron_core::error::{EngineError, ErrorReason};
pub use longeron_core::msg::Msg;
pub use longeron_core::options::{MechanismKind, Options};
pub use longeron_core::socket_type::SocketType;

/// Prelude module for convenient imports
///
/// ```rust
/// use longeron_zmtp::prelude::*;
/// ```
pub mod prelude {
    pub use crate::engine::StreamEngine;
    pub use crate::greeting::Revision;
    pub use crate::session::{PushError, Session};
    pub use bytes::Bytes;
    pub use longeron_core::error::{EngineError, ErrorReason};
    pub use longeron_core::msg::Msg;
    pub use longeron_core::options::{MechanismKind, Options};
    pub use longeron_core::reactor::{Poller, TimerId};
    pub use longeron_core::socket_type::SocketType;
    pub use longeron_core::transport::Transport;
}
