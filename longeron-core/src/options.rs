//! Engine configuration options
//!
//! This module provides the per-connection configuration the stream engine
//! consumes, similar to libzmq's socket options (zmq_setsockopt).

use crate::socket_type::SocketType;
use bytes::Bytes;
use std::time::Duration;

/// Security mechanism selector (ZMQ_MECHANISM).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MechanismKind {
    #[default]
    Null,
    Plain,
    Curve,
    /// Recognized but not built; selecting it fails the connection at plug.
    Gssapi,
}

/// Per-connection engine options.
///
/// # Examples
///
/// ```
/// use longeron_core::options::Options;
/// use longeron_core::socket_type::SocketType;
/// use std::time::Duration;
///
/// let opts = Options::new(SocketType::Dealer)
///     .with_heartbeat_interval(Duration::from_secs(1))
///     .with_handshake_interval(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Socket type announced in the greeting tail / READY property.
    pub socket_type: SocketType,

    /// Raw socket mode (ZMQ_STREAM-style): skip greeting and handshake,
    /// exchange unframed payloads, synthesize zero-length connect and
    /// disconnect messages.
    pub raw_socket: bool,

    /// Security mechanism to announce in a v3 greeting.
    pub mechanism: MechanismKind,

    /// Act as the mechanism server (PLAIN/CURVE role selection).
    pub as_server: bool,

    /// Connection identity (ZMQ_ROUTING_ID). Sent in the v0-v2 greeting
    /// tail and as the v3 READY `Identity` property. Empty = anonymous.
    pub identity: Bytes,

    /// Heartbeat PING interval (ZMQ_HEARTBEAT_IVL). Zero disables the
    /// PING subsystem.
    pub heartbeat_interval: Duration,

    /// Grace period for the peer's PONG (ZMQ_HEARTBEAT_TIMEOUT). Zero
    /// falls back to `heartbeat_interval`.
    pub heartbeat_timeout: Duration,

    /// TTL announced to the peer in our PINGs (ZMQ_HEARTBEAT_TTL),
    /// rounded down to deciseconds on the wire. Zero announces none.
    pub heartbeat_ttl: Duration,

    /// Opaque context bytes appended to outgoing PINGs (16 bytes max).
    pub heartbeat_context: Bytes,

    /// Overall handshake deadline (ZMQ_HANDSHAKE_IVL). Zero disables.
    pub handshake_interval: Duration,

    /// Inbound message size limit (ZMQ_MAXMSGSIZE). `None` = unlimited.
    pub max_msg_size: Option<u64>,

    /// Kernel receive buffer hint (ZMQ_RCVBUF); also the lower bound for
    /// the engine's read batch buffer. Zero = OS default.
    pub rcvbuf: usize,

    /// Kernel send buffer hint (ZMQ_SNDBUF); lower bound for the write
    /// batch. Zero = OS default.
    pub sndbuf: usize,

    /// Bytes decoded per readable callback before yielding.
    pub in_batch_size: usize,

    /// Bytes encoded per writable callback before yielding.
    pub out_batch_size: usize,

    /// When set, the engine publishes its local address into the peer
    /// metadata under this property name.
    pub self_address_property_name: Option<String>,

    /// ZAP security domain (ZMQ_ZAP_DOMAIN).
    pub zap_domain: String,

    /// PLAIN credentials (client side).
    pub plain_username: String,
    pub plain_password: String,

    /// CURVE long-term keys. Server needs the secret key; client needs its
    /// own pair plus the server's public key.
    pub curve_secret_key: Option<[u8; 32]>,
    pub curve_public_key: Option<[u8; 32]>,
    pub curve_server_key: Option<[u8; 32]>,
}

/// Default batch sizes, matched to one jumbo frame's worth of small
/// messages.
pub const DEFAULT_IN_BATCH_SIZE: usize = 8192;
pub const DEFAULT_OUT_BATCH_SIZE: usize = 8192;

impl Options {
    #[must_use]
    pub fn new(socket_type: SocketType) -> Self {
        Self {
            socket_type,
            raw_socket: false,
            mechanism: MechanismKind::Null,
            as_server: false,
            identity: Bytes::new(),
            heartbeat_interval: Duration::ZERO,
            heartbeat_timeout: Duration::ZERO,
            heartbeat_ttl: Duration::ZERO,
            heartbeat_context: Bytes::new(),
            handshake_interval: Duration::from_secs(30),
            max_msg_size: None,
            rcvbuf: 0,
            sndbuf: 0,
            in_batch_size: DEFAULT_IN_BATCH_SIZE,
            out_batch_size: DEFAULT_OUT_BATCH_SIZE,
            self_address_property_name: None,
            zap_domain: String::new(),
            plain_username: String::new(),
            plain_password: String::new(),
            curve_secret_key: None,
            curve_public_key: None,
            curve_server_key: None,
        }
    }

    #[must_use]
    pub fn with_raw_socket(mut self, raw: bool) -> Self {
        self.raw_socket = raw;
        self
    }

    #[must_use]
    pub fn with_mechanism(mut self, mechanism: MechanismKind) -> Self {
        self.mechanism = mechanism;
        self
    }

    #[must_use]
    pub fn with_as_server(mut self, as_server: bool) -> Self {
        self.as_server = as_server;
        self
    }

    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<Bytes>) -> Self {
        self.identity = identity.into();
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, ivl: Duration) -> Self {
        self.heartbeat_interval = ivl;
        self
    }

    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_heartbeat_context(mut self, ctx: impl Into<Bytes>) -> Self {
        self.heartbeat_context = ctx.into();
        self
    }

    #[must_use]
    pub fn with_handshake_interval(mut self, ivl: Duration) -> Self {
        self.handshake_interval = ivl;
        self
    }

    #[must_use]
    pub fn with_max_msg_size(mut self, max: u64) -> Self {
        self.max_msg_size = Some(max);
        self
    }

    #[must_use]
    pub fn with_zap_domain(mut self, domain: impl Into<String>) -> Self {
        self.zap_domain = domain.into();
        self
    }

    #[must_use]
    pub fn with_plain_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.plain_username = username.into();
        self.plain_password = password.into();
        self
    }

    #[must_use]
    pub fn with_curve_server_keys(mut self, secret: [u8; 32], public: [u8; 32]) -> Self {
        self.curve_secret_key = Some(secret);
        self.curve_public_key = Some(public);
        self.as_server = true;
        self
    }

    #[must_use]
    pub fn with_curve_client_keys(
        mut self,
        secret: [u8; 32],
        public: [u8; 32],
        server_key: [u8; 32],
    ) -> Self {
        self.curve_secret_key = Some(secret);
        self.curve_public_key = Some(public);
        self.curve_server_key = Some(server_key);
        self.as_server = false;
        self
    }

    #[must_use]
    pub fn with_self_address_property(mut self, name: impl Into<String>) -> Self {
        self.self_address_property_name = Some(name.into());
        self
    }

    /// Effective PONG deadline: explicit timeout, else the interval.
    #[must_use]
    pub fn effective_heartbeat_timeout(&self) -> Duration {
        if self.heartbeat_timeout.is_zero() {
            self.heartbeat_interval
        } else {
            self.heartbeat_timeout
        }
    }

    /// TTL announced on the wire, in deciseconds, capped at the u16 range.
    #[must_use]
    pub fn heartbeat_ttl_deciseconds(&self) -> u16 {
        (self.heartbeat_ttl.as_millis() / 100).min(u128::from(u16::MAX)) as u16
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new(SocketType::Pair)
    }
}
