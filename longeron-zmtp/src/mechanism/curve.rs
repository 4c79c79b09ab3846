//! CURVE mechanism (RFC 26): public-key encryption with perfect forward
//! secrecy.
//!
//! ```text
//! Client                                Server
//!   |--- HELLO (client ephemeral key) --->|
//!   |<-- WELCOME (server ephemeral key ---|
//!   |         + stateless cookie)         |
//!   |--- INITIATE (cookie + vouch) ------>|   (ZAP check)
//!   |<-- READY ---------------------------|
//!   |<=== boxed MESSAGE frames ==========>|
//! ```
//!
//! Key exchange is X25519; boxes are XChaCha20-Poly1305 so the full
//! 24-byte CurveZMQ nonces authenticate. The server keeps no per-client
//! state between HELLO and INITIATE beyond the connection itself: the
//! cookie returned in WELCOME carries the client's ephemeral key and the
//! server's ephemeral secret, sealed under a key that never leaves this
//! connection.
//!
//! Nonces are 24 bytes: a per-command ASCII prefix plus an 8-byte
//! big-endian counter (HELLO/INITIATE/READY/MESSAGE) or a 16-byte random
//! tail (WELCOME/COOKIE/VOUCH). Counters are strictly monotonic per
//! direction; a stale counter fails the connection.

use super::zap::{ZapReply, ZapRequest};
use super::{begin_zap, MechanismStatus, ZapFlow};
use crate::command::{build_error, parse_short_string};
use crate::session::Session;
use bytes::{Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use longeron_core::error::EngineError;
use longeron_core::metadata::Metadata;
use longeron_core::msg::{flags, Msg};
use longeron_core::options::Options;
use rand::RngCore;
use smallvec::SmallVec;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// CURVE key and box sizes
pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const BOX_OVERHEAD: usize = 16; // Poly1305 tag

/// CURVE command identifiers
const HELLO_PREFIX: &[u8] = b"\x05HELLO";
const WELCOME_PREFIX: &[u8] = b"\x07WELCOME";
const INITIATE_PREFIX: &[u8] = b"\x08INITIATE";
const READY_PREFIX: &[u8] = b"\x05READY";
const ERROR_PREFIX: &[u8] = b"\x05ERROR";
const MESSAGE_PREFIX: &[u8] = b"\x07MESSAGE";

const HELLO_SIZE: usize = 200;
const WELCOME_SIZE: usize = 168;
const INITIATE_MIN_SIZE: usize = 257;
const READY_MIN_SIZE: usize = 6 + 8 + BOX_OVERHEAD;
const MESSAGE_MIN_SIZE: usize = 8 + 8 + 1 + BOX_OVERHEAD;

/// Cookie as it appears on the wire: 16-byte nonce + 80-byte box.
const COOKIE_SIZE: usize = 96;

/// Nonce prefixes: 16-byte prefix + 8-byte counter...
const NONCE_HELLO: &[u8; 16] = b"CurveZMQHELLO---";
const NONCE_INITIATE: &[u8; 16] = b"CurveZMQINITIATE";
const NONCE_READY: &[u8; 16] = b"CurveZMQREADY---";
const NONCE_MESSAGE_C: &[u8; 16] = b"CurveZMQMESSAGEC";
const NONCE_MESSAGE_S: &[u8; 16] = b"CurveZMQMESSAGES";
/// ...or 8-byte prefix + 16-byte random tail.
const NONCE_WELCOME: &[u8; 8] = b"WELCOME-";
const NONCE_COOKIE: &[u8; 8] = b"COOKIE--";
const NONCE_VOUCH: &[u8; 8] = b"VOUCH---";

/// Inner flags byte of a boxed MESSAGE.
const INNER_MORE: u8 = 0x01;
const INNER_COMMAND: u8 = 0x02;

/// CURVE public key (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurvePublicKey([u8; KEY_SIZE]);

impl CurvePublicKey {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Self(key)
    }

    #[must_use]
    pub fn to_x25519(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl From<PublicKey> for CurvePublicKey {
    fn from(key: PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl AsRef<[u8]> for CurvePublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// CURVE secret key (32 bytes)
#[derive(Clone)]
pub struct CurveSecretKey(StaticSecret);

impl CurveSecretKey {
    /// Generate a new random secret key
    #[must_use]
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.to_bytes()
    }

    #[must_use]
    pub fn public_key(&self) -> CurvePublicKey {
        CurvePublicKey::from(PublicKey::from(&self.0))
    }

    /// Compute shared secret via ECDH
    #[must_use]
    pub fn diffie_hellman(&self, peer_public: &CurvePublicKey) -> [u8; KEY_SIZE] {
        *self.0.diffie_hellman(&peer_public.to_x25519()).as_bytes()
    }
}

impl std::fmt::Debug for CurveSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CurveSecretKey([REDACTED])")
    }
}

/// CURVE key pair (public + secret)
#[derive(Debug, Clone)]
pub struct CurveKeyPair {
    pub public: CurvePublicKey,
    pub secret: CurveSecretKey,
}

impl CurveKeyPair {
    /// Generate a new random key pair
    #[must_use]
    pub fn generate() -> Self {
        let secret = CurveSecretKey::generate();
        let public = secret.public_key();
        Self { public, secret }
    }

    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = CurveSecretKey::from_bytes(bytes);
        let public = secret.public_key();
        Self { public, secret }
    }
}

/// Authenticated encryption box (XChaCha20-Poly1305 over an X25519 shared
/// secret, or a raw symmetric key for cookies).
struct CurveBox {
    cipher: XChaCha20Poly1305,
}

impl CurveBox {
    fn from_shared(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }

    fn from_keys(peer_public: &CurvePublicKey, our_secret: &CurveSecretKey) -> Self {
        Self::from_shared(&our_secret.diffie_hellman(peer_public))
    }

    fn seal(&self, plaintext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>, EngineError> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| EngineError::Mechanism("encryption failed"))
    }

    fn open(&self, ciphertext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>, EngineError> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| EngineError::Mechanism("decryption failed"))
    }
}

fn counter_nonce(prefix: &[u8; 16], counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..16].copy_from_slice(prefix);
    nonce[16..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn counter_nonce_raw(prefix: &[u8; 16], tail: &[u8]) -> [u8; NONCE_SIZE] {
    debug_assert_eq!(tail.len(), 8);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..16].copy_from_slice(prefix);
    nonce[16..].copy_from_slice(tail);
    nonce
}

fn tail_nonce(prefix: &[u8; 8], tail: &[u8]) -> [u8; NONCE_SIZE] {
    debug_assert_eq!(tail.len(), 16);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(prefix);
    nonce[8..].copy_from_slice(tail);
    nonce
}

fn nonce_value(tail: &[u8]) -> u64 {
    u64::from_be_bytes(tail.try_into().expect("nonce tail is 8 bytes"))
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Box an outbound message: MESSAGE prefix, nonce counter, sealed
/// flags-plus-payload.
fn encode_message(
    precom: &CurveBox,
    prefix: &[u8; 16],
    cn_nonce: &mut u64,
    msg: Msg,
) -> Result<Msg, EngineError> {
    let mut plaintext = BytesMut::with_capacity(1 + msg.len());
    let mut inner = 0u8;
    if msg.has_more() {
        inner |= INNER_MORE;
    }
    if msg.is_command() {
        inner |= INNER_COMMAND;
    }
    plaintext.extend_from_slice(&[inner]);
    plaintext.extend_from_slice(msg.data());

    let boxed = precom.seal(&plaintext, &counter_nonce(prefix, *cn_nonce))?;

    let mut body = BytesMut::with_capacity(MESSAGE_PREFIX.len() + 8 + boxed.len());
    body.extend_from_slice(MESSAGE_PREFIX);
    body.extend_from_slice(&cn_nonce.to_be_bytes());
    body.extend_from_slice(&boxed);
    *cn_nonce += 1;

    Ok(Msg::new(body.freeze()))
}

/// Open an inbound MESSAGE, enforcing nonce monotonicity.
fn decode_message(
    precom: &CurveBox,
    prefix: &[u8; 16],
    cn_peer_nonce: &mut u64,
    msg: &Msg,
) -> Result<Msg, EngineError> {
    let b = msg.data();
    if b.len() < MESSAGE_MIN_SIZE || !b.starts_with(MESSAGE_PREFIX) {
        return Err(EngineError::Mechanism("malformed MESSAGE"));
    }
    let nonce_tail = &b[8..16];
    let nonce = nonce_value(nonce_tail);
    if nonce <= *cn_peer_nonce {
        return Err(EngineError::Mechanism("MESSAGE nonce not monotonic"));
    }

    let plaintext = precom.open(&b[16..], &counter_nonce_raw(prefix, nonce_tail))?;
    *cn_peer_nonce = nonce;

    let inner = plaintext[0];
    let mut out = Msg::new(Bytes::from(plaintext).slice(1..));
    if (inner & INNER_MORE) != 0 {
        out.set_flags(flags::MORE);
    }
    if (inner & INNER_COMMAND) != 0 {
        out.set_flags(flags::COMMAND);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    ExpectHello,
    SendWelcome,
    ExpectInitiate,
    ExpectZapReply,
    SendReady,
    SendError,
    Connected,
    ErrorSent,
}

/// Server side of the CURVE handshake.
pub struct CurveServer {
    state: ServerState,
    /// Long-term secret key (s).
    secret_key: CurveSecretKey,
    /// Long-term public key (S), derived.
    public_key: CurvePublicKey,
    /// Ephemeral pair (S', s'), fresh per connection.
    short_pair: CurveKeyPair,
    /// Client ephemeral key (C'), learned from HELLO.
    client_short: Option<CurvePublicKey>,
    /// Symmetric cookie key, fresh per connection.
    cookie_key: [u8; KEY_SIZE],
    /// Outgoing nonce counter; READY consumes 1.
    cn_nonce: u64,
    /// Highest peer nonce accepted so far.
    cn_peer_nonce: u64,
    /// Message box (C', s'), precomputed at INITIATE.
    precom: Option<CurveBox>,

    properties: Bytes,
    zap_domain: String,
    peer_address: String,
    identity: Bytes,
    pending_error: Option<Bytes>,
    peer_metadata: Metadata,
    user_id: Option<Bytes>,
}

impl CurveServer {
    pub fn new(
        options: &Options,
        properties: Bytes,
        peer_address: Option<&str>,
    ) -> Result<Self, EngineError> {
        let secret_bytes = options
            .curve_secret_key
            .ok_or(EngineError::Mechanism("CURVE server needs a secret key"))?;
        let secret_key = CurveSecretKey::from_bytes(secret_bytes);
        let public_key = secret_key.public_key();

        Ok(Self {
            state: ServerState::ExpectHello,
            secret_key,
            public_key,
            short_pair: CurveKeyPair::generate(),
            client_short: None,
            cookie_key: random_bytes(),
            cn_nonce: 1,
            cn_peer_nonce: 0,
            precom: None,
            properties,
            zap_domain: options.zap_domain.clone(),
            peer_address: peer_address.unwrap_or_default().to_owned(),
            identity: options.identity.clone(),
            pending_error: None,
            peer_metadata: Metadata::new(),
            user_id: None,
        })
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
                let welcome = self.build_welcome()?;
                self.state = ServerState::ExpectInitiate;
                Ok(Some(welcome))
            }
            ServerState::SendReady => {
                let precom = self.precom.as_ref().expect("precomputed at INITIATE");
                let boxed =
                    precom.seal(&self.properties, &counter_nonce(NONCE_READY, self.cn_nonce))?;

                let mut body = BytesMut::with_capacity(READY_MIN_SIZE + boxed.len());
                body.extend_from_slice(READY_PREFIX);
                body.extend_from_slice(&self.cn_nonce.to_be_bytes());
                body.extend_from_slice(&boxed);
                self.cn_nonce += 1;

                self.state = ServerState::Connected;
                debug!("CURVE server connected");
                Ok(Some(Msg::command(body.freeze())))
            }
            ServerState::SendError => {
                self.state = ServerState::ErrorSent;
                let status = self.pending_error.take().unwrap_or_default();
                Ok(Some(Msg::command(build_error(&status))))
            }
            _ => Ok(None),
        }
    }

    fn build_welcome(&mut self) -> Result<Msg, EngineError> {
        let client_short = self.client_short.as_ref().expect("set by HELLO");

        // Cookie: the client's ephemeral key and our ephemeral secret,
        // sealed under the connection-local cookie key.
        let cookie_nonce = random_bytes::<16>();
        let mut cookie_plaintext = [0u8; 2 * KEY_SIZE];
        cookie_plaintext[..KEY_SIZE].copy_from_slice(client_short.as_bytes());
        cookie_plaintext[KEY_SIZE..].copy_from_slice(&self.short_pair.secret.to_bytes());
        let cookie_box = CurveBox::from_shared(&self.cookie_key)
            .seal(&cookie_plaintext, &tail_nonce(NONCE_COOKIE, &cookie_nonce))?;

        let mut welcome_plaintext = BytesMut::with_capacity(128);
        welcome_plaintext.extend_from_slice(self.short_pair.public.as_bytes());
        welcome_plaintext.extend_from_slice(&cookie_nonce);
        welcome_plaintext.extend_from_slice(&cookie_box);

        let welcome_nonce = random_bytes::<16>();
        let welcome_box = CurveBox::from_keys(client_short, &self.secret_key)
            .seal(&welcome_plaintext, &tail_nonce(NONCE_WELCOME, &welcome_nonce))?;

        let mut body = BytesMut::with_capacity(WELCOME_SIZE);
        body.extend_from_slice(WELCOME_PREFIX);
        body.extend_from_slice(&welcome_nonce);
        body.extend_from_slice(&welcome_box);
        debug_assert_eq!(body.len(), WELCOME_SIZE);

        Ok(Msg::command(body.freeze()))
    }

    pub fn process_handshake_command(
        &mut self,
        msg: &Msg,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        let b = msg.data();
        if b.starts_with(ERROR_PREFIX) {
            let (status, _) = parse_short_string(&b[ERROR_PREFIX.len()..])?;
            return Err(EngineError::PeerError(
                String::from_utf8_lossy(status).into_owned(),
            ));
        }
        match self.state {
            ServerState::ExpectHello => self.process_hello(msg),
            ServerState::ExpectInitiate => self.process_initiate(msg, session),
            _ => Err(EngineError::Mechanism("unexpected command in CURVE handshake")),
        }
    }

    fn process_hello(&mut self, msg: &Msg) -> Result<(), EngineError> {
        let b = msg.data();
        if b.len() != HELLO_SIZE || !b.starts_with(HELLO_PREFIX) {
            return Err(EngineError::Mechanism("malformed HELLO"));
        }
        if b[6] != 1 || b[7] != 0 {
            return Err(EngineError::Mechanism("unsupported CURVE version"));
        }

        let client_short = CurvePublicKey::from_slice(&b[80..112]);
        let nonce_tail = &b[112..120];

        // The hello box proves the client holds the ephemeral secret and
        // knows our long-term public key.
        let opened = CurveBox::from_keys(&client_short, &self.secret_key)
            .open(&b[120..200], &counter_nonce_raw(NONCE_HELLO, nonce_tail));
        match opened {
            Ok(_) => {
                self.cn_peer_nonce = nonce_value(nonce_tail);
                self.client_short = Some(client_short);
                self.state = ServerState::SendWelcome;
                Ok(())
            }
            Err(_) => {
                // Unknown or impersonating peer: answer with a bare ERROR,
                // then fail.
                warn!("CURVE HELLO box did not open");
                self.pending_error = Some(Bytes::new());
                self.state = ServerState::SendError;
                Ok(())
            }
        }
    }

    fn process_initiate(
        &mut self,
        msg: &Msg,
        session: &mut dyn Session,
    ) -> Result<(), EngineError> {
        let b = msg.data();
        if b.len() < INITIATE_MIN_SIZE || !b.starts_with(INITIATE_PREFIX) {
            return Err(EngineError::Mechanism("malformed INITIATE"));
        }
        let client_short = *self.client_short.as_ref().expect("set by HELLO");

        let cookie_nonce = &b[9..25];
        let cookie_box = &b[25..105];
        let nonce_tail = &b[105..113];
        let initiate_box = &b[113..];

        // Reopen our own cookie; only this server on this connection can.
        let cookie_plaintext = CurveBox::from_shared(&self.cookie_key)
            .open(cookie_box, &tail_nonce(NONCE_COOKIE, cookie_nonce))
            .map_err(|_| EngineError::Mechanism("INITIATE cookie rejected"))?;
        if cookie_plaintext[..KEY_SIZE] != *client_short.as_bytes()
            || cookie_plaintext[KEY_SIZE..] != self.short_pair.secret.to_bytes()
        {
            return Err(EngineError::Mechanism("INITIATE cookie mismatch"));
        }

        let nonce = nonce_value(nonce_tail);
        if nonce <= self.cn_peer_nonce {
            return Err(EngineError::Mechanism("INITIATE nonce not monotonic"));
        }

        let plaintext = CurveBox::from_keys(&client_short, &self.short_pair.secret)
            .open(initiate_box, &counter_nonce_raw(NONCE_INITIATE, nonce_tail))?;
        self.cn_peer_nonce = nonce;

        if plaintext.len() < 128 {
            return Err(EngineError::Mechanism("short INITIATE box"));
        }
        let client_long = CurvePublicKey::from_slice(&plaintext[..KEY_SIZE]);
        let vouch_nonce = &plaintext[32..48];
        let vouch_box = &plaintext[48..128];

        // The vouch proves the long-term key authorizes the ephemeral one.
        let vouch_plaintext = CurveBox::from_keys(&client_long, &self.short_pair.secret)
            .open(vouch_box, &tail_nonce(NONCE_VOUCH, vouch_nonce))?;
        if vouch_plaintext[..KEY_SIZE] != *client_short.as_bytes()
            || vouch_plaintext[KEY_SIZE..] != *self.public_key.as_bytes()
        {
            return Err(EngineError::Mechanism("INITIATE vouch mismatch"));
        }

        self.precom = Some(CurveBox::from_keys(&client_short, &self.short_pair.secret));
        self.peer_metadata = Metadata::parse(&Bytes::copy_from_slice(&plaintext[128..]))
            .map_err(|_| EngineError::Mechanism("malformed INITIATE metadata"))?;

        let request = ZapRequest {
            domain: self.zap_domain.clone(),
            address: self.peer_address.clone(),
            identity: self.identity.clone(),
            mechanism: "CURVE",
            credentials: SmallVec::from_vec(vec![Bytes::copy_from_slice(
                client_long.as_bytes(),
            )]),
        };
        match begin_zap(&request, session)? {
            ZapFlow::NotRequired => self.state = ServerState::SendReady,
            ZapFlow::Pending => self.state = ServerState::ExpectZapReply,
            ZapFlow::Decided(reply) => self.handle_zap_reply(&reply),
        }
        Ok(())
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
            self.state = ServerState::SendReady;
        } else {
            self.pending_error = Some(reply.status_code.clone());
            self.state = ServerState::SendError;
        }
    }

    pub fn awaiting_zap_reply(&self) -> bool {
        self.state == ServerState::ExpectZapReply
    }

    pub fn encode(&mut self, msg: Msg) -> Result<Msg, EngineError> {
        let precom = self
            .precom
            .as_ref()
            .ok_or(EngineError::Mechanism("CURVE not connected"))?;
        encode_message(precom, NONCE_MESSAGE_S, &mut self.cn_nonce, msg)
    }

    pub fn decode(&mut self, msg: &Msg) -> Result<Msg, EngineError> {
        let precom = self
            .precom
            .as_ref()
            .ok_or(EngineError::Mechanism("CURVE not connected"))?;
        decode_message(precom, NONCE_MESSAGE_C, &mut self.cn_peer_nonce, msg)
    }

    pub fn peer_metadata(&self) -> &Metadata {
        &self.peer_metadata
    }

    pub fn user_id(&self) -> Option<&Bytes> {
        self.user_id.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    SendHello,
    ExpectWelcome,
    SendInitiate,
    ExpectReady,
    Connected,
}

/// Client side of the CURVE handshake.
pub struct CurveClient {
    state: ClientState,
    /// Long-term pair (C, c).
    long_pair: CurveKeyPair,
    /// Server long-term public key (S).
    server_key: CurvePublicKey,
    /// Ephemeral pair (C', c'), fresh per connection.
    short_pair: CurveKeyPair,
    /// Server ephemeral key (S'), learned from WELCOME.
    server_short: Option<CurvePublicKey>,
    /// Opaque cookie echoed back in INITIATE.
    cookie: Option<Bytes>,
    /// Outgoing nonce counter; HELLO consumes 1, INITIATE 2.
    cn_nonce: u64,
    cn_peer_nonce: u64,
    precom: Option<CurveBox>,

    properties: Bytes,
    peer_metadata: Metadata,
}

impl CurveClient {
    pub fn new(options: &Options, properties: Bytes) -> Result<Self, EngineError> {
        let secret_bytes = options
            .curve_secret_key
            .ok_or(EngineError::Mechanism("CURVE client needs its key pair"))?;
        let server_key = options
            .curve_server_key
            .ok_or(EngineError::Mechanism("CURVE client needs the server key"))?;

        Ok(Self {
            state: ClientState::SendHello,
            long_pair: CurveKeyPair::from_secret_bytes(secret_bytes),
            server_key: CurvePublicKey::from_bytes(server_key),
            short_pair: CurveKeyPair::generate(),
            server_short: None,
            cookie: None,
            cn_nonce: 1,
            cn_peer_nonce: 0,
            precom: None,
            properties,
            peer_metadata: Metadata::new(),
        })
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
                // 64 zero bytes boxed under (S, c'): proves key possession
                // while saying nothing.
                let hello_box = CurveBox::from_keys(&self.server_key, &self.short_pair.secret)
                    .seal(&[0u8; 64], &counter_nonce(NONCE_HELLO, self.cn_nonce))?;

                let mut body = BytesMut::with_capacity(HELLO_SIZE);
                body.extend_from_slice(HELLO_PREFIX);
                body.extend_from_slice(&[1, 0]); // version
                body.extend_from_slice(&[0u8; 72]); // anti-amplification padding
                body.extend_from_slice(self.short_pair.public.as_bytes());
                body.extend_from_slice(&self.cn_nonce.to_be_bytes());
                body.extend_from_slice(&hello_box);
                debug_assert_eq!(body.len(), HELLO_SIZE);
                self.cn_nonce += 1;

                self.state = ClientState::ExpectWelcome;
                Ok(Some(Msg::command(body.freeze())))
            }
            ClientState::SendInitiate => {
                let server_short = self.server_short.as_ref().expect("set by WELCOME");
                let cookie = self.cookie.as_ref().expect("set by WELCOME");

                // Vouch: (C' || S) boxed under (S', c).
                let vouch_nonce = random_bytes::<16>();
                let mut vouch_plaintext = [0u8; 2 * KEY_SIZE];
                vouch_plaintext[..KEY_SIZE].copy_from_slice(self.short_pair.public.as_bytes());
                vouch_plaintext[KEY_SIZE..].copy_from_slice(self.server_key.as_bytes());
                let vouch_box = CurveBox::from_keys(server_short, &self.long_pair.secret)
                    .seal(&vouch_plaintext, &tail_nonce(NONCE_VOUCH, &vouch_nonce))?;

                let mut plaintext =
                    BytesMut::with_capacity(128 + self.properties.len());
                plaintext.extend_from_slice(self.long_pair.public.as_bytes());
                plaintext.extend_from_slice(&vouch_nonce);
                plaintext.extend_from_slice(&vouch_box);
                plaintext.extend_from_slice(&self.properties);

                let initiate_box = CurveBox::from_keys(server_short, &self.short_pair.secret)
                    .seal(&plaintext, &counter_nonce(NONCE_INITIATE, self.cn_nonce))?;

                let mut body =
                    BytesMut::with_capacity(INITIATE_MIN_SIZE + self.properties.len());
                body.extend_from_slice(INITIATE_PREFIX);
                body.extend_from_slice(cookie);
                body.extend_from_slice(&self.cn_nonce.to_be_bytes());
                body.extend_from_slice(&initiate_box);
                self.cn_nonce += 1;

                self.state = ClientState::ExpectReady;
                Ok(Some(Msg::command(body.freeze())))
            }
            _ => Ok(None),
        }
    }

    pub fn process_handshake_command(&mut self, msg: &Msg) -> Result<(), EngineError> {
        let b = msg.data();
        if b.starts_with(ERROR_PREFIX) {
            let (status, _) = parse_short_string(&b[ERROR_PREFIX.len()..])?;
            return Err(EngineError::PeerError(
                String::from_utf8_lossy(status).into_owned(),
            ));
        }
        match self.state {
            ClientState::ExpectWelcome => self.process_welcome(msg),
            ClientState::ExpectReady => self.process_ready(msg),
            _ => Err(EngineError::Mechanism("unexpected command in CURVE handshake")),
        }
    }

    fn process_welcome(&mut self, msg: &Msg) -> Result<(), EngineError> {
        let b = msg.data();
        if b.len() != WELCOME_SIZE || !b.starts_with(WELCOME_PREFIX) {
            return Err(EngineError::Mechanism("malformed WELCOME"));
        }
        let nonce_tail = &b[8..24];

        let plaintext = CurveBox::from_keys(&self.server_key, &self.short_pair.secret)
            .open(&b[24..], &tail_nonce(NONCE_WELCOME, nonce_tail))?;
        debug_assert_eq!(plaintext.len(), KEY_SIZE + COOKIE_SIZE);

        let server_short = CurvePublicKey::from_slice(&plaintext[..KEY_SIZE]);
        self.cookie = Some(Bytes::copy_from_slice(&plaintext[KEY_SIZE..]));
        self.precom = Some(CurveBox::from_keys(&server_short, &self.short_pair.secret));
        self.server_short = Some(server_short);
        self.state = ClientState::SendInitiate;
        Ok(())
    }

    fn process_ready(&mut self, msg: &Msg) -> Result<(), EngineError> {
        let b = msg.data();
        if b.len() < READY_MIN_SIZE || !b.starts_with(READY_PREFIX) {
            return Err(EngineError::Mechanism("malformed READY"));
        }
        let nonce_tail = &b[6..14];
        let nonce = nonce_value(nonce_tail);
        if nonce <= self.cn_peer_nonce {
            return Err(EngineError::Mechanism("READY nonce not monotonic"));
        }

        let precom = self.precom.as_ref().expect("set by WELCOME");
        let plaintext = precom.open(&b[14..], &counter_nonce_raw(NONCE_READY, nonce_tail))?;
        self.cn_peer_nonce = nonce;

        self.peer_metadata = Metadata::parse(&Bytes::from(plaintext))
            .map_err(|_| EngineError::Mechanism("malformed READY metadata"))?;
        self.state = ClientState::Connected;
        debug!("CURVE client connected");
        Ok(())
    }

    pub fn encode(&mut self, msg: Msg) -> Result<Msg, EngineError> {
        let precom = self
            .precom
            .as_ref()
            .ok_or(EngineError::Mechanism("CURVE not connected"))?;
        encode_message(precom, NONCE_MESSAGE_C, &mut self.cn_nonce, msg)
    }

    pub fn decode(&mut self, msg: &Msg) -> Result<Msg, EngineError> {
        let precom = self
            .precom
            .as_ref()
            .ok_or(EngineError::Mechanism("CURVE not connected"))?;
        decode_message(precom, NONCE_MESSAGE_S, &mut self.cn_peer_nonce, msg)
    }

    pub fn peer_metadata(&self) -> &Metadata {
        &self.peer_metadata
    }
}
