//! Greeting exchange and protocol version negotiation.
//!
//! The engine sends a 10-byte signature as soon as it is plugged, then
//! widens its send buffer as the peer's bytes refine the decision:
//!
//! ```text
//! [0]      0xFF
//! [1..9]   identity-size + 1 (u64 BE, v0 compatibility)
//! [9]      0x7F
//! [10]     revision (3)                  (once the peer is known versioned)
//! [11]     socket type                   (v1/v2 peers)
//! [11]     minor version (0)             (v3 peers)
//! [12..32] mechanism name, NUL-padded    (v3)
//! [32]     as-server flag                (v3)
//! [33..64] filler                        (v3)
//! ```
//!
//! The decision procedure commits as early as the byte stream allows:
//! byte 0 ≠ 0xFF is an unversioned peer, a clear bit 0 in byte 9 is an
//! unversioned identity frame, and byte 10 selects v1/v2/v3. Bytes that
//! belong to an unversioned identity message are never consumed here; they
//! stay in the input buffer for the V1 decoder.

use bytes::{Buf, BytesMut};
use longeron_core::error::EngineError;
use longeron_core::options::{MechanismKind, Options};

/// Signature is always exactly 10 bytes.
pub const SIGNATURE_SIZE: usize = 10;
/// v1/v2 greeting: signature, revision, socket type.
pub const V1_GREETING_SIZE: usize = 12;
/// v3 greeting is always exactly 64 bytes.
pub const V3_GREETING_SIZE: usize = 64;

const SIGNATURE_HEAD: u8 = 0xFF;
const SIGNATURE_TAIL: u8 = 0x7F;

const REVISION_V1: u8 = 0;
const REVISION_V2: u8 = 1;
const REVISION_V3: u8 = 3;

/// Negotiated protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    /// Pre-greeting peer; the first frame is its identity message.
    Unversioned,
    V1,
    V2,
    V3,
}

impl Revision {
    /// Revision number reported in `event_handshaken`.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Unversioned | Self::V1 => 0,
            Self::V2 => 1,
            Self::V3 => 3,
        }
    }
}

/// Outcome of feeding greeting input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingStatus {
    /// Decision still pending; need more bytes.
    Reading,
    /// Revision committed; trailing input belongs to the codec.
    Done(Revision),
}

/// One in-flight greeting exchange.
pub struct Greeting {
    send: [u8; V3_GREETING_SIZE],
    /// Bytes of `send` revealed so far; grows as the decision refines.
    send_limit: usize,
    /// Bytes of `send` already handed to the output buffer.
    send_taken: usize,
    recv: [u8; V3_GREETING_SIZE],
    recv_len: usize,
    outcome: Option<Revision>,
}

impl Greeting {
    #[must_use]
    pub fn new(options: &Options) -> Self {
        let mut send = [0u8; V3_GREETING_SIZE];
        send[0] = SIGNATURE_HEAD;
        send[1..9].copy_from_slice(&(options.identity.len() as u64 + 1).to_be_bytes());
        send[9] = SIGNATURE_TAIL;

        Self {
            send,
            send_limit: SIGNATURE_SIZE,
            send_taken: 0,
            recv: [0u8; V3_GREETING_SIZE],
            recv_len: 0,
            outcome: None,
        }
    }

    /// Wire name of the configured mechanism.
    #[must_use]
    pub fn mechanism_name(options: &Options) -> &'static str {
        match options.mechanism {
            MechanismKind::Null => "NULL",
            MechanismKind::Plain => "PLAIN",
            MechanismKind::Curve => "CURVE",
            MechanismKind::Gssapi => "GSSAPI",
        }
    }

    /// True when greeting bytes are waiting to be sent.
    #[must_use]
    pub fn has_output(&self) -> bool {
        self.send_taken < self.send_limit
    }

    /// Move any newly revealed send bytes into `dst`.
    pub fn take_output(&mut self, dst: &mut BytesMut) -> usize {
        let n = self.send_limit - self.send_taken;
        dst.extend_from_slice(&self.send[self.send_taken..self.send_limit]);
        self.send_taken = self.send_limit;
        n
    }

    #[must_use]
    pub fn revision(&self) -> Option<Revision> {
        self.outcome
    }

    /// Feed peer input and advance the decision.
    ///
    /// Consumes from `src` only bytes that are provably greeting; an
    /// unversioned peer's identity frame is left untouched.
    pub fn advance(
        &mut self,
        src: &mut BytesMut,
        options: &Options,
    ) -> Result<GreetingStatus, EngineError> {
        if let Some(revision) = self.outcome {
            return Ok(GreetingStatus::Done(revision));
        }

        // Stage 1: signature.
        if self.recv_len == 0 {
            if src.is_empty() {
                return Ok(GreetingStatus::Reading);
            }
            if src[0] != SIGNATURE_HEAD {
                return self.commit(Revision::Unversioned);
            }
            if src.len() < SIGNATURE_SIZE {
                return Ok(GreetingStatus::Reading);
            }
            if (src[SIGNATURE_SIZE - 1] & 0x01) == 0 {
                // Byte 9 is the flags field of an unversioned identity
                // frame, not a signature tail.
                return self.commit(Revision::Unversioned);
            }

            self.recv[..SIGNATURE_SIZE].copy_from_slice(&src[..SIGNATURE_SIZE]);
            src.advance(SIGNATURE_SIZE);
            self.recv_len = SIGNATURE_SIZE;

            // Versioned peer: reveal our revision byte.
            self.send[SIGNATURE_SIZE] = REVISION_V3;
            self.send_limit = SIGNATURE_SIZE + 1;
        }

        // Stage 2: peer revision byte.
        if self.recv_len == SIGNATURE_SIZE {
            if src.is_empty() {
                return Ok(GreetingStatus::Reading);
            }
            self.recv[SIGNATURE_SIZE] = src[0];
            src.advance(1);
            self.recv_len += 1;

            match self.recv[SIGNATURE_SIZE] {
                REVISION_V1 | REVISION_V2 => {
                    // Downgrade: the rest of our greeting is the socket
                    // type byte.
                    self.send[SIGNATURE_SIZE + 1] = options.socket_type as u8;
                    self.send_limit = V1_GREETING_SIZE;
                }
                _ => {
                    // v3 or later: reveal the full 64-byte greeting.
                    self.send[SIGNATURE_SIZE + 1] = 0; // minor version
                    let name = Self::mechanism_name(options).as_bytes();
                    self.send[12..12 + name.len()].copy_from_slice(name);
                    self.send[32] = u8::from(options.as_server);
                    self.send_limit = V3_GREETING_SIZE;
                }
            }
        }

        // Stage 3: greeting tail.
        match self.recv[SIGNATURE_SIZE] {
            REVISION_V1 | REVISION_V2 => {
                if src.is_empty() {
                    return Ok(GreetingStatus::Reading);
                }
                // Peer socket type; recorded but not acted upon here.
                self.recv[self.recv_len] = src[0];
                src.advance(1);
                self.recv_len += 1;

                let revision = if self.recv[SIGNATURE_SIZE] == REVISION_V1 {
                    Revision::V1
                } else {
                    Revision::V2
                };
                self.commit(revision)
            }
            _ => {
                let take = (V3_GREETING_SIZE - self.recv_len).min(src.len());
                self.recv[self.recv_len..self.recv_len + take].copy_from_slice(&src[..take]);
                src.advance(take);
                self.recv_len += take;

                if self.recv_len < V3_GREETING_SIZE {
                    return Ok(GreetingStatus::Reading);
                }

                let name = Self::mechanism_name(options).as_bytes();
                let mut expected = [0u8; 20];
                expected[..name.len()].copy_from_slice(name);
                if self.recv[12..32] != expected {
                    return Err(EngineError::InvalidGreeting(
                        "peer proposed a different security mechanism",
                    ));
                }
                self.commit(Revision::V3)
            }
        }
    }

    fn commit(&mut self, revision: Revision) -> Result<GreetingStatus, EngineError> {
        self.outcome = Some(revision);
        Ok(GreetingStatus::Done(revision))
    }
}
