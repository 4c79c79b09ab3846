use crate::metadata::Metadata;
use bytes::Bytes;
use std::sync::Arc;

/// Internal message flags.
///
/// These are engine-side flags, not the wire flags the codecs emit; the
/// codec maps MORE/COMMAND onto the frame header, IDENTITY and CREDENTIAL
/// never leave the process.
pub mod flags {
    /// More frames of the same logical message follow.
    pub const MORE: u8 = 0x01;
    /// Protocol command frame (PING, PONG, READY, ...).
    pub const COMMAND: u8 = 0x02;
    /// Credential frame produced by a security mechanism after handshake.
    pub const CREDENTIAL: u8 = 0x20;
    /// Connection identity frame (ZMTP v0-v2 greeting tail).
    pub const IDENTITY: u8 = 0x40;
}

/// A single message frame exchanged between engine and session.
///
/// Payload is an owned, cheaply-cloneable `Bytes`. An optional metadata
/// pointer carries the peer's handshake properties; it is shared across all
/// frames of a connection (refcount bump per frame, no copies).
#[derive(Debug, Clone, Default)]
pub struct Msg {
    data: Bytes,
    flags: u8,
    metadata: Option<Arc<Metadata>>,
}

impl Msg {
    /// Create a data frame.
    #[must_use]
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            flags: 0,
            metadata: None,
        }
    }

    /// Create an empty (zero-length) data frame.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// Create a command frame.
    #[must_use]
    pub fn command(data: Bytes) -> Self {
        Self {
            data,
            flags: flags::COMMAND,
            metadata: None,
        }
    }

    /// Create an identity frame.
    #[must_use]
    pub fn identity(data: Bytes) -> Self {
        Self {
            data,
            flags: flags::IDENTITY,
            metadata: None,
        }
    }

    /// Create a credential frame (mechanism user id).
    #[must_use]
    pub fn credential(data: Bytes) -> Self {
        Self {
            data,
            flags: flags::CREDENTIAL,
            metadata: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> u8 {
        self.flags
    }

    #[inline]
    pub fn set_flags(&mut self, flags: u8) {
        self.flags |= flags;
    }

    #[inline]
    pub fn reset_flags(&mut self, flags: u8) {
        self.flags &= !flags;
    }

    /// Builder-style MORE flag.
    #[must_use]
    pub fn with_more(mut self, more: bool) -> Self {
        if more {
            self.flags |= flags::MORE;
        } else {
            self.flags &= !flags::MORE;
        }
        self
    }

    #[inline]
    #[must_use]
    pub const fn has_more(&self) -> bool {
        (self.flags & flags::MORE) != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_command(&self) -> bool {
        (self.flags & flags::COMMAND) != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        (self.flags & flags::IDENTITY) != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_credential(&self) -> bool {
        (self.flags & flags::CREDENTIAL) != 0
    }

    /// Attach shared connection metadata.
    pub fn set_metadata(&mut self, metadata: Arc<Metadata>) {
        self.metadata = Some(metadata);
    }

    #[must_use]
    pub fn metadata(&self) -> Option<&Arc<Metadata>> {
        self.metadata.as_ref()
    }
}

impl From<Bytes> for Msg {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<&'static [u8]> for Msg {
    fn from(data: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(data))
    }
}
