//! ZMTP metadata property map.
//!
//! Handshake commands (READY, INITIATE) carry a property dictionary in the
//! ZMTP 3.x wire encoding:
//!
//! ```text
//! property = name-length(u8) name value-length(u32 BE) value
//! ```
//!
//! The same map is shared (behind `Arc`) by every message of a connection
//! once the handshake completes.

use bytes::{BufMut, Bytes, BytesMut};
use hashbrown::HashMap;
use thiserror::Error;

/// Well-known property names.
pub const SOCKET_TYPE: &str = "Socket-Type";
pub const IDENTITY: &str = "Identity";
pub const USER_ID: &str = "User-Id";
pub const PEER_ADDRESS: &str = "Peer-Address";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata property truncated")]
    Truncated,

    #[error("metadata property name is not UTF-8")]
    BadName,
}

/// Property name → value bytes.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    props: HashMap<String, Bytes>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Bytes) {
        self.props.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.props.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.props.contains_key(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Append one property in wire format.
    pub fn put_property(dst: &mut BytesMut, name: &str, value: &[u8]) {
        debug_assert!(name.len() <= u8::MAX as usize);
        dst.put_u8(name.len() as u8);
        dst.extend_from_slice(name.as_bytes());
        dst.put_u32(value.len() as u32);
        dst.extend_from_slice(value);
    }

    /// Serialize every property in wire format.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        for (name, value) in &self.props {
            Self::put_property(&mut dst, name, value);
        }
        dst.freeze()
    }

    /// Parse a property dictionary from a command body tail.
    ///
    /// `src` must contain properties only (the caller strips the command
    /// name). Zero-copy for values when `src` is a shared `Bytes`.
    pub fn parse(src: &Bytes) -> Result<Self, MetadataError> {
        let b = src.as_ref();
        let mut props = HashMap::new();
        let mut i = 0;

        while i < b.len() {
            let name_len = b[i] as usize;
            i += 1;
            if b.len() < i + name_len {
                return Err(MetadataError::Truncated);
            }
            let name = std::str::from_utf8(&b[i..i + name_len])
                .map_err(|_| MetadataError::BadName)?
                .to_owned();
            i += name_len;

            if b.len() < i + 4 {
                return Err(MetadataError::Truncated);
            }
            let value_len =
                u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]) as usize;
            i += 4;
            if b.len() < i + value_len {
                return Err(MetadataError::Truncated);
            }
            let value = src.slice(i..i + value_len);
            i += value_len;

            props.insert(name, value);
        }

        Ok(Self { props })
    }
}
