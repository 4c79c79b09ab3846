//! Socket type enumeration.
//!
//! The engine does not implement socket-type message semantics; it needs the
//! type only for the greeting tail, the READY `Socket-Type` property, the
//! peer compatibility check, and the v0 phantom-subscription rule.

use std::fmt;

/// ZeroMQ socket types.
///
/// Corresponds to the ZMQ_TYPE socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketType {
    Pair = 0,
    Pub = 1,
    Sub = 2,
    Req = 3,
    Rep = 4,
    Dealer = 5,
    Router = 6,
    Pull = 7,
    Push = 8,
    XPub = 9,
    XSub = 10,
}

impl SocketType {
    /// Wire name used in the greeting tail and READY property.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pair => "PAIR",
            Self::Pub => "PUB",
            Self::Sub => "SUB",
            Self::Req => "REQ",
            Self::Rep => "REP",
            Self::Dealer => "DEALER",
            Self::Router => "ROUTER",
            Self::Pull => "PULL",
            Self::Push => "PUSH",
            Self::XPub => "XPUB",
            Self::XSub => "XSUB",
        }
    }

    #[must_use]
    pub fn from_wire(value: &[u8]) -> Option<Self> {
        match value {
            b"PAIR" => Some(Self::Pair),
            b"PUB" => Some(Self::Pub),
            b"SUB" => Some(Self::Sub),
            b"REQ" => Some(Self::Req),
            b"REP" => Some(Self::Rep),
            b"DEALER" => Some(Self::Dealer),
            b"ROUTER" => Some(Self::Router),
            b"PULL" => Some(Self::Pull),
            b"PUSH" => Some(Self::Push),
            b"XPUB" => Some(Self::XPub),
            b"XSUB" => Some(Self::XSub),
            _ => None,
        }
    }

    /// Check if this socket type may talk to the given peer type.
    #[must_use]
    pub fn is_compatible(self, peer: Self) -> bool {
        matches!(
            (self, peer),
            (Self::Pair, Self::Pair)
                | (Self::Pub | Self::XPub, Self::Sub | Self::XSub)
                | (Self::Sub | Self::XSub, Self::Pub | Self::XPub)
                | (Self::Req, Self::Rep | Self::Router)
                | (Self::Rep, Self::Req | Self::Dealer)
                | (Self::Dealer, Self::Rep | Self::Dealer | Self::Router)
                | (Self::Router, Self::Req | Self::Dealer | Self::Router)
                | (Self::Pull, Self::Push)
                | (Self::Push, Self::Pull)
        )
    }

    /// PUB-side sockets need a phantom subscription when the peer speaks an
    /// unversioned protocol that never forwards subscriptions.
    #[must_use]
    pub const fn subscription_required(self) -> bool {
        matches!(self, Self::Pub | Self::XPub)
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for st in [
            SocketType::Pair,
            SocketType::Pub,
            SocketType::Sub,
            SocketType::Req,
            SocketType::Rep,
            SocketType::Dealer,
            SocketType::Router,
            SocketType::Pull,
            SocketType::Push,
            SocketType::XPub,
            SocketType::XSub,
        ] {
            assert_eq!(SocketType::from_wire(st.as_str().as_bytes()), Some(st));
        }
        assert_eq!(SocketType::from_wire(b"STREAM"), None);
    }

    #[test]
    fn compatibility_matrix() {
        assert!(SocketType::Req.is_compatible(SocketType::Rep));
        assert!(SocketType::Req.is_compatible(SocketType::Router));
        assert!(!SocketType::Req.is_compatible(SocketType::Req));
        assert!(SocketType::XPub.is_compatible(SocketType::Sub));
        assert!(!SocketType::Pub.is_compatible(SocketType::Pub));
        assert!(SocketType::Pair.is_compatible(SocketType::Pair));
        assert!(!SocketType::Pair.is_compatible(SocketType::Dealer));
    }

    #[test]
    fn subscription_required_only_for_pub_side() {
        assert!(SocketType::Pub.subscription_required());
        assert!(SocketType::XPub.subscription_required());
        assert!(!SocketType::Sub.subscription_required());
        assert!(!SocketType::Dealer.subscription_required());
    }
}
