//! Peer connection status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a peer connection.
///
/// Advances only `Handshaking -> Online`; `Offline` is terminal and may be
/// entered from either state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PeerStatus {
    /// Transport is up, identities not yet exchanged.
    Handshaking = 0,
    /// Handshake completed, fully connected.
    Online = 1,
    /// Connection closed. Terminal.
    Offline = 2,
}

impl PeerStatus {
    /// Decode from the compact representation used in atomics.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => PeerStatus::Handshaking,
            1 => PeerStatus::Online,
            _ => PeerStatus::Offline,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: PeerStatus) -> bool {
        matches!(
            (self, next),
            (PeerStatus::Handshaking, PeerStatus::Online)
                | (PeerStatus::Handshaking, PeerStatus::Offline)
                | (PeerStatus::Online, PeerStatus::Offline)
        )
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Handshaking => write!(f, "handshaking"),
            PeerStatus::Online => write!(f, "online"),
            PeerStatus::Offline => write!(f, "offline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use PeerStatus::*;
        assert!(Handshaking.can_advance_to(Online));
        assert!(Handshaking.can_advance_to(Offline));
        assert!(Online.can_advance_to(Offline));
        assert!(!Online.can_advance_to(Handshaking));
        assert!(!Offline.can_advance_to(Online));
        assert!(!Offline.can_advance_to(Offline));
        assert!(!Online.can_advance_to(Online));
    }

    #[test]
    fn test_u8_repr() {
        for status in [PeerStatus::Handshaking, PeerStatus::Online, PeerStatus::Offline] {
            assert_eq!(PeerStatus::from_u8(status as u8), status);
        }
    }
}
