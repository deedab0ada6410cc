//! Peer identity
//!
//! A peer is keyed by its remote address, but an address can be reused by
//! a later connection. `SessionId` names the connection itself.

use std::net::SocketAddr;

use uuid::Uuid;

/// Remote address of a peer, the registry key
pub type PeerAddr = SocketAddr;

/// One accepted connection, from registration to teardown
///
/// Minted when a handler starts and never reused. The registry compares
/// sessions before removing an entry, so the teardown of a superseded
/// connection leaves its same-address replacement registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Start a new session
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self.0.as_hyphenated(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_unique() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_session_id_display_is_uuid() {
        let id = SessionId::new();
        assert_eq!(id.to_string(), id.0.to_string());
        assert_eq!(id.to_string().len(), 36);
    }
}
