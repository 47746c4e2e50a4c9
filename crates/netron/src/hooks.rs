//! Application hooks consulted while admitting peers.

use crate::peer::Peer;
use async_trait::async_trait;
use netron_wire::Handshake;
use serde_json::Value;

/// Admission and handshake customisation.
///
/// Every method has an accepting default, so implementors override only what
/// they need.
#[async_trait]
pub trait NetronHooks: Send + Sync + 'static {
    /// Called for each accepted transport connection, before it enters the
    /// pending set. Returning `false` drops the connection.
    async fn on_confirm_connection(&self, _peer: &Peer) -> bool {
        true
    }

    /// Called with the dialer's handshake, after its identity is recorded on
    /// `peer`. Returning `false` rejects it with `InvalidAccess`.
    async fn on_confirm_peer(&self, _peer: &Peer, _handshake: &Handshake) -> bool {
        true
    }

    /// Application data to embed as `auth` in the outgoing handshake.
    fn on_send_handshake(&self, _peer: &Peer) -> Option<Value> {
        None
    }
}

/// Hooks that accept everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl NetronHooks for DefaultHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerDirection, PeerOptions};
    use netron_wire::PROTOCOL_VERSION;
    use serde_json::json;

    struct AllowListed(&'static str);

    #[async_trait]
    impl NetronHooks for AllowListed {
        async fn on_confirm_peer(&self, _peer: &Peer, handshake: &Handshake) -> bool {
            handshake.uid == self.0
        }

        fn on_send_handshake(&self, peer: &Peer) -> Option<Value> {
            Some(json!({ "to": peer.label() }))
        }
    }

    fn inbound() -> std::sync::Arc<Peer> {
        let (peer, _io) = Peer::new(PeerOptions {
            direction: PeerDirection::Inbound,
            gate_id: None,
            remote_addr: None,
            allowed_contexts: None,
            response_timeout: None,
        });
        peer
    }

    fn hello(uid: &str) -> Handshake {
        Handshake {
            uid: uid.to_string(),
            is_super: false,
            protocol_version: PROTOCOL_VERSION,
            definitions: vec![],
            nonce: String::new(),
            auth_hmac: String::new(),
            auth: None,
        }
    }

    #[test]
    fn test_default_hooks_accept() {
        let peer = inbound();
        let hooks = DefaultHooks;
        assert!(tokio_test::block_on(hooks.on_confirm_connection(&peer)));
        assert!(tokio_test::block_on(hooks.on_confirm_peer(&peer, &hello("x"))));
        assert!(hooks.on_send_handshake(&peer).is_none());
    }

    #[test]
    fn test_overridden_hooks() {
        let peer = inbound();
        let hooks = AllowListed("friend");
        assert!(tokio_test::block_on(hooks.on_confirm_connection(&peer)));
        assert!(tokio_test::block_on(hooks.on_confirm_peer(&peer, &hello("friend"))));
        assert!(!tokio_test::block_on(hooks.on_confirm_peer(&peer, &hello("stranger"))));
        assert!(hooks.on_send_handshake(&peer).is_some());
    }
}
