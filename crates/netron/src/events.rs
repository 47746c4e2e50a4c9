//! Node lifecycle events.
//!
//! Subscribers receive a copy of every [`NetronEvent`] published after they
//! subscribed. Slow subscribers lag and lose the oldest events; the node
//! itself never blocks on them.

use netron_types::DefinitionId;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::debug;

/// Channel capacity per subscriber.
const EVENT_CAPACITY: usize = 1024;

/// Something that happened on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetronEvent {
    /// A transport connection entered the pending set.
    PeerConnect {
        remote_addr: Option<SocketAddr>,
        gate_id: Option<String>,
    },
    /// A peer completed the handshake.
    PeerOnline { uid: String },
    /// A peer went away. `uid` is `None` when it never finished the handshake.
    PeerOffline { uid: Option<String> },
    /// A context was added to the local registry.
    ContextAttach { name: String, def_id: DefinitionId },
    /// A context was removed from the local registry.
    ContextDetach { name: String, def_id: DefinitionId },
    /// A peer announced a new context.
    RemoteContextAttach { uid: String, name: String },
    /// A peer retracted a context.
    RemoteContextDetach { uid: String, name: String },
}

/// Broadcast fan-out for [`NetronEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<NetronEvent>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish to every current subscriber.
    pub fn publish(&self, event: NetronEvent) {
        debug!(?event, "Publishing event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NetronEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
