//! Impulse handling.
//!
//! What a packet may do depends on the status of the peer it came from:
//!
//! | status      | accepted actions                                 |
//! |-------------|--------------------------------------------------|
//! | handshaking | `Handshake` (inbound peers only)                 |
//! | online      | `ContextAttach`, `ContextDetach`, `Ping`, `Get`, `Set` |
//! | offline     | none                                             |
//!
//! Anything else is logged and dropped without a reply.

use crate::events::NetronEvent;
use crate::node::{to_json, Announcement, Netron};
use crate::peer::{Peer, PeerDirection};
use crate::stub::Stub;
use dashmap::mapref::entry::Entry;
use netron_types::{NetronError, NetronResult, PeerStatus};
use netron_wire::packet::{
    AttachScope, ContextAttachReply, ContextAttachRequest, ContextDetachRequest, InvokeRequest,
};
use netron_wire::{Action, Handshake, Packet};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Netron {
    /// Handle one impulse from `peer`.
    pub(crate) async fn process_packet(&self, peer: &Arc<Peer>, packet: Packet) {
        // A dialed peer may start talking as soon as it has accepted our
        // handshake, possibly before we have read its reply.
        let status = match peer.direction() {
            PeerDirection::Outbound => peer.settled().await,
            PeerDirection::Inbound => peer.status(),
        };

        match (status, packet.action) {
            (PeerStatus::Handshaking, Action::Handshake) => {
                self.on_handshake(peer, &packet).await;
            }
            (PeerStatus::Handshaking, action) => {
                warn!(peer = %peer.label(), ?action, "Packet before handshake dropped");
            }
            (PeerStatus::Online, Action::Handshake) => {
                warn!(peer = %peer.label(), "Repeated handshake dropped");
            }
            (PeerStatus::Online, Action::ContextAttach) => {
                let result = self.on_context_attach(peer, &packet);
                peer.reply(&packet, result);
            }
            (PeerStatus::Online, Action::ContextDetach) => {
                let result = self.on_context_detach(peer, &packet);
                peer.reply(&packet, result);
            }
            (PeerStatus::Online, Action::Ping) => {
                peer.reply(&packet, Ok(Value::Null));
            }
            (PeerStatus::Online, Action::Get | Action::Set) => {
                let result = self.on_invoke(peer, &packet).await;
                peer.reply(&packet, result);
            }
            (PeerStatus::Online, Action::Unknown) => {
                warn!(peer = %peer.label(), stream_id = packet.stream_id, "Unknown action dropped");
            }
            (PeerStatus::Offline, action) => {
                debug!(peer = %peer.label(), ?action, "Packet from offline peer dropped");
            }
        }
    }

    async fn on_handshake(&self, peer: &Arc<Peer>, packet: &Packet) {
        if peer.direction() != PeerDirection::Inbound {
            warn!(peer = %peer.label(), "Handshake request from a dialed peer dropped");
            return;
        }
        if let Err(e) = self.accept_handshake(peer, packet).await {
            warn!(peer = %peer.label(), remote = ?peer.remote_addr(), "Handshake rejected: {e}");
            peer.reply(packet, Err(e));
            self.peer_disconnected(peer);
        }
    }

    async fn accept_handshake(&self, peer: &Arc<Peer>, packet: &Packet) -> NetronResult<()> {
        let hello: Handshake = payload(packet)?;
        self.verify_handshake(&hello)?;
        if self.peers.contains_key(&hello.uid) {
            return Err(NetronError::Exists(format!(
                "peer '{}' is already connected",
                hello.uid
            )));
        }

        peer.set_identity(&hello.uid, hello.is_super)?;
        peer.set_remote_definitions(hello.definitions.clone());
        if !self.hooks.on_confirm_peer(peer, &hello).await {
            return Err(NetronError::InvalidAccess(format!(
                "peer '{}' was not confirmed",
                hello.uid
            )));
        }

        match self.peers.entry(hello.uid.clone()) {
            Entry::Occupied(_) => {
                return Err(NetronError::Exists(format!(
                    "peer '{}' is already connected",
                    hello.uid
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(peer));
            }
        }
        self.pending.remove(&peer.connection_id());
        if !peer.advance(PeerStatus::Online) {
            self.peers.remove_if(&hello.uid, |_, p| Arc::ptr_eq(p, peer));
            return Err(NetronError::ConnectionClosed);
        }

        let reply = to_json(&self.own_handshake(peer))?;
        peer.reply(packet, Ok(reply));
        info!(
            peer = %hello.uid,
            is_super = hello.is_super,
            gate = ?peer.gate_id(),
            "Peer online"
        );
        self.events
            .publish(NetronEvent::PeerOnline { uid: hello.uid });
        Ok(())
    }

    fn on_context_attach(&self, peer: &Arc<Peer>, packet: &Packet) -> NetronResult<Value> {
        let request: ContextAttachRequest = payload(packet)?;
        let uid = online_uid(peer)?;

        match request.scope {
            AttachScope::Announce => {
                let mut definition = request.definition;
                definition.name = request.name.clone();
                peer.insert_remote_definition(definition);
                debug!(peer = %uid, name = %request.name, "Remote context attached");
                self.events.publish(NetronEvent::RemoteContextAttach {
                    uid,
                    name: request.name,
                });
                Ok(Value::Null)
            }
            AttachScope::Host => {
                if !self.config.is_super {
                    return Err(NetronError::NotAllowed(
                        "this node does not host contexts for its peers".to_string(),
                    ));
                }
                let stub = Stub::remote(peer, &uid, request.definition);
                let id = self.registry.attach(&request.name, stub)?;
                peer.add_own_definition(id);
                if !peer.is_online() {
                    // Disconnected meanwhile; its cleanup has already run.
                    peer.remove_own_definition(id);
                    self.registry.remove(id);
                    return Err(NetronError::ConnectionClosed);
                }

                info!(peer = %uid, name = %request.name, id, "Hosting context");
                self.events.publish(NetronEvent::ContextAttach {
                    name: request.name.clone(),
                    def_id: id,
                });
                if let Some(stub) = self.registry.lookup(id) {
                    self.announce(
                        &Announcement::Attach(stub.definition().clone()),
                        Some(uid.as_str()),
                    );
                }
                to_json(&ContextAttachReply { def_id: id })
            }
            AttachScope::Revoke => Err(NetronError::NotValid(
                "revoke is only valid for detach".to_string(),
            )),
        }
    }

    fn on_context_detach(&self, peer: &Arc<Peer>, packet: &Packet) -> NetronResult<Value> {
        let request: ContextDetachRequest = payload(packet)?;
        let uid = online_uid(peer)?;

        match request.scope {
            AttachScope::Announce => {
                peer.remove_remote_definition(&request.name).ok_or_else(|| {
                    NetronError::NotFound(format!("context '{}' on '{uid}'", request.name))
                })?;
                debug!(peer = %uid, name = %request.name, "Remote context detached");
                self.events.publish(NetronEvent::RemoteContextDetach {
                    uid,
                    name: request.name,
                });
                Ok(Value::Null)
            }
            AttachScope::Host => {
                if !self.config.is_super {
                    return Err(NetronError::NotAllowed(
                        "this node does not host contexts for its peers".to_string(),
                    ));
                }
                let id = self
                    .registry
                    .lookup_by_name(&request.name)
                    .map(|stub| stub.id())
                    .filter(|id| peer.owns_definition(*id))
                    .ok_or_else(|| {
                        NetronError::NotFound(format!(
                            "context '{}' hosted for '{uid}'",
                            request.name
                        ))
                    })?;
                self.registry.detach(id)?;
                peer.remove_own_definition(id);

                info!(peer = %uid, name = %request.name, id, "Stopped hosting context");
                self.events.publish(NetronEvent::ContextDetach {
                    name: request.name.clone(),
                    def_id: id,
                });
                self.announce(&Announcement::Detach(request.name), Some(uid.as_str()));
                Ok(Value::Null)
            }
            AttachScope::Revoke => {
                let local_id = peer.remove_pushed_context(&request.name).ok_or_else(|| {
                    NetronError::NotFound(format!(
                        "context '{}' was not pushed to '{uid}'",
                        request.name
                    ))
                })?;
                self.registry.remove(local_id);
                info!(peer = %uid, name = %request.name, local_id, "Pushed context dropped by host");
                Ok(Value::Null)
            }
        }
    }

    async fn on_invoke(&self, peer: &Arc<Peer>, packet: &Packet) -> NetronResult<Value> {
        let request: InvokeRequest = payload(packet)?;
        let stub = self
            .registry
            .lookup(request.def_id)
            .filter(|stub| self.may_invoke(peer, stub))
            .ok_or_else(|| NetronError::NotFound(format!("definition {}", request.def_id)))?;

        if packet.action == Action::Get && stub.meta().returns_contexts(&request.name) {
            return self.hand_out(peer, &stub, &request.name, request.args).await;
        }
        match packet.action {
            Action::Set => stub
                .set(&request.name, request.args)
                .await
                .map(|_| Value::Null),
            _ => stub.get(&request.name, request.args).await,
        }
    }

    /// Register what a factory method returned as children of `stub`, held
    /// by `peer`, and reply with their definitions.
    async fn hand_out(
        &self,
        peer: &Arc<Peer>,
        stub: &Stub,
        method: &str,
        args: Value,
    ) -> NetronResult<Value> {
        let uid = online_uid(peer)?;
        let children = stub.open(method, args).await?;

        let mut definitions = Vec::with_capacity(children.len());
        for child in children {
            let id = self.registry.register_child(child, stub.id(), &uid)?;
            if let Some(child) = self.registry.lookup(id) {
                definitions.push(child.definition().clone());
            }
        }
        if !peer.is_online() {
            // Disconnected meanwhile; its cleanup has already run.
            for definition in &definitions {
                self.registry.remove(definition.id);
            }
            return Err(NetronError::ConnectionClosed);
        }
        debug!(
            peer = %uid,
            parent = stub.id(),
            method = %method,
            count = definitions.len(),
            "Contexts handed out"
        );
        to_json(&definitions)
    }

    /// Published contexts are open to peers whose gate lets them see the
    /// name; anonymous stubs only to the peer they were pushed onto or
    /// handed to.
    fn may_invoke(&self, peer: &Peer, stub: &Stub) -> bool {
        if self.registry.is_published(stub.id()) {
            peer.can_see(stub.name())
        } else {
            peer.has_pushed(stub.id())
                || self.registry.holder_of(stub.id()).as_deref() == peer.uid()
        }
    }
}

fn payload<T: DeserializeOwned>(packet: &Packet) -> NetronResult<T> {
    packet.payload().map_err(|e| {
        NetronError::NotValid(format!("malformed {:?} payload: {e}", packet.action))
    })
}

fn online_uid(peer: &Peer) -> NetronResult<String> {
    peer.uid()
        .map(str::to_string)
        .ok_or_else(|| NetronError::IllegalState("peer has no identity".to_string()))
}
