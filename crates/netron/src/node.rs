//! The node.
//!
//! A [`Netron`] owns the context registry, the bound gates, the registered
//! adapters and every peer connection. Peers start in a pending set keyed by
//! connection id and move to the uid-keyed peer map once their handshake is
//! accepted; the two never overlap.
//!
//! Each connection runs three tasks: a writer draining the peer's outbox, a
//! reader that resolves replies directly, and a dispatcher that handles
//! impulses one at a time in arrival order. Replies never queue behind
//! impulses, so a handler may await requests on its own peer.

use crate::acl::IpPolicy;
use crate::context::Context;
use crate::events::{EventBus, NetronEvent};
use crate::gate::{Admission, Gate, GateInfo};
use crate::hooks::{DefaultHooks, NetronHooks};
use crate::interface::Interface;
use crate::peer::{run_writer, Peer, PeerDirection, PeerIo, PeerOptions};
use crate::registry::Registry;
use crate::retry::{retry_async, RetryPolicy};
use crate::stub::Stub;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use netron_types::config::{GateConfig, NetronConfig};
use netron_types::{Definition, DefinitionId, NetronError, NetronResult, PeerStatus};
use netron_wire::auth::{sign_identity, verify_identity};
use netron_wire::codec::read_packet;
use netron_wire::packet::{AttachScope, ContextAttachReply, ContextAttachRequest, ContextDetachRequest};
use netron_wire::transport::{normalize_address, BoxedReader, BoxedWriter};
use netron_wire::{Action, Adapter, Connection, Handshake, Packet, TcpAdapter, WireError, PROTOCOL_VERSION};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Host used when a gate address omits one.
const BIND_HOST: &str = "0.0.0.0";
/// Host used when a dial address omits one.
const DIAL_HOST: &str = "127.0.0.1";

/// Where and how to dial.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Address to dial (`host:port`, `host` or `:port`).
    pub address: String,
    /// Adapter id; the built-in TCP adapter when `None`.
    pub adapter: Option<String>,
    /// Dial retry policy; the node's `[connect]` settings when `None`.
    pub retry: Option<RetryPolicy>,
}

impl ConnectOptions {
    /// Dial `address` over TCP with the configured retry policy.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            adapter: None,
            retry: None,
        }
    }

    /// Dial through a registered adapter.
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

impl From<&str> for ConnectOptions {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for ConnectOptions {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

/// What a context announcement says.
pub(crate) enum Announcement {
    Attach(Definition),
    Detach(String),
}

impl Announcement {
    fn name(&self) -> &str {
        match self {
            Announcement::Attach(def) => &def.name,
            Announcement::Detach(name) => name,
        }
    }
}

/// A Netron node.
pub struct Netron {
    pub(crate) config: NetronConfig,
    pub(crate) hooks: Arc<dyn NetronHooks>,
    pub(crate) registry: Registry,
    pub(crate) events: EventBus,
    default_adapter: Arc<dyn Adapter>,
    adapters: DashMap<String, Arc<dyn Adapter>>,
    gates: DashMap<String, Gate>,
    pub(crate) peers: DashMap<String, Arc<Peer>>,
    pub(crate) pending: DashMap<Uuid, Arc<Peer>>,
    peers_refd: AtomicBool,
    started_at: Instant,
}

impl Netron {
    /// Create a node with the default (accept-all) hooks.
    pub fn new(config: NetronConfig) -> Arc<Self> {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a node with custom admission hooks.
    pub fn with_hooks(config: NetronConfig, hooks: Arc<dyn NetronHooks>) -> Arc<Self> {
        info!(uid = %config.uid, is_super = config.is_super, "Netron node created");
        Arc::new(Self {
            config,
            hooks,
            registry: Registry::new(),
            events: EventBus::new(),
            default_adapter: Arc::new(TcpAdapter::new()),
            adapters: DashMap::new(),
            gates: DashMap::new(),
            peers: DashMap::new(),
            pending: DashMap::new(),
            peers_refd: AtomicBool::new(true),
            started_at: Instant::now(),
        })
    }

    /// This node's uid.
    pub fn uid(&self) -> &str {
        &self.config.uid
    }

    /// Whether this node hosts contexts pushed by its peers.
    pub fn is_super(&self) -> bool {
        self.config.is_super
    }

    /// The configuration the node was built with.
    pub fn config(&self) -> &NetronConfig {
        &self.config
    }

    /// Time since the node was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Subscribe to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NetronEvent> {
        self.events.subscribe()
    }

    fn response_timeout(&self) -> Option<Duration> {
        match self.config.response_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    // ---------------------------------------------------------------------
    // Adapters and gates
    // ---------------------------------------------------------------------

    /// Register a transport adapter under its id.
    pub fn attach_adapter(&self, adapter: Arc<dyn Adapter>) -> NetronResult<()> {
        let id = adapter.id().to_string();
        if id.is_empty() {
            return Err(NetronError::InvalidArgument(
                "adapter id must not be empty".to_string(),
            ));
        }
        match self.adapters.entry(id.clone()) {
            Entry::Occupied(_) => Err(NetronError::Exists(format!("adapter '{id}'"))),
            Entry::Vacant(slot) => {
                slot.insert(adapter);
                info!(adapter = %id, "Adapter attached");
                Ok(())
            }
        }
    }

    fn adapter(&self, id: Option<&str>) -> NetronResult<Arc<dyn Adapter>> {
        match id {
            None => Ok(Arc::clone(&self.default_adapter)),
            Some(id) => self
                .adapters
                .get(id)
                .map(|a| Arc::clone(a.value()))
                .ok_or_else(|| NetronError::Unknown(format!("adapter '{id}'"))),
        }
    }

    /// Bind a gate and start accepting peers on it.
    pub async fn bind(self: &Arc<Self>, gate: GateConfig) -> NetronResult<GateInfo> {
        let (adapter, address) = match gate.adapter.as_deref() {
            Some(name) => {
                let adapter = self.adapter(Some(name))?;
                let address = gate
                    .address
                    .clone()
                    .or_else(|| adapter.default_address())
                    .ok_or_else(|| {
                        NetronError::InvalidArgument(format!(
                            "adapter '{name}' has no default address"
                        ))
                    })?;
                (adapter, address)
            }
            None => (
                Arc::clone(&self.default_adapter),
                normalize_address(
                    gate.address.as_deref().unwrap_or_default(),
                    BIND_HOST,
                    self.config.default_port,
                ),
            ),
        };

        // Ephemeral ports get their id from the address actually bound.
        let requested_id = gate.id.clone().or_else(|| gate.adapter.clone()).or_else(|| {
            (!address.ends_with(":0")).then(|| format!("{}://{address}", adapter.id()))
        });
        if let Some(id) = &requested_id {
            if self.gates.contains_key(id) {
                return Err(NetronError::Exists(format!("gate '{id}'")));
            }
        }

        let policy = IpPolicy::compile(gate.ip_policy, &gate.ip_list)?;
        let listener = adapter.bind(&address).await?;
        let id = requested_id
            .unwrap_or_else(|| format!("{}://{}", adapter.id(), listener.local_addr()));

        match self.gates.entry(id.clone()) {
            Entry::Occupied(_) => Err(NetronError::Exists(format!("gate '{id}'"))),
            Entry::Vacant(slot) => {
                let admission = Admission {
                    gate_id: id,
                    policy,
                    allowed_contexts: gate
                        .allowed_contexts
                        .map(|names| Arc::new(names.into_iter().collect::<BTreeSet<_>>())),
                };
                let gate = Gate::start(Arc::clone(self), adapter.id(), listener, admission);
                let info = gate.info();
                slot.insert(gate);
                Ok(info)
            }
        }
    }

    /// Bind every gate listed in the configuration.
    pub async fn bind_configured(self: &Arc<Self>) -> NetronResult<Vec<GateInfo>> {
        let mut bound = Vec::with_capacity(self.config.gates.len());
        for gate in self.config.gates.clone() {
            bound.push(self.bind(gate).await?);
        }
        Ok(bound)
    }

    /// Stop one gate, or all gates when `id` is `None`. Accepted peers stay
    /// connected.
    pub fn unbind(&self, id: Option<&str>) -> NetronResult<()> {
        match id {
            Some(id) => {
                let (_, gate) = self
                    .gates
                    .remove(id)
                    .ok_or_else(|| NetronError::Unknown(format!("gate '{id}'")))?;
                gate.stop();
            }
            None => {
                let ids: Vec<String> = self.gates.iter().map(|g| g.key().clone()).collect();
                for id in ids {
                    if let Some((_, gate)) = self.gates.remove(&id) {
                        gate.stop();
                    }
                }
            }
        }
        Ok(())
    }

    /// Bound gates, sorted by id.
    pub fn gates(&self) -> Vec<GateInfo> {
        let mut gates: Vec<GateInfo> = self.gates.iter().map(|g| g.value().info()).collect();
        gates.sort_by(|a, b| a.id.cmp(&b.id));
        gates
    }

    /// Let gates keep the node alive.
    pub fn ref_gates(&self) {
        self.gates.iter().for_each(|g| g.value().set_refd(true));
    }

    /// Stop gates from keeping the node alive.
    pub fn unref_gates(&self) {
        self.gates.iter().for_each(|g| g.value().set_refd(false));
    }

    /// Let peer connections (current and future) keep the node alive.
    pub fn ref_peers(&self) {
        self.set_peers_refd(true);
    }

    /// Stop peer connections (current and future) from keeping the node alive.
    pub fn unref_peers(&self) {
        self.set_peers_refd(false);
    }

    fn set_peers_refd(&self, refd: bool) {
        self.peers_refd.store(refd, Ordering::SeqCst);
        self.peers.iter().for_each(|p| p.value().set_refd(refd));
        self.pending.iter().for_each(|p| p.value().set_refd(refd));
    }

    /// Whether any referenced gate or connection remains.
    pub fn keeps_alive(&self) -> bool {
        self.gates.iter().any(|g| g.value().is_refd())
            || self.peers.iter().any(|p| p.value().is_refd())
            || self.pending.iter().any(|p| p.value().is_refd())
    }

    // ---------------------------------------------------------------------
    // Peers
    // ---------------------------------------------------------------------

    /// Dial a node and complete the handshake.
    pub async fn connect(
        self: &Arc<Self>,
        options: impl Into<ConnectOptions>,
    ) -> NetronResult<Arc<Peer>> {
        let options = options.into();
        let adapter = self.adapter(options.adapter.as_deref())?;
        let address = if options.adapter.is_some() {
            options.address.clone()
        } else {
            normalize_address(&options.address, DIAL_HOST, self.config.default_port)
        };
        let policy = options
            .retry
            .unwrap_or_else(|| RetryPolicy::from(&self.config.connect));

        debug!(address = %address, adapter = %adapter.id(), "Dialing");
        let conn = retry_async(
            &policy,
            || {
                let adapter = Arc::clone(&adapter);
                let address = address.clone();
                async move { adapter.dial(&address).await }
            },
            |e| matches!(e, WireError::Io(_)),
        )
        .await
        .into_result()?;

        let Connection {
            reader,
            writer,
            remote_addr,
        } = conn;
        let (peer, io) = self.new_peer(PeerDirection::Outbound, None, remote_addr, None);
        self.pending.insert(peer.connection_id(), Arc::clone(&peer));
        self.start_io(&peer, reader, writer, io);
        self.events.publish(NetronEvent::PeerConnect {
            remote_addr,
            gate_id: None,
        });

        match self.handshake(&peer).await {
            Ok(()) => Ok(peer),
            Err(e) => {
                warn!(address = %address, "Handshake failed: {e}");
                self.peer_disconnected(&peer);
                Err(e)
            }
        }
    }

    async fn handshake(&self, peer: &Arc<Peer>) -> NetronResult<()> {
        let hello = to_json(&self.own_handshake(peer))?;
        let reply = peer.request(Action::Handshake, hello).await?;
        let remote: Handshake = serde_json::from_value(reply)
            .map_err(|e| NetronError::NotValid(format!("malformed handshake reply: {e}")))?;
        self.verify_handshake(&remote)?;

        peer.set_identity(&remote.uid, remote.is_super)?;
        peer.set_remote_definitions(remote.definitions);
        match self.peers.entry(remote.uid.clone()) {
            Entry::Occupied(_) => {
                return Err(NetronError::Exists(format!(
                    "peer '{}' is already connected",
                    remote.uid
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(peer));
            }
        }
        self.pending.remove(&peer.connection_id());
        if !peer.advance(PeerStatus::Online) {
            self.peers.remove_if(&remote.uid, |_, p| Arc::ptr_eq(p, peer));
            return Err(NetronError::ConnectionClosed);
        }

        info!(peer = %remote.uid, is_super = remote.is_super, "Peer online");
        self.events
            .publish(NetronEvent::PeerOnline { uid: remote.uid });
        Ok(())
    }

    /// Our handshake as seen by `peer`.
    pub(crate) fn own_handshake(&self, peer: &Peer) -> Handshake {
        let definitions = self
            .registry
            .published_definitions()
            .into_iter()
            .filter(|d| peer.can_see(&d.name))
            .collect();
        let (nonce, auth_hmac) = if self.config.shared_secret.is_empty() {
            (String::new(), String::new())
        } else {
            sign_identity(&self.config.shared_secret, &self.config.uid)
        };
        Handshake {
            uid: self.config.uid.clone(),
            is_super: self.config.is_super,
            protocol_version: PROTOCOL_VERSION,
            definitions,
            nonce,
            auth_hmac,
            auth: self.hooks.on_send_handshake(peer),
        }
    }

    /// Checks shared by both sides of the handshake.
    pub(crate) fn verify_handshake(&self, remote: &Handshake) -> NetronResult<()> {
        if remote.protocol_version != PROTOCOL_VERSION {
            return Err(NetronError::NotValid(format!(
                "protocol version {} (expected {PROTOCOL_VERSION})",
                remote.protocol_version
            )));
        }
        if remote.uid.is_empty() {
            return Err(NetronError::NotValid("empty peer uid".to_string()));
        }
        if remote.uid == self.config.uid {
            return Err(NetronError::Exists(format!(
                "peer uid '{}' is this node's own uid",
                remote.uid
            )));
        }
        if !self.config.shared_secret.is_empty()
            && !verify_identity(
                &self.config.shared_secret,
                &remote.uid,
                &remote.nonce,
                &remote.auth_hmac,
            )
        {
            return Err(NetronError::InvalidAccess(format!(
                "HMAC authentication failed for '{}'",
                remote.uid
            )));
        }
        Ok(())
    }

    fn new_peer(
        &self,
        direction: PeerDirection,
        gate_id: Option<String>,
        remote_addr: Option<std::net::SocketAddr>,
        allowed_contexts: Option<Arc<BTreeSet<String>>>,
    ) -> (Arc<Peer>, PeerIo) {
        let (peer, io) = Peer::new(PeerOptions {
            direction,
            gate_id,
            remote_addr,
            allowed_contexts,
            response_timeout: self.response_timeout(),
        });
        peer.set_refd(self.peers_refd.load(Ordering::SeqCst));
        (peer, io)
    }

    /// Take in a connection accepted by a gate.
    pub(crate) async fn admit(self: &Arc<Self>, admission: &Admission, conn: Connection) {
        if !admission.policy.permits(conn.remote_ip()) {
            warn!(
                gate = %admission.gate_id,
                remote = ?conn.remote_addr,
                "Connection refused by IP policy"
            );
            return;
        }

        let Connection {
            reader,
            writer,
            remote_addr,
        } = conn;
        let (peer, io) = self.new_peer(
            PeerDirection::Inbound,
            Some(admission.gate_id.clone()),
            remote_addr,
            admission.allowed_contexts.clone(),
        );
        if !self.hooks.on_confirm_connection(&peer).await {
            info!(gate = %admission.gate_id, remote = ?remote_addr, "Connection rejected");
            peer.advance(PeerStatus::Offline);
            return;
        }

        self.pending.insert(peer.connection_id(), Arc::clone(&peer));
        self.start_io(&peer, reader, writer, io);
        debug!(gate = %admission.gate_id, peer = %peer.label(), "Connection pending handshake");
        self.events.publish(NetronEvent::PeerConnect {
            remote_addr,
            gate_id: Some(admission.gate_id.clone()),
        });
    }

    fn start_io(self: &Arc<Self>, peer: &Arc<Peer>, reader: BoxedReader, writer: BoxedWriter, io: PeerIo) {
        let closed = io.closed.clone();
        let (impulses, impulse_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(writer, io, peer.label()));
        tokio::spawn(Arc::clone(self).run_dispatcher(Arc::clone(peer), impulse_rx));
        tokio::spawn(Arc::clone(self).run_reader(Arc::clone(peer), reader, closed, impulses));
    }

    async fn run_reader(
        self: Arc<Self>,
        peer: Arc<Peer>,
        mut reader: BoxedReader,
        mut closed: watch::Receiver<bool>,
        impulses: mpsc::UnboundedSender<Packet>,
    ) {
        let max_frame_size = self.config.max_frame_size;
        loop {
            tokio::select! {
                _ = closed.changed() => break,
                read = read_packet(&mut reader, max_frame_size) => match read {
                    Ok(packet) if packet.is_impulse() => {
                        if impulses.send(packet).is_err() {
                            break;
                        }
                    }
                    Ok(packet) => {
                        let stream_id = packet.stream_id;
                        if !peer.resolve(packet) {
                            debug!(peer = %peer.label(), stream_id, "Reply with no awaiter dropped");
                        }
                    }
                    Err(WireError::ConnectionClosed) => {
                        debug!(peer = %peer.label(), "Connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %peer.label(), "Read failed, disconnecting: {e}");
                        break;
                    }
                }
            }
        }
        self.peer_disconnected(&peer);
    }

    async fn run_dispatcher(self: Arc<Self>, peer: Arc<Peer>, mut impulses: mpsc::UnboundedReceiver<Packet>) {
        while let Some(packet) = impulses.recv().await {
            self.process_packet(&peer, packet).await;
        }
    }

    /// Tear down a connection and everything tied to it. Idempotent.
    pub(crate) fn peer_disconnected(&self, peer: &Arc<Peer>) {
        let was_online = peer.is_online();
        if !peer.advance(PeerStatus::Offline) {
            return;
        }
        peer.close();
        self.pending.remove(&peer.connection_id());
        if let Some(uid) = peer.uid() {
            self.peers.remove_if(uid, |_, p| Arc::ptr_eq(p, peer));
        }
        peer.fail_awaiters();

        for id in peer.take_own_definition_ids() {
            if let Some(stub) = self.registry.remove(id) {
                debug!(peer = %peer.label(), name = %stub.name(), id, "Hosted context released");
                self.events.publish(NetronEvent::ContextDetach {
                    name: stub.name().to_string(),
                    def_id: id,
                });
                self.announce(&Announcement::Detach(stub.name().to_string()), peer.uid());
            }
        }
        for (name, id) in peer.take_pushed_contexts() {
            self.registry.remove(id);
            debug!(peer = %peer.label(), name = %name, id, "Pushed stub released");
        }
        if let Some(uid) = peer.uid() {
            let held = self.registry.held_by(uid);
            if !held.is_empty() {
                debug!(peer = %uid, count = held.len(), "Handed-out contexts released");
            }
            for id in held {
                self.registry.remove(id);
            }
        }
        peer.clear_remote_definitions();

        if was_online {
            info!(peer = %peer.label(), "Peer offline");
        } else {
            debug!(peer = %peer.label(), "Connection closed before handshake completed");
        }
        self.events.publish(NetronEvent::PeerOffline {
            uid: if was_online {
                peer.uid().map(str::to_string)
            } else {
                None
            },
        });
    }

    /// Tell online peers (except `except`) that may see the context about it.
    /// Acknowledgements are awaited in the background.
    pub(crate) fn announce(&self, announcement: &Announcement, except: Option<&str>) {
        let name = announcement.name();
        let (action, data) = match announcement {
            Announcement::Attach(definition) => (
                Action::ContextAttach,
                to_json(&ContextAttachRequest {
                    scope: AttachScope::Announce,
                    name: name.to_string(),
                    definition: definition.clone(),
                }),
            ),
            Announcement::Detach(_) => (
                Action::ContextDetach,
                to_json(&ContextDetachRequest {
                    scope: AttachScope::Announce,
                    name: name.to_string(),
                }),
            ),
        };
        let data = match data {
            Ok(data) => data,
            Err(e) => {
                warn!(name = %name, "Announcement not encodable: {e}");
                return;
            }
        };

        let mut acks = Vec::new();
        for entry in self.peers.iter() {
            let peer = entry.value();
            if !peer.is_online() || peer.uid() == except || !peer.can_see(name) {
                continue;
            }
            match peer.begin_request(action, data.clone()) {
                Ok(pending) => acks.push((peer.label(), pending)),
                Err(e) => {
                    debug!(peer = %peer.label(), name = %name, "Announcement not sent: {e}");
                }
            }
        }
        if acks.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let name = name.to_string();
        runtime.spawn(async move {
            let results = join_all(
                acks.into_iter()
                    .map(|(label, pending)| async move { (label, pending.wait().await) }),
            )
            .await;
            for (label, result) in results {
                if let Err(e) = result {
                    debug!(peer = %label, name = %name, ?action, "Announcement not acknowledged: {e}");
                }
            }
        });
    }

    /// Close the connection to `uid`.
    pub fn disconnect(&self, uid: &str) -> NetronResult<()> {
        let peer = self.peer(uid)?;
        self.peer_disconnected(&peer);
        Ok(())
    }

    /// Close every connection, handshaken or not.
    pub fn disconnect_all(&self) {
        let peers: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .map(|p| Arc::clone(p.value()))
            .chain(self.pending.iter().map(|p| Arc::clone(p.value())))
            .collect();
        for peer in peers {
            self.peer_disconnected(&peer);
        }
    }

    /// Unbind all gates and close all connections.
    pub fn shutdown(&self) {
        let _ = self.unbind(None);
        self.disconnect_all();
        info!(uid = %self.config.uid, "Netron node shut down");
    }

    /// An online peer by uid.
    pub fn peer(&self, uid: &str) -> NetronResult<Arc<Peer>> {
        self.peers
            .get(uid)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| NetronError::Unknown(format!("peer '{uid}'")))
    }

    /// Online peers, sorted by uid.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self.peers.iter().map(|p| Arc::clone(p.value())).collect();
        peers.sort_by(|a, b| a.uid().cmp(&b.uid()));
        peers
    }

    /// Connections still handshaking.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Round-trip time to `uid`.
    pub async fn ping(&self, uid: &str) -> NetronResult<Duration> {
        let peer = self.peer(uid)?;
        let start = Instant::now();
        peer.request(Action::Ping, Value::Null).await?;
        Ok(start.elapsed())
    }

    // ---------------------------------------------------------------------
    // Contexts
    // ---------------------------------------------------------------------

    /// Publish a local context and announce it to the peers allowed to see it.
    pub fn attach_context(&self, name: &str, instance: Arc<dyn Context>) -> NetronResult<DefinitionId> {
        let id = self.registry.attach(name, Stub::local(name, instance))?;
        info!(name = %name, id, "Context attached");
        self.events.publish(NetronEvent::ContextAttach {
            name: name.to_string(),
            def_id: id,
        });
        if let Some(stub) = self.registry.lookup(id) {
            self.announce(&Announcement::Attach(stub.definition().clone()), None);
        }
        Ok(id)
    }

    /// Withdraw a published context.
    ///
    /// A context hosted for a peer is withdrawn too, and its owner is told so
    /// that it can push the context again.
    pub fn detach_context(&self, name: &str) -> NetronResult<DefinitionId> {
        let stub = self.registry.detach(name)?;
        let id = stub.id();
        let owner = stub.owner_uid();
        if let Some(peer) = owner.and_then(|uid| self.peers.get(uid).map(|p| p.value().clone())) {
            peer.remove_own_definition(id);
            self.revoke_hosted(&peer, name);
        }
        info!(name = %name, id, "Context detached");
        self.events.publish(NetronEvent::ContextDetach {
            name: name.to_string(),
            def_id: id,
        });
        self.announce(&Announcement::Detach(name.to_string()), owner);
        Ok(id)
    }

    /// Tell `owner` we no longer host its context `name`.
    fn revoke_hosted(&self, owner: &Arc<Peer>, name: &str) {
        if !owner.is_online() {
            return;
        }
        let data = match to_json(&ContextDetachRequest {
            scope: AttachScope::Revoke,
            name: name.to_string(),
        }) {
            Ok(data) => data,
            Err(e) => {
                warn!(name = %name, "Revocation not encodable: {e}");
                return;
            }
        };
        let pending = match owner.begin_request(Action::ContextDetach, data) {
            Ok(pending) => pending,
            Err(e) => {
                debug!(peer = %owner.label(), name = %name, "Revocation not sent: {e}");
                return;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let label = owner.label();
        let name = name.to_string();
        runtime.spawn(async move {
            if let Err(e) = pending.wait().await {
                debug!(peer = %label, name = %name, "Revocation not acknowledged: {e}");
            }
        });
    }

    /// Release a context handed out by a factory method, and everything
    /// handed out beneath it. Later calls through the holder's handle fail
    /// with `NotFound`.
    pub fn release_context(&self, id: DefinitionId) -> NetronResult<()> {
        if self.registry.parent_of(id).is_none() {
            return Err(NetronError::NotFound(format!(
                "definition {id} was not handed out"
            )));
        }
        let stub = self.registry.detach(id)?;
        debug!(name = %stub.name(), id, "Handed-out context released");
        Ok(())
    }

    /// Contexts this node handed to peer `uid`.
    pub fn handed_out(&self, uid: &str) -> Vec<DefinitionId> {
        self.registry.held_by(uid)
    }

    /// Push a local context onto super node `uid`, which then serves it to its
    /// own peers. Returns the id the super node assigned.
    pub async fn attach_context_remote(
        &self,
        uid: &str,
        name: &str,
        instance: Arc<dyn Context>,
    ) -> NetronResult<DefinitionId> {
        let peer = self.peer(uid)?;
        if !peer.is_super() {
            return Err(NetronError::NotAllowed(format!(
                "peer '{uid}' is not a super node"
            )));
        }
        let local_id = self.registry.register(Stub::local(name, instance));
        if !peer.add_pushed_context(name, local_id) {
            self.registry.remove(local_id);
            return Err(NetronError::Exists(format!(
                "context '{name}' already pushed to '{uid}'"
            )));
        }

        let result = self.push_context(&peer, name, local_id).await;
        match &result {
            Ok(remote_id) => info!(peer = %uid, name = %name, local_id, remote_id, "Context pushed"),
            Err(e) => {
                warn!(peer = %uid, name = %name, "Context push failed: {e}");
                peer.remove_pushed_context(name);
                self.registry.remove(local_id);
            }
        }
        result
    }

    async fn push_context(
        &self,
        peer: &Arc<Peer>,
        name: &str,
        local_id: DefinitionId,
    ) -> NetronResult<DefinitionId> {
        let definition = self
            .registry
            .lookup(local_id)
            .map(|stub| stub.definition().clone())
            .ok_or_else(|| NetronError::NotFound(format!("definition {local_id}")))?;
        let request = to_json(&ContextAttachRequest {
            scope: AttachScope::Host,
            name: name.to_string(),
            definition,
        })?;
        let reply = peer.request(Action::ContextAttach, request).await?;
        let reply: ContextAttachReply = serde_json::from_value(reply)
            .map_err(|e| NetronError::NotValid(format!("malformed attach reply: {e}")))?;
        Ok(reply.def_id)
    }

    /// Withdraw a context previously pushed onto `uid`.
    pub async fn detach_context_remote(&self, uid: &str, name: &str) -> NetronResult<()> {
        let peer = self.peer(uid)?;
        let local_id = peer.remove_pushed_context(name).ok_or_else(|| {
            NetronError::NotFound(format!("context '{name}' was not pushed to '{uid}'"))
        })?;
        self.registry.remove(local_id);
        let request = to_json(&ContextDetachRequest {
            scope: AttachScope::Host,
            name: name.to_string(),
        })?;
        peer.request(Action::ContextDetach, request).await?;
        info!(peer = %uid, name = %name, "Pushed context withdrawn");
        Ok(())
    }

    /// Names published by this node, sorted.
    pub fn context_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Whether this node publishes `name`.
    pub fn has_context(&self, name: &str) -> bool {
        self.registry.lookup_by_name(name).is_some()
    }

    /// A registry entry by id.
    pub fn stub(&self, id: DefinitionId) -> Option<Arc<Stub>> {
        self.registry.lookup(id)
    }

    /// Definition of `name`, from this node (`uid = None`) or from a peer.
    pub fn definition_by_name(&self, name: &str, uid: Option<&str>) -> NetronResult<Definition> {
        match uid {
            None => self
                .registry
                .lookup_by_name(name)
                .map(|stub| stub.definition().clone())
                .ok_or_else(|| NetronError::NotFound(format!("context '{name}'"))),
            Some(uid) => self.peer(uid)?.remote_definition(name).ok_or_else(|| {
                NetronError::NotFound(format!("context '{name}' on peer '{uid}'"))
            }),
        }
    }

    /// Names of the contexts `uid` advertises to us.
    pub fn remote_context_names(&self, uid: &str) -> NetronResult<Vec<String>> {
        Ok(self.peer(uid)?.remote_context_names())
    }

    /// Handle on a context advertised by `uid`.
    pub fn interface(&self, uid: &str, name: &str) -> NetronResult<Interface> {
        let peer = self.peer(uid)?;
        let definition = peer.remote_definition(name).ok_or_else(|| {
            NetronError::NotFound(format!("context '{name}' on peer '{uid}'"))
        })?;
        Ok(Interface::remote(peer, definition))
    }

    /// Handle on a context published by this node.
    pub fn local_interface(&self, name: &str) -> NetronResult<Interface> {
        self.registry
            .lookup_by_name(name)
            .map(Interface::local)
            .ok_or_else(|| NetronError::NotFound(format!("context '{name}'")))
    }
}

impl std::fmt::Debug for Netron {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netron")
            .field("uid", &self.config.uid)
            .field("is_super", &self.config.is_super)
            .field("gates", &self.gates.len())
            .field("peers", &self.peers.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> NetronResult<Value> {
    serde_json::to_value(value).map_err(|e| NetronError::Wire(e.to_string()))
}
