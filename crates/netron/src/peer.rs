//! One connection to another node.
//!
//! A [`Peer`] owns the outbound packet queue, the table of outstanding
//! requests (awaiters keyed by stream id) and the per-link context
//! bookkeeping:
//!
//! - `own_definition_ids`: ids in the local registry that this peer pushed
//!   onto us (only ever non-empty on a super node);
//! - `remote_definitions`: contexts this peer advertises to us;
//! - `pushed_contexts`: local stubs we pushed onto this peer.
//!
//! Reading from the socket and dispatching impulses is the node's business
//! (see `node.rs`); the peer only writes.

use chrono::{DateTime, Utc};
use netron_types::{Definition, DefinitionId, NetronError, NetronResult, PeerStatus};
use netron_wire::codec::write_packet;
use netron_wire::transport::BoxedWriter;
use netron_wire::{Action, Packet};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    /// Accepted by one of our gates.
    Inbound,
    /// Dialed by us.
    Outbound,
}

type Awaiter = oneshot::Sender<NetronResult<Packet>>;

/// Construction parameters for a [`Peer`].
#[derive(Debug, Clone)]
pub(crate) struct PeerOptions {
    pub direction: PeerDirection,
    pub gate_id: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub allowed_contexts: Option<Arc<BTreeSet<String>>>,
    pub response_timeout: Option<Duration>,
}

/// Receiving ends handed to the I/O tasks.
pub(crate) struct PeerIo {
    pub outbox: mpsc::UnboundedReceiver<Packet>,
    pub closed: watch::Receiver<bool>,
}

/// A connection to another node.
pub struct Peer {
    id: Uuid,
    direction: PeerDirection,
    gate_id: Option<String>,
    remote_addr: Option<SocketAddr>,
    allowed_contexts: Option<Arc<BTreeSet<String>>>,
    connected_at: DateTime<Utc>,
    response_timeout: Option<Duration>,

    uid: OnceLock<String>,
    is_super: AtomicBool,
    status: watch::Sender<PeerStatus>,
    refd: AtomicBool,

    own_definition_ids: Mutex<BTreeSet<DefinitionId>>,
    remote_definitions: RwLock<HashMap<String, Definition>>,
    pushed_contexts: Mutex<HashMap<String, DefinitionId>>,

    awaiters: Mutex<HashMap<u64, Awaiter>>,
    next_stream_id: AtomicU64,
    outbox: mpsc::UnboundedSender<Packet>,
    closed: watch::Sender<bool>,
}

impl Peer {
    pub(crate) fn new(options: PeerOptions) -> (Arc<Self>, PeerIo) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(false);
        let peer = Arc::new(Self {
            id: Uuid::new_v4(),
            direction: options.direction,
            gate_id: options.gate_id,
            remote_addr: options.remote_addr,
            allowed_contexts: options.allowed_contexts,
            connected_at: Utc::now(),
            response_timeout: options.response_timeout,
            uid: OnceLock::new(),
            is_super: AtomicBool::new(false),
            status: watch::Sender::new(PeerStatus::Handshaking),
            refd: AtomicBool::new(true),
            own_definition_ids: Mutex::new(BTreeSet::new()),
            remote_definitions: RwLock::new(HashMap::new()),
            pushed_contexts: Mutex::new(HashMap::new()),
            awaiters: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
            outbox,
            closed,
        });
        let io = PeerIo {
            outbox: outbox_rx,
            closed: closed_rx,
        };
        (peer, io)
    }

    // ----- identity -----

    /// Local connection id, unique per transport connection.
    pub fn connection_id(&self) -> Uuid {
        self.id
    }

    /// The remote node's uid, known once it has handshaken.
    pub fn uid(&self) -> Option<&str> {
        self.uid.get().map(String::as_str)
    }

    /// The uid if known, otherwise the connection id. For logs.
    pub fn label(&self) -> String {
        match self.uid() {
            Some(uid) => uid.to_string(),
            None => format!("conn:{}", self.id),
        }
    }

    /// Whether the remote node hosts pushed contexts.
    pub fn is_super(&self) -> bool {
        self.is_super.load(Ordering::SeqCst)
    }

    pub(crate) fn set_identity(&self, uid: &str, is_super: bool) -> NetronResult<()> {
        self.uid.set(uid.to_string()).map_err(|_| {
            NetronError::IllegalState(format!("peer {} already identified", self.label()))
        })?;
        self.is_super.store(is_super, Ordering::SeqCst);
        Ok(())
    }

    /// Which side opened the connection.
    pub fn direction(&self) -> PeerDirection {
        self.direction
    }

    /// Gate that accepted this connection, for inbound peers.
    pub fn gate_id(&self) -> Option<&str> {
        self.gate_id.as_deref()
    }

    /// Remote socket address, when the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// When the transport connection was established.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    // ----- status -----

    /// Current status.
    pub fn status(&self) -> PeerStatus {
        *self.status.borrow()
    }

    /// Whether the peer is online.
    pub fn is_online(&self) -> bool {
        self.status() == PeerStatus::Online
    }

    /// Move to `next` if that is a legal transition. Returns whether this call
    /// performed the transition.
    pub(crate) fn advance(&self, next: PeerStatus) -> bool {
        let mut moved = false;
        self.status.send_if_modified(|current| {
            if current.can_advance_to(next) {
                *current = next;
                moved = true;
            }
            moved
        });
        moved
    }

    /// Wait until the handshake has either completed or failed.
    pub(crate) async fn settled(&self) -> PeerStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(|s| *s != PeerStatus::Handshaking).await {
            Ok(status) => *status,
            Err(_) => PeerStatus::Offline,
        };
        status
    }

    /// Whether this peer counts toward keeping the node alive.
    pub fn is_refd(&self) -> bool {
        self.refd.load(Ordering::SeqCst)
    }

    pub(crate) fn set_refd(&self, refd: bool) {
        self.refd.store(refd, Ordering::SeqCst);
    }

    // ----- visibility -----

    /// Whether a context named `name` may be advertised to or invoked by
    /// this peer. Governed by the accepting gate's `allowed_contexts`.
    pub fn can_see(&self, name: &str) -> bool {
        self.allowed_contexts
            .as_ref()
            .map_or(true, |allowed| allowed.contains(name))
    }

    // ----- contexts this peer pushed onto us -----

    pub(crate) fn add_own_definition(&self, id: DefinitionId) {
        self.own_definition_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    pub(crate) fn remove_own_definition(&self, id: DefinitionId) -> bool {
        self.own_definition_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    /// Whether `id` in our registry was pushed by this peer.
    pub fn owns_definition(&self, id: DefinitionId) -> bool {
        self.own_definition_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    /// Ids in our registry that this peer pushed onto us.
    pub fn own_definition_ids(&self) -> Vec<DefinitionId> {
        self.own_definition_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub(crate) fn take_own_definition_ids(&self) -> Vec<DefinitionId> {
        let mut ids = self
            .own_definition_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *ids).into_iter().collect()
    }

    // ----- contexts this peer advertises -----

    pub(crate) fn set_remote_definitions(&self, definitions: Vec<Definition>) {
        let mut map = self
            .remote_definitions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        map.clear();
        for def in definitions {
            map.insert(def.name.clone(), def);
        }
    }

    pub(crate) fn insert_remote_definition(&self, definition: Definition) {
        self.remote_definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(definition.name.clone(), definition);
    }

    pub(crate) fn remove_remote_definition(&self, name: &str) -> Option<Definition> {
        self.remote_definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub(crate) fn clear_remote_definitions(&self) {
        self.remote_definitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Definition of a context this peer advertises.
    pub fn remote_definition(&self, name: &str) -> Option<Definition> {
        self.remote_definitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Names of the contexts this peer advertises, sorted.
    pub fn remote_context_names(&self) -> Vec<String> {
        let map = self
            .remote_definitions
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    // ----- contexts we pushed onto this peer -----

    /// Record a pushed context. False if the name is already pushed.
    pub(crate) fn add_pushed_context(&self, name: &str, id: DefinitionId) -> bool {
        let mut pushed = self
            .pushed_contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if pushed.contains_key(name) {
            return false;
        }
        pushed.insert(name.to_string(), id);
        true
    }

    pub(crate) fn remove_pushed_context(&self, name: &str) -> Option<DefinitionId> {
        self.pushed_contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    /// Whether local stub `id` was pushed onto this peer.
    pub fn has_pushed(&self, id: DefinitionId) -> bool {
        self.pushed_contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|pushed| *pushed == id)
    }

    /// Names of the contexts we pushed onto this peer, sorted.
    pub fn pushed_context_names(&self) -> Vec<String> {
        let pushed = self
            .pushed_contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = pushed.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn take_pushed_contexts(&self) -> Vec<(String, DefinitionId)> {
        let mut pushed = self
            .pushed_contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *pushed).into_iter().collect()
    }

    // ----- packets -----

    /// Queue a packet for the writer task.
    ///
    /// Only a handshaking or online peer accepts packets.
    pub(crate) fn send(&self, packet: Packet) -> NetronResult<()> {
        let status = self.status();
        if status == PeerStatus::Offline {
            return Err(NetronError::IllegalState(format!(
                "peer {} is {status}",
                self.label()
            )));
        }
        self.outbox
            .send(packet)
            .map_err(|_| NetronError::ConnectionClosed)
    }

    /// Answer an impulse.
    pub(crate) fn reply(&self, request: &Packet, result: NetronResult<Value>) {
        let packet = match result {
            Ok(data) => request.reply(self.status(), data),
            Err(e) => request.error_reply(self.status(), e.to_remote()),
        };
        if let Err(e) = self.send(packet) {
            debug!(peer = %self.label(), action = ?request.action, "Reply dropped: {e}");
        }
    }

    /// Register an awaiter and queue a request. The packet is queued before
    /// this returns, so requests leave in call order.
    pub(crate) fn begin_request(
        self: &Arc<Self>,
        action: Action,
        data: Value,
    ) -> NetronResult<PendingReply> {
        if self.status() == PeerStatus::Offline {
            return Err(NetronError::ConnectionClosed);
        }
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.awaiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stream_id, tx);

        let packet = Packet::request(action, self.status(), stream_id, data);
        if let Err(e) = self.send(packet) {
            self.remove_awaiter(stream_id);
            return Err(e);
        }
        Ok(PendingReply {
            rx,
            stream_id,
            peer: Arc::clone(self),
            timeout: self.response_timeout,
        })
    }

    /// Send a request and wait for its reply.
    pub(crate) async fn request(self: &Arc<Self>, action: Action, data: Value) -> NetronResult<Value> {
        self.begin_request(action, data)?.wait().await
    }

    /// Hand a reply to its awaiter. False when nobody is waiting for it.
    pub(crate) fn resolve(&self, packet: Packet) -> bool {
        match self.remove_awaiter(packet.stream_id) {
            Some(tx) => {
                let _ = tx.send(Ok(packet));
                true
            }
            None => false,
        }
    }

    fn remove_awaiter(&self, stream_id: u64) -> Option<Awaiter> {
        self.awaiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream_id)
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.awaiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Fail every outstanding request with `ConnectionClosed`.
    pub(crate) fn fail_awaiters(&self) {
        let drained: Vec<Awaiter> = {
            let mut awaiters = self.awaiters.lock().unwrap_or_else(|e| e.into_inner());
            awaiters.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(NetronError::ConnectionClosed));
        }
    }

    /// Signal the I/O tasks to stop. Queued packets are flushed first.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("direction", &self.direction)
            .field("status", &self.status())
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// An outstanding request.
pub(crate) struct PendingReply {
    rx: oneshot::Receiver<NetronResult<Packet>>,
    stream_id: u64,
    peer: Arc<Peer>,
    timeout: Option<Duration>,
}

impl PendingReply {
    /// Wait for the reply, honoring the peer's response timeout.
    pub async fn wait(self) -> NetronResult<Value> {
        let PendingReply {
            rx,
            stream_id,
            peer,
            timeout,
        } = self;

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    peer.remove_awaiter(stream_id);
                    return Err(NetronError::Timeout(limit.as_millis() as u64));
                }
            },
            None => rx.await,
        };

        let packet = received.map_err(|_| NetronError::ConnectionClosed)??;
        packet.into_result().map_err(NetronError::from)
    }
}

/// Drain the outbox onto the transport until the peer closes.
pub(crate) async fn run_writer(
    mut writer: BoxedWriter,
    mut io: PeerIo,
    label: String,
) {
    loop {
        tokio::select! {
            packet = io.outbox.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = write_packet(&mut writer, &packet).await {
                        debug!(peer = %label, "Write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            _ = io.closed.changed() => {
                while let Ok(packet) = io.outbox.try_recv() {
                    if write_packet(&mut writer, &packet).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    debug!(peer = %label, "Writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use netron_types::{ContextMeta, ErrorKind, RemoteError};
    use serde_json::json;

    fn peer_with(timeout: Option<Duration>) -> (Arc<Peer>, PeerIo) {
        Peer::new(PeerOptions {
            direction: PeerDirection::Outbound,
            gate_id: None,
            remote_addr: None,
            allowed_contexts: None,
            response_timeout: timeout,
        })
    }

    #[test]
    fn test_status_transitions() {
        let (peer, _io) = peer_with(None);
        assert_eq!(peer.status(), PeerStatus::Handshaking);
        assert!(peer.advance(PeerStatus::Online));
        assert!(!peer.advance(PeerStatus::Online));
        assert!(!peer.advance(PeerStatus::Handshaking));
        assert!(peer.advance(PeerStatus::Offline));
        assert!(!peer.advance(PeerStatus::Offline));
        assert!(!peer.is_online());
    }

    #[tokio::test]
    async fn test_settled_waits_for_handshake() {
        let (peer, _io) = peer_with(None);
        let waiter = tokio::spawn({
            let peer = Arc::clone(&peer);
            async move { peer.settled().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        peer.advance(PeerStatus::Online);
        assert_eq!(waiter.await.unwrap(), PeerStatus::Online);
    }

    #[test]
    fn test_identity_set_once() {
        let (peer, _io) = peer_with(None);
        assert!(peer.uid().is_none());
        assert!(peer.label().starts_with("conn:"));
        peer.set_identity("node-a", true).unwrap();
        assert_eq!(peer.uid(), Some("node-a"));
        assert!(peer.is_super());
        assert!(matches!(
            peer.set_identity("node-b", false),
            Err(NetronError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_request_resolves_by_stream_id() {
        let (peer, mut io) = peer_with(None);
        peer.advance(PeerStatus::Online);

        let first = peer.begin_request(Action::Ping, Value::Null).unwrap();
        let second = peer.begin_request(Action::Ping, Value::Null).unwrap();
        assert_eq!(peer.pending_requests(), 2);

        let req1 = io.outbox.recv().await.unwrap();
        let req2 = io.outbox.recv().await.unwrap();
        assert!(req1.stream_id < req2.stream_id);

        // Answer out of order.
        assert!(peer.resolve(req2.reply(PeerStatus::Online, json!("two"))));
        assert!(peer.resolve(req1.reply(PeerStatus::Online, json!("one"))));
        assert!(!peer.resolve(req1.reply(PeerStatus::Online, json!("again"))));

        assert_eq!(first.wait().await.unwrap(), json!("one"));
        assert_eq!(second.wait().await.unwrap(), json!("two"));
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_kind() {
        let (peer, mut io) = peer_with(None);
        let pending = peer.begin_request(Action::Get, Value::Null).unwrap();
        let req = io.outbox.recv().await.unwrap();
        peer.resolve(req.error_reply(
            PeerStatus::Online,
            RemoteError {
                kind: ErrorKind::NotFound,
                message: "gone".to_string(),
            },
        ));
        let err = pending.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_fail_awaiters_on_close() {
        let (peer, _io) = peer_with(None);
        let pending = peer.begin_request(Action::Ping, Value::Null).unwrap();
        peer.advance(PeerStatus::Offline);
        peer.fail_awaiters();
        assert!(matches!(
            pending.wait().await,
            Err(NetronError::ConnectionClosed)
        ));
        assert!(matches!(
            peer.begin_request(Action::Ping, Value::Null),
            Err(NetronError::ConnectionClosed)
        ));
        assert!(matches!(
            peer.send(Packet::request(Action::Ping, PeerStatus::Offline, 0, Value::Null)),
            Err(NetronError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_response_timeout() {
        let (peer, _io) = peer_with(Some(Duration::from_millis(20)));
        let err = peer.request(Action::Ping, Value::Null).await.unwrap_err();
        assert!(matches!(err, NetronError::Timeout(20)));
        assert_eq!(peer.pending_requests(), 0);
    }

    #[test]
    fn test_visibility_and_bookkeeping() {
        let allowed: BTreeSet<String> = ["calc".to_string()].into_iter().collect();
        let (peer, _io) = Peer::new(PeerOptions {
            direction: PeerDirection::Inbound,
            gate_id: Some("g".to_string()),
            remote_addr: None,
            allowed_contexts: Some(Arc::new(allowed)),
            response_timeout: None,
        });
        assert!(peer.can_see("calc"));
        assert!(!peer.can_see("secret"));

        peer.add_own_definition(4);
        assert!(peer.owns_definition(4));
        assert_eq!(peer.take_own_definition_ids(), vec![4]);
        assert!(peer.own_definition_ids().is_empty());

        assert!(peer.add_pushed_context("svc", 9));
        assert!(!peer.add_pushed_context("svc", 10));
        assert!(peer.has_pushed(9));
        assert_eq!(peer.remove_pushed_context("svc"), Some(9));
        assert!(!peer.has_pushed(9));

        peer.set_remote_definitions(vec![
            Definition::new(2, "b", ContextMeta::new("B")),
            Definition::new(1, "a", ContextMeta::new("A")),
        ]);
        assert_eq!(peer.remote_context_names(), vec!["a", "b"]);
        assert!(peer.remove_remote_definition("a").is_some());
        assert!(peer.remote_definition("a").is_none());
        peer.clear_remote_definitions();
        assert!(peer.remote_context_names().is_empty());
    }

    #[tokio::test]
    async fn test_writer_flushes_queue_on_close() {
        let (peer, io) = peer_with(None);
        let (client, mut server) = tokio::io::duplex(4096);
        peer.send(Packet::request(Action::Ping, PeerStatus::Handshaking, 1, Value::Null))
            .unwrap();
        peer.close();
        run_writer(Box::new(client), io, peer.label()).await;

        let got = netron_wire::codec::read_packet(&mut server, 1024).await.unwrap();
        assert_eq!(got.stream_id, 1);
    }
}
