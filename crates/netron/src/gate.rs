//! Gates: bound listeners accepting inbound peers.
//!
//! A gate owns its accept loop and the admission rules applied to every
//! connection it yields: the IP policy (checked before anything else) and
//! the set of contexts advertised to peers it accepts. Unbinding a gate stops
//! the accept loop only; peers it already accepted stay connected.

use crate::acl::IpPolicy;
use crate::node::Netron;
use netron_types::config::IpPolicyKind;
use netron_wire::Listener;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Snapshot of a bound gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateInfo {
    /// Gate id.
    pub id: String,
    /// Id of the adapter that bound it.
    pub adapter: String,
    /// Address actually bound.
    pub local_addr: String,
    /// Admission policy kind.
    pub ip_policy: IpPolicyKind,
    /// Contexts advertised over this gate (`None` = all).
    pub allowed_contexts: Option<Vec<String>>,
    /// Whether the gate keeps the node alive.
    pub refd: bool,
}

/// Rules applied to each connection a gate accepts.
#[derive(Debug)]
pub(crate) struct Admission {
    pub gate_id: String,
    pub policy: IpPolicy,
    pub allowed_contexts: Option<Arc<BTreeSet<String>>>,
}

pub(crate) struct Gate {
    adapter: String,
    local_addr: String,
    admission: Arc<Admission>,
    refd: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Gate {
    /// Start accepting on `listener`.
    pub fn start(
        netron: Arc<Netron>,
        adapter: &str,
        listener: Box<dyn Listener>,
        admission: Admission,
    ) -> Self {
        let local_addr = listener.local_addr();
        let admission = Arc::new(admission);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            netron,
            listener,
            Arc::clone(&admission),
            shutdown_rx,
        ));
        info!(
            gate = %admission.gate_id,
            addr = %local_addr,
            policy = ?admission.policy.kind(),
            "Gate bound"
        );
        Self {
            adapter: adapter.to_string(),
            local_addr,
            admission,
            refd: AtomicBool::new(true),
            shutdown,
            task,
        }
    }

    pub fn info(&self) -> GateInfo {
        GateInfo {
            id: self.admission.gate_id.clone(),
            adapter: self.adapter.clone(),
            local_addr: self.local_addr.clone(),
            ip_policy: self.admission.policy.kind(),
            allowed_contexts: self
                .admission
                .allowed_contexts
                .as_ref()
                .map(|set| set.iter().cloned().collect()),
            refd: self.is_refd(),
        }
    }

    pub fn is_refd(&self) -> bool {
        self.refd.load(Ordering::SeqCst)
    }

    pub fn set_refd(&self, refd: bool) {
        self.refd.store(refd, Ordering::SeqCst);
    }

    /// Stop accepting. Already-accepted peers are unaffected.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.task.abort();
        info!(gate = %self.admission.gate_id, "Gate unbound");
    }
}

async fn accept_loop(
    netron: Arc<Netron>,
    mut listener: Box<dyn Listener>,
    admission: Arc<Admission>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    debug!(gate = %admission.gate_id, remote = ?conn.remote_addr, "Accepted connection");
                    let netron = Arc::clone(&netron);
                    let admission = Arc::clone(&admission);
                    tokio::spawn(async move {
                        netron.admit(&admission, conn).await;
                    });
                }
                Err(e) => {
                    error!(gate = %admission.gate_id, "Accept error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
    debug!(gate = %admission.gate_id, "Accept loop stopped");
}
