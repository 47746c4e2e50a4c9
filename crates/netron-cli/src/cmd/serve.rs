//! `netron serve`: run a node until interrupted.

use crate::node_context::{NodeContext, NODE_CONTEXT};
use crate::ui;
use netron::{GateConfig, Netron, NetronConfig, NetronEvent, NetronResult};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

pub async fn cmd_serve(mut config: NetronConfig, binds: Vec<String>, is_super: bool) -> NetronResult<()> {
    config.is_super |= is_super;
    let node = Netron::new(config);
    node.attach_context(NODE_CONTEXT, NodeContext::new(&node))?;

    let mut gates = node.bind_configured().await?;
    for address in binds {
        gates.push(node.bind(GateConfig::address(address)).await?);
    }
    if gates.is_empty() {
        gates.push(node.bind(GateConfig::default()).await?);
    }

    ui::section("Netron node");
    ui::blank();
    ui::kv_ok("Uid", node.uid());
    ui::kv("Super", if node.is_super() { "yes" } else { "no" });
    for gate in &gates {
        ui::kv("Gate", &format!("{} ({:?})", gate.local_addr, gate.ip_policy));
    }
    ui::kv("Contexts", &node.context_names().join(", "));
    ui::blank();
    ui::hint("Press Ctrl+C to stop");

    let mut events = node.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event {
                NetronEvent::PeerOnline { uid } => ui::success(&format!("{uid} online")),
                NetronEvent::PeerOffline { uid: Some(uid) } => ui::note(&format!("{uid} offline")),
                NetronEvent::ContextAttach { name, def_id } => {
                    ui::note(&format!("context '{name}' attached (#{def_id})"))
                }
                NetronEvent::ContextDetach { name, .. } => {
                    ui::note(&format!("context '{name}' detached"))
                }
                _ => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    watcher.abort();
    node.shutdown();
    ui::success("Node stopped");
    Ok(())
}
