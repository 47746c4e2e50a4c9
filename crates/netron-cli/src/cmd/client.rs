//! One-shot client commands: connect, do one thing, disconnect.

use crate::ui;
use netron::{Netron, NetronConfig, NetronResult, Peer};
use serde_json::Value;
use std::sync::Arc;

/// Dial `addr` with a throwaway node and return it with the remote peer.
async fn open(mut config: NetronConfig, addr: &str) -> NetronResult<(Arc<Netron>, Arc<Peer>)> {
    // A client never serves anything.
    config.gates.clear();
    config.is_super = false;
    let node = Netron::new(config);
    let peer = node.connect(addr).await?;
    Ok((node, peer))
}

fn remote_uid(peer: &Peer) -> String {
    peer.uid().unwrap_or_default().to_string()
}

pub async fn cmd_ping(config: NetronConfig, addr: &str, count: u32) -> NetronResult<()> {
    let (node, peer) = open(config, addr).await?;
    let uid = remote_uid(&peer);
    ui::success(&format!("Connected to {uid} at {addr}"));

    let mut total = 0.0;
    for seq in 1..=count.max(1) {
        let rtt = node.ping(&uid).await?;
        let ms = rtt.as_secs_f64() * 1000.0;
        total += ms;
        ui::kv(&format!("seq {seq}"), &format!("{ms:.2} ms"));
    }
    ui::kv_ok("Average", &format!("{:.2} ms", total / f64::from(count.max(1))));
    node.shutdown();
    Ok(())
}

pub async fn cmd_contexts(config: NetronConfig, addr: &str, json: bool) -> NetronResult<()> {
    let (node, peer) = open(config, addr).await?;
    let uid = remote_uid(&peer);
    let names = node.remote_context_names(&uid)?;

    if json {
        let definitions: Vec<_> = names
            .iter()
            .filter_map(|name| node.definition_by_name(name, Some(&uid)).ok())
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&definitions).unwrap_or_default()
        );
    } else {
        ui::section(&format!("Contexts on {uid}"));
        ui::blank();
        if names.is_empty() {
            ui::note("none");
        }
        for name in &names {
            let definition = node.definition_by_name(name, Some(&uid))?;
            let methods: Vec<&str> = definition.meta.methods.keys().map(String::as_str).collect();
            let properties: Vec<&str> = definition
                .meta
                .properties
                .keys()
                .map(String::as_str)
                .collect();
            ui::kv(name, &definition.meta.type_name);
            ui::note(&format!("methods: {}", methods.join(", ")));
            ui::note(&format!("properties: {}", properties.join(", ")));
        }
    }
    node.shutdown();
    Ok(())
}

pub async fn cmd_call(
    config: NetronConfig,
    addr: &str,
    context: &str,
    method: &str,
    args: &[String],
) -> NetronResult<()> {
    let (node, peer) = open(config, addr).await?;
    let iface = node.interface(&remote_uid(&peer), context)?;
    let result = iface.call(method, args.iter().map(|a| parse_arg(a)).collect()).await;
    node.shutdown();
    print_value(&result?);
    Ok(())
}

pub async fn cmd_get(
    config: NetronConfig,
    addr: &str,
    context: &str,
    property: &str,
) -> NetronResult<()> {
    let (node, peer) = open(config, addr).await?;
    let iface = node.interface(&remote_uid(&peer), context)?;
    let result = iface.get(property).await;
    node.shutdown();
    print_value(&result?);
    Ok(())
}

/// Parse a command-line argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_value(value: &Value) {
    match value {
        Value::String(s) => println!("{s}"),
        other => println!(
            "{}",
            serde_json::to_string_pretty(other).unwrap_or_default()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("42"), json!(42));
        assert_eq!(parse_arg("\"hi\""), json!("hi"));
        assert_eq!(parse_arg("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_arg("hello"), json!("hello"));
        assert_eq!(parse_arg("{broken"), json!("{broken"));
    }
}
