//! The `node` context every served node publishes about itself.

use async_trait::async_trait;
use netron::{Context, ContextMeta, Netron, NetronError, NetronResult};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

/// Name the context is published under.
pub const NODE_CONTEXT: &str = "node";

/// Read-only view of the serving node.
pub struct NodeContext {
    node: Weak<Netron>,
}

impl NodeContext {
    pub fn new(node: &Arc<Netron>) -> Arc<Self> {
        Arc::new(Self {
            node: Arc::downgrade(node),
        })
    }

    fn node(&self) -> NetronResult<Arc<Netron>> {
        self.node
            .upgrade()
            .ok_or_else(|| NetronError::IllegalState("node has shut down".to_string()))
    }
}

#[async_trait]
impl Context for NodeContext {
    fn meta(&self) -> ContextMeta {
        ContextMeta::new("Node")
            .with_description("Identity and status of the serving node")
            .method("echo", &["value"])
            .method("contexts", &[])
            .readonly_property("uid")
            .readonly_property("uptime")
            .readonly_property("peers")
    }

    async fn call(&self, method: &str, mut args: Vec<Value>) -> NetronResult<Value> {
        match method {
            "echo" => Ok(match args.len() {
                0 => Value::Null,
                1 => args.remove(0),
                _ => Value::Array(args),
            }),
            "contexts" => Ok(json!(self.node()?.context_names())),
            other => Err(NetronError::NotFound(format!("method '{other}'"))),
        }
    }

    async fn get(&self, property: &str) -> NetronResult<Option<Value>> {
        let node = self.node()?;
        let value = match property {
            "uid" => json!(node.uid()),
            "uptime" => json!(node.uptime().as_secs()),
            "peers" => json!(node
                .peers()
                .iter()
                .filter_map(|p| p.uid().map(str::to_string))
                .collect::<Vec<_>>()),
            other => return Err(NetronError::NotFound(format!("property '{other}'"))),
        };
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netron::{ErrorKind, NetronConfig};

    fn node() -> Arc<Netron> {
        Netron::new(NetronConfig {
            uid: "cli-test".to_string(),
            ..NetronConfig::default()
        })
    }

    #[tokio::test]
    async fn test_echo() {
        let node = node();
        let ctx = NodeContext::new(&node);
        assert_eq!(ctx.call("echo", vec![]).await.unwrap(), Value::Null);
        assert_eq!(ctx.call("echo", vec![json!("hi")]).await.unwrap(), json!("hi"));
        assert_eq!(
            ctx.call("echo", vec![json!(1), json!(2)]).await.unwrap(),
            json!([1, 2])
        );
    }

    #[tokio::test]
    async fn test_properties_through_local_interface() {
        let node = node();
        node.attach_context(NODE_CONTEXT, NodeContext::new(&node))
            .unwrap();

        let iface = node.local_interface(NODE_CONTEXT).unwrap();
        assert_eq!(iface.get("uid").await.unwrap(), json!("cli-test"));
        assert_eq!(iface.get("peers").await.unwrap(), json!([]));
        assert!(iface.get("uptime").await.unwrap().is_u64());
        assert_eq!(
            iface.call("contexts", vec![]).await.unwrap(),
            json!([NODE_CONTEXT])
        );

        let err = iface.set("uid", json!("other")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAllowed);
    }

    #[tokio::test]
    async fn test_detached_node() {
        let ctx = NodeContext::new(&node());
        let err = ctx.get("uid").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }
}
