//! Typed handles for invoking contexts.
//!
//! An [`Interface`] binds a definition to the place its instance lives: a
//! connected peer or this node's own registry. Member names are checked
//! against the definition before any packet is sent.

use crate::peer::Peer;
use crate::stub::Stub;
use netron_types::{Definition, NetronError, NetronResult, PropertyMeta};
use netron_wire::packet::InvokeRequest;
use netron_wire::Action;
use serde_json::Value;
use std::sync::Arc;

enum Target {
    Remote(Arc<Peer>),
    Local(Arc<Stub>),
}

/// A handle on one context.
pub struct Interface {
    definition: Definition,
    target: Target,
}

impl Interface {
    pub(crate) fn remote(peer: Arc<Peer>, definition: Definition) -> Self {
        Self {
            definition,
            target: Target::Remote(peer),
        }
    }

    pub(crate) fn local(stub: Arc<Stub>) -> Self {
        Self {
            definition: stub.definition().clone(),
            target: Target::Local(stub),
        }
    }

    /// The definition this handle was built from.
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Uid of the peer serving this context, `None` for local handles.
    pub fn peer_uid(&self) -> Option<&str> {
        match &self.target {
            Target::Remote(peer) => peer.uid(),
            Target::Local(_) => None,
        }
    }

    /// Call a method and return its result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value> {
        self.require_method(method)?;
        if self.definition.meta.returns_contexts(method) {
            return Err(NetronError::InvalidArgument(format!(
                "'{}.{method}' hands out contexts and must be opened",
                self.definition.name
            )));
        }
        self.get_raw(method, Value::Array(args)).await
    }

    /// Call a factory method and return a handle on each context it handed
    /// out. Remote handles stay valid until the serving node releases them;
    /// local ones live as long as the handle.
    pub async fn open(&self, method: &str, args: Vec<Value>) -> NetronResult<Vec<Interface>> {
        self.require_method(method)?;
        if !self.definition.meta.returns_contexts(method) {
            return Err(NetronError::InvalidArgument(format!(
                "'{}.{method}' does not hand out contexts",
                self.definition.name
            )));
        }
        match &self.target {
            Target::Local(stub) => Ok(stub
                .open(method, Value::Array(args))
                .await?
                .into_iter()
                .map(|child| Interface::local(Arc::new(child)))
                .collect()),
            Target::Remote(peer) => {
                let reply = peer
                    .request(Action::Get, self.invoke(method, Value::Array(args))?)
                    .await?;
                let handed: Vec<Definition> = serde_json::from_value(reply).map_err(|e| {
                    NetronError::NotValid(format!("malformed factory reply: {e}"))
                })?;
                Ok(handed
                    .into_iter()
                    .map(|definition| Interface::remote(peer.clone(), definition))
                    .collect())
            }
        }
    }

    /// Call a method without waiting for its result value.
    ///
    /// Errors raised by the method are still reported.
    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> NetronResult<()> {
        self.require_method(method)?;
        self.set_raw(method, Value::Array(args)).await
    }

    /// Read a property. An unset property reads as `null`.
    pub async fn get(&self, property: &str) -> NetronResult<Value> {
        self.get_or(property, Value::Null).await
    }

    /// Read a property, falling back to `default` when it is unset.
    pub async fn get_or(&self, property: &str, default: Value) -> NetronResult<Value> {
        self.require_property(property)?;
        self.get_raw(property, default).await
    }

    /// Write a property.
    pub async fn set(&self, property: &str, value: Value) -> NetronResult<()> {
        let meta = self.require_property(property)?;
        if meta.readonly {
            return Err(NetronError::NotAllowed(format!(
                "property '{property}' of '{}' is read-only",
                self.definition.name
            )));
        }
        self.set_raw(property, value).await
    }

    async fn get_raw(&self, name: &str, args: Value) -> NetronResult<Value> {
        match &self.target {
            Target::Local(stub) => stub.get(name, args).await,
            Target::Remote(peer) => peer.request(Action::Get, self.invoke(name, args)?).await,
        }
    }

    async fn set_raw(&self, name: &str, value: Value) -> NetronResult<()> {
        match &self.target {
            Target::Local(stub) => stub.set(name, value).await,
            Target::Remote(peer) => peer
                .request(Action::Set, self.invoke(name, value)?)
                .await
                .map(|_| ()),
        }
    }

    fn invoke(&self, name: &str, args: Value) -> NetronResult<Value> {
        let request = InvokeRequest {
            def_id: self.definition.id,
            name: name.to_string(),
            args,
        };
        serde_json::to_value(request).map_err(|e| NetronError::Wire(e.to_string()))
    }

    fn require_method(&self, name: &str) -> NetronResult<()> {
        if self.definition.meta.has_method(name) {
            Ok(())
        } else {
            Err(NetronError::NotFound(format!(
                "'{}' has no method '{name}'",
                self.definition.name
            )))
        }
    }

    fn require_property(&self, name: &str) -> NetronResult<&PropertyMeta> {
        self.definition.meta.get_property(name).ok_or_else(|| {
            NetronError::NotFound(format!(
                "'{}' has no property '{name}'",
                self.definition.name
            ))
        })
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("definition", &self.definition.name)
            .field("peer", &self.peer_uid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use async_trait::async_trait;
    use netron_types::{ContextMeta, ErrorKind};
    use serde_json::json;
    use std::sync::Mutex;

    struct Greeter {
        greeting: Mutex<Option<Value>>,
    }

    #[async_trait]
    impl Context for Greeter {
        fn meta(&self) -> ContextMeta {
            ContextMeta::new("Greeter")
                .method("greet", &["name"])
                .factory("twin", &[])
                .property("greeting")
                .readonly_property("version")
        }

        async fn open(&self, _method: &str, _args: Vec<Value>) -> NetronResult<Vec<Arc<dyn Context>>> {
            let greeting = self.greeting.lock().unwrap().clone();
            Ok(vec![Arc::new(Greeter {
                greeting: Mutex::new(greeting),
            })])
        }

        async fn call(&self, _method: &str, args: Vec<Value>) -> NetronResult<Value> {
            let greeting = self
                .greeting
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(json!("hello"));
            let name = args.first().cloned().unwrap_or(Value::Null);
            Ok(json!(format!(
                "{} {}",
                greeting.as_str().unwrap_or_default(),
                name.as_str().unwrap_or_default()
            )))
        }

        async fn get(&self, property: &str) -> NetronResult<Option<Value>> {
            match property {
                "greeting" => Ok(self.greeting.lock().unwrap().clone()),
                _ => Ok(Some(json!("1.0"))),
            }
        }

        async fn set(&self, _property: &str, value: Value) -> NetronResult<()> {
            *self.greeting.lock().unwrap() = Some(value);
            Ok(())
        }
    }

    fn local() -> Interface {
        let mut stub = Stub::local(
            "greeter",
            Arc::new(Greeter {
                greeting: Mutex::new(None),
            }),
        );
        stub.bind(1, "greeter");
        Interface::local(Arc::new(stub))
    }

    #[tokio::test]
    async fn test_local_interface() {
        let iface = local();
        assert!(iface.peer_uid().is_none());
        assert_eq!(iface.definition().id, 1);

        assert_eq!(iface.get("greeting").await.unwrap(), Value::Null);
        assert_eq!(
            iface.get_or("greeting", json!("hi")).await.unwrap(),
            json!("hi")
        );
        assert_eq!(
            iface.call("greet", vec![json!("bob")]).await.unwrap(),
            json!("hello bob")
        );

        iface.set("greeting", json!("hey")).await.unwrap();
        assert_eq!(
            iface.call("greet", vec![json!("ann")]).await.unwrap(),
            json!("hey ann")
        );
        iface.call_void("greet", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_member_checks() {
        let iface = local();
        let err = iface.call("greeting", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = iface.get("greet").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = iface.set("version", json!("2")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAllowed);
        let err = iface.call("twin", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = iface.open("greet", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_local_open() {
        let iface = local();
        iface.set("greeting", json!("yo")).await.unwrap();
        let twins = iface.open("twin", vec![]).await.unwrap();
        assert_eq!(twins.len(), 1);
        assert_eq!(twins[0].definition().name, "Greeter");
        assert_eq!(
            twins[0].call("greet", vec![json!("max")]).await.unwrap(),
            json!("yo max")
        );
    }
}
