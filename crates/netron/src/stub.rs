//! Registry entries.
//!
//! A [`Stub`] wraps either a local [`Context`] instance or a context hosted
//! on behalf of a peer (a super node relaying to the owner). Both validate
//! the member name against the definition before doing anything.

use crate::context::{args_to_vec, Context};
use crate::peer::Peer;
use netron_types::{ContextMeta, Definition, DefinitionId, NetronError, NetronResult};
use netron_wire::packet::InvokeRequest;
use netron_wire::Action;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};

/// A registry entry.
pub enum Stub {
    /// A context instance living on this node.
    Local {
        definition: Definition,
        instance: Arc<dyn Context>,
    },
    /// A context pushed onto this node by `owner_uid`; invocations are
    /// forwarded to the owner as definition `remote_id`.
    Remote {
        definition: Definition,
        owner_uid: String,
        remote_id: DefinitionId,
        peer: Weak<Peer>,
    },
}

impl Stub {
    /// Wrap a local instance. The id is assigned by the registry.
    pub fn local(name: &str, instance: Arc<dyn Context>) -> Self {
        let meta = instance.meta();
        Stub::Local {
            definition: Definition::new(0, name, meta),
            instance,
        }
    }

    /// Host `remote` (a definition issued by `peer`) on this node.
    pub(crate) fn remote(peer: &Arc<Peer>, owner_uid: &str, remote: Definition) -> Self {
        let mut definition = Definition::new(0, remote.name.clone(), remote.meta);
        definition.owner = Some(owner_uid.to_string());
        Stub::Remote {
            definition,
            owner_uid: owner_uid.to_string(),
            remote_id: remote.id,
            peer: Arc::downgrade(peer),
        }
    }

    /// The definition, as advertised to peers.
    pub fn definition(&self) -> &Definition {
        match self {
            Stub::Local { definition, .. } | Stub::Remote { definition, .. } => definition,
        }
    }

    /// Registry id.
    pub fn id(&self) -> DefinitionId {
        self.definition().id
    }

    /// Name the context was attached under.
    pub fn name(&self) -> &str {
        &self.definition().name
    }

    /// Callable surface.
    pub fn meta(&self) -> &ContextMeta {
        &self.definition().meta
    }

    /// Owner uid for hosted contexts.
    pub fn owner_uid(&self) -> Option<&str> {
        match self {
            Stub::Local { .. } => None,
            Stub::Remote { owner_uid, .. } => Some(owner_uid),
        }
    }

    /// Whether the instance lives on this node.
    pub fn is_local(&self) -> bool {
        matches!(self, Stub::Local { .. })
    }

    pub(crate) fn bind(&mut self, id: DefinitionId, name: &str) {
        let definition = match self {
            Stub::Local { definition, .. } | Stub::Remote { definition, .. } => definition,
        };
        definition.id = id;
        definition.name = name.to_string();
    }

    pub(crate) fn set_parent(&mut self, parent: DefinitionId) {
        match self {
            Stub::Local { definition, .. } | Stub::Remote { definition, .. } => {
                definition.parent_id = Some(parent)
            }
        }
    }

    /// Call a factory method. The returned stubs are not registered yet; a
    /// hosted context yields stubs relaying to the contexts its owner handed
    /// out.
    pub async fn open(&self, name: &str, args: Value) -> NetronResult<Vec<Stub>> {
        let definition = self.definition();
        if !definition.meta.returns_contexts(name) {
            return Err(NetronError::InvalidArgument(format!(
                "'{}.{name}' does not hand out contexts",
                definition.name
            )));
        }
        match self {
            Stub::Local { instance, .. } => {
                let children = instance.open(name, args_to_vec(args)).await?;
                Ok(children
                    .into_iter()
                    .map(|child| {
                        let type_name = child.meta().type_name;
                        Stub::local(&type_name, child)
                    })
                    .collect())
            }
            Stub::Remote {
                definition,
                owner_uid,
                remote_id,
                peer,
            } => {
                let reply = forward(definition, *remote_id, peer, Action::Get, name, args).await?;
                let handed: Vec<Definition> = serde_json::from_value(reply).map_err(|e| {
                    NetronError::NotValid(format!("malformed factory reply: {e}"))
                })?;
                Ok(handed
                    .into_iter()
                    .map(|remote| {
                        let mut child = Definition::new(0, remote.name, remote.meta);
                        child.owner = Some(owner_uid.clone());
                        Stub::Remote {
                            definition: child,
                            owner_uid: owner_uid.clone(),
                            remote_id: remote.id,
                            peer: peer.clone(),
                        }
                    })
                    .collect())
            }
        }
    }

    /// Call a method (`args` is the argument array) or read a property
    /// (`args` is the default returned when the property is unset).
    pub async fn get(&self, name: &str, args: Value) -> NetronResult<Value> {
        if self.meta().returns_contexts(name) {
            return Err(NetronError::InvalidArgument(format!(
                "'{}.{name}' hands out contexts and must be opened",
                self.name()
            )));
        }
        match self {
            Stub::Local { definition, instance } => {
                let meta = &definition.meta;
                if meta.has_method(name) {
                    instance.call(name, args_to_vec(args)).await
                } else if meta.get_property(name).is_some() {
                    Ok(instance.get(name).await?.unwrap_or(args))
                } else {
                    Err(unknown_member(definition, name))
                }
            }
            Stub::Remote {
                definition,
                remote_id,
                peer,
                ..
            } => forward(definition, *remote_id, peer, Action::Get, name, args).await,
        }
    }

    /// Call a method discarding its result, or write a property.
    pub async fn set(&self, name: &str, value: Value) -> NetronResult<()> {
        match self {
            Stub::Local { definition, instance } => {
                let meta = &definition.meta;
                if meta.returns_contexts(name) {
                    instance.open(name, args_to_vec(value)).await.map(|_| ())
                } else if meta.has_method(name) {
                    instance.call(name, args_to_vec(value)).await.map(|_| ())
                } else if let Some(prop) = meta.get_property(name) {
                    if prop.readonly {
                        return Err(NetronError::NotAllowed(format!(
                            "property '{name}' of '{}' is read-only",
                            definition.name
                        )));
                    }
                    instance.set(name, value).await
                } else {
                    Err(unknown_member(definition, name))
                }
            }
            Stub::Remote {
                definition,
                remote_id,
                peer,
                ..
            } => forward(definition, *remote_id, peer, Action::Set, name, value)
                .await
                .map(|_| ()),
        }
    }
}

/// Relay an invocation to the node owning a hosted context.
async fn forward(
    definition: &Definition,
    remote_id: DefinitionId,
    peer: &Weak<Peer>,
    action: Action,
    name: &str,
    args: Value,
) -> NetronResult<Value> {
    let meta = &definition.meta;
    if !meta.has_method(name) && meta.get_property(name).is_none() {
        return Err(unknown_member(definition, name));
    }
    let peer = peer.upgrade().ok_or(NetronError::ConnectionClosed)?;
    let request = InvokeRequest {
        def_id: remote_id,
        name: name.to_string(),
        args,
    };
    let data = serde_json::to_value(request).map_err(|e| NetronError::Wire(e.to_string()))?;
    peer.request(action, data).await
}

fn unknown_member(definition: &Definition, name: &str) -> NetronError {
    NetronError::NotFound(format!(
        "'{}' has no method or property '{name}'",
        definition.name
    ))
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stub::Local { definition, .. } => f
                .debug_struct("Stub::Local")
                .field("definition", definition)
                .finish_non_exhaustive(),
            Stub::Remote {
                definition,
                owner_uid,
                remote_id,
                ..
            } => f
                .debug_struct("Stub::Remote")
                .field("definition", definition)
                .field("owner_uid", owner_uid)
                .field("remote_id", remote_id)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use netron_types::ErrorKind;
    use serde_json::json;
    use std::sync::Mutex;

    struct Counter {
        label: Mutex<Option<Value>>,
        total: Mutex<i64>,
    }

    #[async_trait]
    impl Context for Counter {
        fn meta(&self) -> ContextMeta {
            ContextMeta::new("Counter")
                .method("add", &["n"])
                .property("label")
                .readonly_property("total")
        }

        async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value> {
            match method {
                "add" => {
                    let n = args.first().and_then(Value::as_i64).ok_or_else(|| {
                        NetronError::InvalidArgument("add expects a number".to_string())
                    })?;
                    let mut total = self.total.lock().unwrap();
                    *total += n;
                    Ok(json!(*total))
                }
                other => Err(NetronError::NotFound(other.to_string())),
            }
        }

        async fn get(&self, property: &str) -> NetronResult<Option<Value>> {
            match property {
                "label" => Ok(self.label.lock().unwrap().clone()),
                "total" => Ok(Some(json!(*self.total.lock().unwrap()))),
                other => Err(NetronError::NotFound(other.to_string())),
            }
        }

        async fn set(&self, property: &str, value: Value) -> NetronResult<()> {
            match property {
                "label" => {
                    *self.label.lock().unwrap() = Some(value);
                    Ok(())
                }
                other => Err(NetronError::NotAllowed(other.to_string())),
            }
        }
    }

    fn counter() -> Stub {
        Stub::local(
            "counter",
            Arc::new(Counter {
                label: Mutex::new(None),
                total: Mutex::new(0),
            }),
        )
    }

    #[tokio::test]
    async fn test_local_method_and_properties() {
        let stub = counter();
        assert!(stub.is_local());
        assert_eq!(stub.meta().type_name, "Counter");

        assert_eq!(stub.get("add", json!([2])).await.unwrap(), json!(2));
        stub.set("add", json!([3])).await.unwrap();
        assert_eq!(stub.get("total", Value::Null).await.unwrap(), json!(5));

        // Unset property falls back to the default.
        assert_eq!(stub.get("label", json!("none")).await.unwrap(), json!("none"));
        stub.set("label", json!("mine")).await.unwrap();
        assert_eq!(stub.get("label", json!("none")).await.unwrap(), json!("mine"));
    }

    #[tokio::test]
    async fn test_validation() {
        let stub = counter();
        let err = stub.get("missing", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = stub.set("total", json!(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAllowed);

        let err = stub.get("add", json!(["x"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_bind_sets_id_and_name() {
        let mut stub = counter();
        stub.bind(7, "renamed");
        assert_eq!(stub.id(), 7);
        assert_eq!(stub.name(), "renamed");
        assert!(stub.owner_uid().is_none());
    }

    struct Shelf;

    #[async_trait]
    impl Context for Shelf {
        fn meta(&self) -> ContextMeta {
            ContextMeta::new("Shelf")
                .method("size", &[])
                .factory("counters", &["n"])
        }

        async fn call(&self, _method: &str, _args: Vec<Value>) -> NetronResult<Value> {
            Ok(json!(0))
        }

        async fn open(&self, _method: &str, args: Vec<Value>) -> NetronResult<Vec<Arc<dyn Context>>> {
            let n = args.first().and_then(Value::as_u64).unwrap_or(1);
            Ok((0..n)
                .map(|_| {
                    Arc::new(Counter {
                        label: Mutex::new(None),
                        total: Mutex::new(0),
                    }) as Arc<dyn Context>
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_factory_methods() {
        let stub = Stub::local("shelf", Arc::new(Shelf));
        let children = stub.open("counters", json!([3])).await.unwrap();
        assert_eq!(children.len(), 3);
        assert!(children.iter().all(|c| c.is_local() && c.name() == "Counter"));
        assert_eq!(children[0].get("add", json!([4])).await.unwrap(), json!(4));

        let err = stub.get("counters", json!([1])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = stub.open("size", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // Opening for effect only.
        stub.set("counters", json!([2])).await.unwrap();
    }
}
