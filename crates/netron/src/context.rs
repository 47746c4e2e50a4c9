//! The application-object contract.
//!
//! A [`Context`] is whatever a node exposes to its peers: it describes its
//! callable surface through [`ContextMeta`] and answers method calls and
//! property accesses. The runtime validates names against the metadata
//! before a context ever sees a request.

use async_trait::async_trait;
use netron_types::{ContextMeta, NetronError, NetronResult};
use serde_json::Value;
use std::sync::Arc;

/// An object exposed to peers.
#[async_trait]
pub trait Context: Send + Sync + 'static {
    /// Callable surface. Read once, when the context is attached.
    fn meta(&self) -> ContextMeta;

    /// Invoke a method listed in [`ContextMeta::methods`].
    async fn call(&self, method: &str, args: Vec<Value>) -> NetronResult<Value>;

    /// Read a property listed in [`ContextMeta::properties`].
    ///
    /// `Ok(None)` means "unset"; the caller's default is returned instead.
    async fn get(&self, property: &str) -> NetronResult<Option<Value>> {
        Err(NetronError::NotFound(format!("property '{property}'")))
    }

    /// Write a writable property.
    async fn set(&self, property: &str, _value: Value) -> NetronResult<()> {
        Err(NetronError::NotAllowed(format!(
            "property '{property}' cannot be written"
        )))
    }

    /// Invoke a method declared with [`ContextMeta::factory`].
    ///
    /// Each returned context is registered as a child of this one and handed
    /// to the caller. Children go away with their parent, with the peer they
    /// were handed to, or through `Netron::release_context`.
    async fn open(&self, method: &str, _args: Vec<Value>) -> NetronResult<Vec<Arc<dyn Context>>> {
        Err(NetronError::NotFound(format!(
            "method '{method}' does not hand out contexts"
        )))
    }
}

/// Turn a wire argument value into a positional argument list.
pub(crate) fn args_to_vec(args: Value) -> Vec<Value> {
    match args {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}
