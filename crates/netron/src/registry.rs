//! Context registry: every stub this node can dispatch to.
//!
//! Ids are issued from a monotonic counter and never reused. Named entries
//! are the node's published contexts (local ones and ones hosted for peers);
//! anonymous entries are local stubs pushed onto a super node, reachable only
//! by id.
//!
//! Child entries are contexts handed out by a factory method. Each records
//! its parent and the peer it was handed to; removing an entry removes every
//! entry handed out beneath it.

use crate::stub::Stub;
use netron_types::{Definition, DefinitionId, NetronError, NetronResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A reference to a registry entry, by name or by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRef<'a> {
    /// Entry attached under this name.
    Name(&'a str),
    /// Entry with this definition id.
    Id(DefinitionId),
}

impl<'a> From<&'a str> for ContextRef<'a> {
    fn from(name: &'a str) -> Self {
        ContextRef::Name(name)
    }
}

impl From<DefinitionId> for ContextRef<'_> {
    fn from(id: DefinitionId) -> Self {
        ContextRef::Id(id)
    }
}

#[derive(Default)]
struct Entries {
    stubs: HashMap<DefinitionId, Arc<Stub>>,
    names: HashMap<String, DefinitionId>,
    // child -> parent
    parents: HashMap<DefinitionId, DefinitionId>,
    // child -> uid of the peer it was handed to
    holders: HashMap<DefinitionId, String>,
}

impl Entries {
    /// Remove every entry handed out beneath `root`.
    fn take_descendants(&mut self, root: DefinitionId) -> Vec<Arc<Stub>> {
        let mut removed = Vec::new();
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            let children: Vec<DefinitionId> = self
                .parents
                .iter()
                .filter(|(_, p)| **p == parent)
                .map(|(child, _)| *child)
                .collect();
            for child in children {
                self.parents.remove(&child);
                self.holders.remove(&child);
                if let Some(stub) = self.stubs.remove(&child) {
                    removed.push(stub);
                }
                frontier.push(child);
            }
        }
        removed
    }
}

/// Thread-safe registry of stubs.
pub struct Registry {
    next_id: AtomicU64,
    entries: RwLock<Entries>,
}

impl Registry {
    /// Create an empty registry. The first id issued is 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Entries::default()),
        }
    }

    fn issue_id(&self) -> DefinitionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish `stub` under `name`. Fails with `Exists` if the name is taken.
    pub fn attach(&self, name: &str, mut stub: Stub) -> NetronResult<DefinitionId> {
        if name.is_empty() {
            return Err(NetronError::InvalidArgument(
                "context name must not be empty".to_string(),
            ));
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.names.contains_key(name) {
            return Err(NetronError::Exists(format!("context '{name}'")));
        }
        let id = self.issue_id();
        stub.bind(id, name);
        entries.names.insert(name.to_string(), id);
        entries.stubs.insert(id, Arc::new(stub));
        Ok(id)
    }

    /// Insert `stub` without publishing a name.
    pub fn register(&self, mut stub: Stub) -> DefinitionId {
        let id = self.issue_id();
        let name = stub.name().to_string();
        stub.bind(id, &name);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .stubs
            .insert(id, Arc::new(stub));
        id
    }

    /// Insert `stub` as a child of `parent`, handed to peer `holder`.
    /// Fails with `NotFound` if `parent` is gone.
    pub fn register_child(
        &self,
        mut stub: Stub,
        parent: DefinitionId,
        holder: &str,
    ) -> NetronResult<DefinitionId> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !entries.stubs.contains_key(&parent) {
            return Err(NetronError::NotFound(format!("definition {parent}")));
        }
        let id = self.issue_id();
        let name = stub.name().to_string();
        stub.bind(id, &name);
        stub.set_parent(parent);
        entries.parents.insert(id, parent);
        entries.holders.insert(id, holder.to_string());
        entries.stubs.insert(id, Arc::new(stub));
        Ok(id)
    }

    /// Remove an entry by name or id, along with everything handed out
    /// beneath it. Fails with `NotFound` if there is none.
    pub fn detach<'a>(&self, target: impl Into<ContextRef<'a>>) -> NetronResult<Arc<Stub>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let id = match target.into() {
            ContextRef::Name(name) => entries
                .names
                .get(name)
                .copied()
                .ok_or_else(|| NetronError::NotFound(format!("context '{name}'")))?,
            ContextRef::Id(id) => id,
        };
        let stub = entries
            .stubs
            .remove(&id)
            .ok_or_else(|| NetronError::NotFound(format!("definition {id}")))?;
        if entries.names.get(stub.name()) == Some(&id) {
            entries.names.remove(stub.name());
        }
        entries.parents.remove(&id);
        entries.holders.remove(&id);
        entries.take_descendants(id);
        Ok(stub)
    }

    /// Remove any entry by id, named or not.
    pub fn remove(&self, id: DefinitionId) -> Option<Arc<Stub>> {
        self.detach(id).ok()
    }

    /// Entry by id.
    pub fn lookup(&self, id: DefinitionId) -> Option<Arc<Stub>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.stubs.get(&id).cloned()
    }

    /// Published entry by name.
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Stub>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .names
            .get(name)
            .and_then(|id| entries.stubs.get(id))
            .cloned()
    }

    /// Parent of a child entry.
    pub fn parent_of(&self, id: DefinitionId) -> Option<DefinitionId> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.parents.get(&id).copied()
    }

    /// Uid of the peer a child entry was handed to.
    pub fn holder_of(&self, id: DefinitionId) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.holders.get(&id).cloned()
    }

    /// Child entries handed to `uid`, ordered by id.
    pub fn held_by(&self, uid: &str) -> Vec<DefinitionId> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<DefinitionId> = entries
            .holders
            .iter()
            .filter(|(_, holder)| holder.as_str() == uid)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Whether `id` is published under a name.
    pub fn is_published(&self, id: DefinitionId) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .stubs
            .get(&id)
            .is_some_and(|stub| entries.names.get(stub.name()) == Some(&id))
    }

    /// Published names, sorted.
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = entries.names.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions of all published entries, ordered by id.
    pub fn published_definitions(&self) -> Vec<Definition> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut defs: Vec<Definition> = entries
            .names
            .values()
            .filter_map(|id| entries.stubs.get(id))
            .map(|stub| stub.definition().clone())
            .collect();
        defs.sort_by_key(|d| d.id);
        defs
    }

    /// Number of entries, named or not.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .stubs
            .len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use async_trait::async_trait;
    use netron_types::{ContextMeta, ErrorKind};
    use serde_json::Value;

    struct Nop;

    #[async_trait]
    impl Context for Nop {
        fn meta(&self) -> ContextMeta {
            ContextMeta::new("Nop").method("noop", &[])
        }

        async fn call(&self, _method: &str, _args: Vec<Value>) -> NetronResult<Value> {
            Ok(Value::Null)
        }
    }

    fn stub(name: &str) -> Stub {
        Stub::local(name, Arc::new(Nop))
    }

    #[test]
    fn test_attach_assigns_fresh_ids() {
        let registry = Registry::new();
        let a = registry.attach("a", stub("a")).unwrap();
        let b = registry.attach("b", stub("b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.lookup(a).unwrap().name(), "a");
        assert_eq!(registry.lookup_by_name("b").unwrap().id(), b);
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_name_is_exists() {
        let registry = Registry::new();
        registry.attach("calc", stub("calc")).unwrap();
        let err = registry.attach("calc", stub("calc")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exists);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_never_reused() {
        let registry = Registry::new();
        let first = registry.attach("calc", stub("calc")).unwrap();
        registry.detach("calc").unwrap();
        let second = registry.attach("calc", stub("calc")).unwrap();
        assert!(second > first);
        assert!(registry.lookup(first).is_none());
    }

    #[test]
    fn test_detach_by_name_or_id() {
        let registry = Registry::new();
        let id = registry.attach("calc", stub("calc")).unwrap();
        registry.attach("other", stub("other")).unwrap();

        assert_eq!(registry.detach(id).unwrap().name(), "calc");
        assert!(registry.lookup_by_name("calc").is_none());

        let err = registry.detach("calc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = registry.detach(999u64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(registry.detach("other").is_ok());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_anonymous_entries() {
        let registry = Registry::new();
        let published = registry.attach("svc", stub("svc")).unwrap();
        let anon = registry.register(stub("svc"));

        assert!(registry.is_published(published));
        assert!(!registry.is_published(anon));
        assert_eq!(registry.names(), vec!["svc"]);
        assert_eq!(registry.published_definitions().len(), 1);

        // Removing the anonymous twin leaves the published one alone.
        assert!(registry.remove(anon).is_some());
        assert_eq!(registry.lookup_by_name("svc").unwrap().id(), published);
        assert!(registry.remove(anon).is_none());
    }

    #[test]
    fn test_concurrent_attach_detach() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 50;

        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    let shared = registry.attach("shared", stub("shared")).is_ok();
                    for i in 0..PER_THREAD {
                        let name = format!("t{t}-{i}");
                        let id = registry.attach(&name, stub(&name)).unwrap();
                        ids.push(id);
                        if i % 2 == 0 {
                            assert_eq!(registry.detach(name.as_str()).unwrap().id(), id);
                        }
                    }
                    (ids, shared)
                })
            })
            .collect();

        let mut all = Vec::new();
        let mut shared_wins = 0;
        for handle in handles {
            let (ids, shared) = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not increasing: {ids:?}");
            all.extend(ids);
            shared_wins += usize::from(shared);
        }
        assert_eq!(shared_wins, 1);

        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "an id was issued twice");

        let survivors = THREADS * PER_THREAD / 2 + 1;
        assert_eq!(registry.len(), survivors);
        assert_eq!(registry.names().len(), survivors);
        for name in registry.names() {
            let stub = registry.lookup_by_name(&name).unwrap();
            assert_eq!(stub.name(), name);
            assert!(registry.is_published(stub.id()));
        }
    }

    #[test]
    fn test_children_follow_their_parent() {
        let registry = Registry::new();
        let root = registry.attach("store", stub("store")).unwrap();
        let doc = registry.register_child(stub("Doc"), root, "b").unwrap();
        let page = registry.register_child(stub("Page"), doc, "b").unwrap();
        let other = registry.register_child(stub("Doc"), root, "c").unwrap();

        assert_eq!(registry.parent_of(page), Some(doc));
        assert_eq!(registry.lookup(page).unwrap().definition().parent_id, Some(doc));
        assert_eq!(registry.holder_of(doc).as_deref(), Some("b"));
        assert_eq!(registry.held_by("b"), vec![doc, page]);
        assert!(!registry.is_published(doc));
        assert_eq!(registry.names(), vec!["store"]);

        // Releasing a child takes its own children with it.
        registry.remove(doc).unwrap();
        assert!(registry.lookup(page).is_none());
        assert!(registry.held_by("b").is_empty());
        assert!(registry.lookup(other).is_some());

        // Detaching the root releases whatever is left.
        registry.detach("store").unwrap();
        assert!(registry.lookup(other).is_none());
        assert!(registry.held_by("c").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_child_of_missing_parent() {
        let registry = Registry::new();
        let err = registry.register_child(stub("Doc"), 42, "b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(registry.is_empty());
    }
}
