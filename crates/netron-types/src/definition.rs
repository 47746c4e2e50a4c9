//! Context metadata and definitions.
//!
//! A [`ContextMeta`] describes the callable surface of a context: its methods
//! and properties. A [`Definition`] is that metadata bound to a registry id and
//! the name the context was attached under. Definitions are transmitted
//! verbatim to peers allowed to see them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Registry-assigned definition id, unique within one node.
pub type DefinitionId = u64;

/// Description of one callable method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodMeta {
    /// Names of the positional arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The method hands out contexts instead of returning data.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub returns_contexts: bool,
}

/// Description of one property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyMeta {
    /// Whether remote peers may only read it.
    #[serde(default)]
    pub readonly: bool,
    /// Optional type hint ("string", "number", ...).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
}

/// The callable surface of a context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMeta {
    /// Type name of the context (e.g. "Calculator").
    pub type_name: String,
    /// Optional human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Methods by name.
    #[serde(default)]
    pub methods: BTreeMap<String, MethodMeta>,
    /// Properties by name.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyMeta>,
}

impl ContextMeta {
    /// Start describing a context type.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add a method with the given argument names.
    pub fn method(mut self, name: impl Into<String>, args: &[&str]) -> Self {
        self.methods.insert(
            name.into(),
            MethodMeta {
                args: args.iter().map(|a| a.to_string()).collect(),
                ..Default::default()
            },
        );
        self
    }

    /// Add a method that hands out contexts. Callers receive one new remote
    /// object per returned context.
    pub fn factory(mut self, name: impl Into<String>, args: &[&str]) -> Self {
        self.methods.insert(
            name.into(),
            MethodMeta {
                args: args.iter().map(|a| a.to_string()).collect(),
                returns_contexts: true,
                ..Default::default()
            },
        );
        self
    }

    /// Add a writable property.
    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.insert(name.into(), PropertyMeta::default());
        self
    }

    /// Add a read-only property.
    pub fn readonly_property(mut self, name: impl Into<String>) -> Self {
        self.properties.insert(
            name.into(),
            PropertyMeta {
                readonly: true,
                type_hint: None,
            },
        );
        self
    }

    /// Whether `name` is a method.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Whether `name` is a method declared with [`ContextMeta::factory`].
    pub fn returns_contexts(&self, name: &str) -> bool {
        self.methods.get(name).is_some_and(|m| m.returns_contexts)
    }

    /// Property metadata by name.
    pub fn get_property(&self, name: &str) -> Option<&PropertyMeta> {
        self.properties.get(name)
    }
}

/// A context description bound to a registry id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Registry id on the node that issued this definition.
    pub id: DefinitionId,
    /// Name the context was attached under.
    pub name: String,
    /// Callable surface.
    pub meta: ContextMeta,
    /// Uid of the node owning the instance, when relayed through a super node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Definition whose factory method handed this context out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<DefinitionId>,
}

impl Definition {
    /// Bind metadata to an id and name.
    pub fn new(id: DefinitionId, name: impl Into<String>, meta: ContextMeta) -> Self {
        Self {
            id,
            name: name.into(),
            meta,
            owner: None,
            parent_id: None,
        }
    }
}
