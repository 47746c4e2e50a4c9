//! Core types for the Netron peer-to-peer context runtime.
//!
//! This crate defines the data structures shared by the wire layer, the
//! runtime core and the CLI. It contains no business logic.

pub mod config;
pub mod definition;
pub mod error;
pub mod status;

pub use definition::{ContextMeta, Definition, DefinitionId, MethodMeta, PropertyMeta};
pub use error::{ErrorKind, NetronError, NetronResult, RemoteError};
pub use status::PeerStatus;
