//! Netron runtime.
//!
//! A node publishes named contexts, accepts peers on gates, dials other
//! nodes, and lets each side invoke the other's contexts over a framed packet
//! protocol. Super nodes additionally host contexts pushed by their peers and
//! relay invocations back to the owners.
//!
//! ```no_run
//! # async fn demo() -> netron::NetronResult<()> {
//! use netron::{GateConfig, Netron, NetronConfig};
//!
//! let node = Netron::new(NetronConfig::default());
//! let gate = node.bind(GateConfig::address("127.0.0.1:0")).await?;
//! let peer = node.connect(gate.local_addr.as_str()).await;
//! # let _ = peer;
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod config;
pub mod context;
mod dispatch;
pub mod events;
pub mod gate;
pub mod hooks;
pub mod interface;
pub mod node;
pub mod peer;
pub mod registry;
pub mod retry;
pub mod stub;

pub use acl::IpPolicy;
pub use context::Context;
pub use events::NetronEvent;
pub use gate::GateInfo;
pub use hooks::{DefaultHooks, NetronHooks};
pub use interface::Interface;
pub use node::{ConnectOptions, Netron};
pub use peer::{Peer, PeerDirection};
pub use registry::{ContextRef, Registry};
pub use retry::RetryPolicy;
pub use stub::Stub;

pub use netron_types::config::{GateConfig, IpPolicyKind, NetronConfig};
pub use netron_types::{
    ContextMeta, Definition, DefinitionId, ErrorKind, NetronError, NetronResult, PeerStatus,
};
