//! Configuration types for a Netron node.
//!
//! Every section derives `Default` and uses `#[serde(default)]`, so a partial
//! `config.toml` is always valid.

use serde::{Deserialize, Serialize};

/// Default listening port for gates bound without an explicit port.
pub const DEFAULT_PORT: u16 = 8888;

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetronConfig {
    /// This node's globally unique identity.
    pub uid: String,
    /// Whether this node hosts contexts pushed by its peers.
    pub is_super: bool,
    /// Port used when a gate address omits one.
    pub default_port: u16,
    /// Reply timeout in milliseconds. `0` disables the timeout.
    pub response_timeout_ms: u64,
    /// Pre-shared key for HMAC handshake authentication. Empty disables it.
    pub shared_secret: String,
    /// Largest accepted frame, in bytes.
    pub max_frame_size: u32,
    /// Retry policy for outbound dials.
    pub connect: ConnectConfig,
    /// Gates bound at startup.
    pub gates: Vec<GateConfig>,
    /// Logging settings (consumed by the binary).
    pub log: LogConfig,
}

impl Default for NetronConfig {
    fn default() -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            is_super: false,
            default_port: DEFAULT_PORT,
            response_timeout_ms: 0,
            shared_secret: String::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect: ConnectConfig::default(),
            gates: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

/// Retry policy applied to self-initiated connections only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Maximum dial attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on the backoff delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 300,
            max_delay_ms: 3000,
            jitter: 0.0,
        }
    }
}

/// IP access policy of a gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpPolicyKind {
    /// Accept every address.
    #[default]
    None,
    /// Accept only listed addresses.
    Allow,
    /// Accept every address except the listed ones.
    Deny,
}

/// A gate (bound listener) declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Explicit gate id. Derived from the adapter or address when absent.
    pub id: Option<String>,
    /// Address to bind (`host:port`, `host` or `:port`).
    pub address: Option<String>,
    /// Name of an adapter registered with `attach_adapter`.
    pub adapter: Option<String>,
    /// Access policy.
    pub ip_policy: IpPolicyKind,
    /// Addresses or CIDR subnets the policy matches against.
    pub ip_list: Vec<String>,
    /// Contexts advertised over this gate. `None` advertises all.
    pub allowed_contexts: Option<Vec<String>>,
}

impl GateConfig {
    /// Gate on a plain address with no access restrictions.
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    /// Gate backed by a named adapter.
    pub fn adapter(adapter: impl Into<String>) -> Self {
        Self {
            adapter: Some(adapter.into()),
            ..Default::default()
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
