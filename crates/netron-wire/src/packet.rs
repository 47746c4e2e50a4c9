//! Packet envelope and action payloads.
//!
//! Every exchange between two nodes is a [`Packet`]. Requests carry the
//! `IMPULSE` flag; the reply reuses the request's `stream_id` with the flag
//! cleared, which is how a reply finds its awaiter.

use netron_types::{Definition, DefinitionId, PeerStatus, RemoteError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Packet flag bit set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Set on requests, cleared on replies.
    pub const IMPULSE: u8 = 0b0000_0001;
    /// Set on negative replies; `data` is a [`RemoteError`].
    pub const ERROR: u8 = 0b0000_0010;

    /// Flags from raw bits.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether `bit` is set.
    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit == bit
    }
}

/// Protocol actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Identity exchange.
    Handshake,
    /// Context availability announcement or push onto a super node.
    ContextAttach,
    /// Context retraction.
    ContextDetach,
    /// Liveness check.
    Ping,
    /// Property read or method call with a result.
    Get,
    /// Property write or method call without a result.
    Set,
    /// Any action this node does not know. Dropped on receipt.
    #[serde(other)]
    Unknown,
}

impl Action {
    /// Whether this action is an application-level invocation.
    pub fn is_application(self) -> bool {
        matches!(self, Action::Get | Action::Set)
    }
}

/// A wire protocol packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Flag bits (`IMPULSE`, `ERROR`).
    pub flags: PacketFlags,
    /// What this packet asks for or answers.
    pub action: Action,
    /// Sender's view of the peer status at send time.
    pub status: PeerStatus,
    /// Correlation id shared by a request and its reply.
    pub stream_id: u64,
    /// Action-specific payload.
    #[serde(default)]
    pub data: Value,
}

impl Packet {
    /// Build a request (impulse) packet.
    pub fn request(action: Action, status: PeerStatus, stream_id: u64, data: Value) -> Self {
        Self {
            flags: PacketFlags::from_bits(PacketFlags::IMPULSE),
            action,
            status,
            stream_id,
            data,
        }
    }

    /// Build the positive reply to this request.
    pub fn reply(&self, status: PeerStatus, data: Value) -> Self {
        Self {
            flags: PacketFlags::default(),
            action: self.action,
            status,
            stream_id: self.stream_id,
            data,
        }
    }

    /// Build a negative reply to this request.
    pub fn error_reply(&self, status: PeerStatus, error: RemoteError) -> Self {
        Self {
            flags: PacketFlags::from_bits(PacketFlags::ERROR),
            action: self.action,
            status,
            stream_id: self.stream_id,
            data: serde_json::to_value(error).unwrap_or(Value::Null),
        }
    }

    /// Whether this is a request.
    pub fn is_impulse(&self) -> bool {
        self.flags.contains(PacketFlags::IMPULSE)
    }

    /// Whether this is a negative reply.
    pub fn is_error(&self) -> bool {
        self.flags.contains(PacketFlags::ERROR)
    }

    /// Deserialize the payload into `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Split a reply into its value or the remote failure it carries.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        if self.is_error() {
            let err = serde_json::from_value::<RemoteError>(self.data).unwrap_or_else(|e| {
                RemoteError {
                    kind: netron_types::ErrorKind::NotValid,
                    message: format!("malformed error reply: {e}"),
                }
            });
            Err(err)
        } else {
            Ok(self.data)
        }
    }
}

/// Handshake payload, sent by the dialing side and echoed back by the
/// accepting side with its own identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Sender's unique node id.
    pub uid: String,
    /// Whether the sender hosts contexts pushed by its peers.
    #[serde(default)]
    pub is_super: bool,
    /// Protocol version.
    pub protocol_version: u32,
    /// Contexts the sender advertises over this link.
    #[serde(default)]
    pub definitions: Vec<Definition>,
    /// Random nonce for HMAC authentication.
    #[serde(default)]
    pub nonce: String,
    /// HMAC-SHA256(shared_secret, nonce + uid).
    #[serde(default)]
    pub auth_hmac: String,
    /// Application data supplied by the `on_send_handshake` hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
}

/// What a context attach/detach request means to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachScope {
    /// The sender's own context became (un)available.
    Announce,
    /// The sender asks the receiver to host (or stop hosting) its context.
    Host,
    /// The sender stopped hosting a context the receiver pushed onto it.
    /// Only meaningful for detach.
    Revoke,
}

/// `ContextAttach` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextAttachRequest {
    /// Meaning of the request.
    pub scope: AttachScope,
    /// Context name.
    pub name: String,
    /// Definition as issued by the sender.
    pub definition: Definition,
}

/// Positive reply to a `Host` attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextAttachReply {
    /// Id assigned in the receiver's registry.
    pub def_id: DefinitionId,
}

/// `ContextDetach` request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDetachRequest {
    /// Meaning of the request.
    pub scope: AttachScope,
    /// Context name.
    pub name: String,
}

/// `Get` / `Set` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Target definition id in the receiver's registry.
    pub def_id: DefinitionId,
    /// Method or property name.
    pub name: String,
    /// Method arguments (array), property value, or the default for a get.
    #[serde(default)]
    pub args: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use netron_types::{ContextMeta, ErrorKind};
    use serde_json::json;

    #[test]
    fn test_request_reply_flags() {
        let req = Packet::request(Action::Ping, PeerStatus::Online, 9, Value::Null);
        assert!(req.is_impulse());
        assert!(!req.is_error());

        let reply = req.reply(PeerStatus::Online, json!(1));
        assert!(!reply.is_impulse());
        assert_eq!(reply.stream_id, 9);
        assert_eq!(reply.action, Action::Ping);
        assert_eq!(reply.into_result().unwrap(), json!(1));
    }

    #[test]
    fn test_error_reply_carries_kind() {
        let req = Packet::request(Action::Get, PeerStatus::Online, 3, Value::Null);
        let reply = req.error_reply(
            PeerStatus::Online,
            RemoteError {
                kind: ErrorKind::NotFound,
                message: "no such definition".to_string(),
            },
        );
        assert!(reply.is_error());
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_malformed_error_reply() {
        let mut reply = Packet::request(Action::Get, PeerStatus::Online, 3, json!("oops"))
            .reply(PeerStatus::Online, json!("oops"));
        reply.flags = PacketFlags::from_bits(PacketFlags::ERROR);
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotValid);
    }

    #[test]
    fn test_handshake_payload() {
        let hs = Handshake {
            uid: "node-a".to_string(),
            is_super: true,
            protocol_version: PROTOCOL_VERSION,
            definitions: vec![Definition::new(1, "calc", ContextMeta::new("Calculator"))],
            nonce: String::new(),
            auth_hmac: String::new(),
            auth: Some(json!({"secret": "s3"})),
        };
        let packet = Packet::request(
            Action::Handshake,
            PeerStatus::Handshaking,
            1,
            serde_json::to_value(&hs).unwrap(),
        );
        let json = serde_json::to_string(&packet).unwrap();
        assert!(json.contains("\"handshake\""));
        assert!(json.contains("\"handshaking\""));

        let decoded: Packet = serde_json::from_str(&json).unwrap();
        let back: Handshake = decoded.payload().unwrap();
        assert_eq!(back, hs);
    }

    #[test]
    fn test_handshake_defaults_optional_fields() {
        let hs: Handshake =
            serde_json::from_value(json!({"uid": "x", "protocol_version": 1})).unwrap();
        assert!(!hs.is_super);
        assert!(hs.definitions.is_empty());
        assert!(hs.auth.is_none());
    }

    #[test]
    fn test_attach_scope_names() {
        let req = ContextDetachRequest {
            scope: AttachScope::Host,
            name: "calc".to_string(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["scope"], "host");
    }

    #[test]
    fn test_unknown_action_decodes() {
        let packet: Packet = serde_json::from_value(json!({
            "flags": 1,
            "action": "bogus",
            "status": "online",
            "stream_id": 2
        }))
        .unwrap();
        assert_eq!(packet.action, Action::Unknown);
        assert!(packet.is_impulse());
        assert!(!packet.action.is_application());
    }
}
