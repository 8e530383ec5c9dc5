use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of the process that first observed a message.
///
/// Assigned once at startup and compared on every routing decision, so it is
/// cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Builds `"<unix-nanos>-<pid>"` for the current process.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        Self::from(format!("{nanos}-{}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a routed message entered the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// First observed by the named node, either locally or on the shared channel.
    Node(NodeId),
    /// Delivered by a per-identity backplane channel. Never re-published.
    IdentityChannel,
}

impl Origin {
    pub fn is_node(&self, node: &NodeId) -> bool {
        matches!(self, Origin::Node(origin) if origin == node)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Node(node) => node.fmt(f),
            Origin::IdentityChannel => f.write_str("identity-channel"),
        }
    }
}

/// A payload scoped to a group, an identity, or both.
///
/// An empty `group` or `identity` means that scope is not targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub group: String,
    pub identity: String,
    pub payload: Bytes,
    pub origin: Origin,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
}

/// Cross-node wire record, one JSON object per pub/sub message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(default)]
    pub group: String,
    #[serde(default, alias = "user_id")]
    pub identity: String,
    /// Base64 of the raw payload bytes.
    pub payload: String,
    #[serde(alias = "source")]
    pub origin: String,
}

impl Envelope {
    pub fn new(group: &str, identity: &str, payload: &[u8], origin: &NodeId) -> Self {
        Self {
            group: group.to_string(),
            identity: identity.to_string(),
            payload: STANDARD.encode(payload),
            origin: origin.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn payload_bytes(&self) -> Result<Bytes, EnvelopeError> {
        Ok(Bytes::from(STANDARD.decode(&self.payload)?))
    }

    pub fn is_from(&self, node: &NodeId) -> bool {
        self.origin == node.as_str()
    }

    /// Converts a shared-channel envelope into a message tagged with its remote origin.
    pub fn into_routed(self) -> Result<RoutedMessage, EnvelopeError> {
        let payload = self.payload_bytes()?;
        Ok(RoutedMessage {
            group: self.group,
            identity: self.identity,
            payload,
            origin: Origin::Node(NodeId::from(self.origin)),
        })
    }
}
