//! Envelope model for MEW spaces
//!
//! Every message that crosses a space is a JSON envelope with a small set of
//! header fields and a kind-specific payload. The gateway stamps the header
//! fields it owns (`protocol`, `id`, `ts`, `from`) before fan-out; payload
//! shape is opaque except where a reserved kind requires specific fields.
//!
//! Envelopes preserve unknown top-level fields for forward compatibility.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Protocol version stamped on (and compared against) every envelope.
pub const PROTOCOL_VERSION: &str = "mew/v0.4";

/// Sender id used for gateway-originated envelopes (errors, welcome,
/// presence, acks).
pub const GATEWAY_ID: &str = "system:gateway";

/// Reserved envelope kinds interpreted by the gateway. All other kinds pass
/// through untouched.
pub mod kinds {
    pub const SYSTEM_JOIN: &str = "system/join";
    pub const SYSTEM_WELCOME: &str = "system/welcome";
    pub const SYSTEM_PRESENCE: &str = "system/presence";
    pub const SYSTEM_REGISTER: &str = "system/register";
    pub const SYSTEM_ERROR: &str = "system/error";
    pub const SYSTEM_HEARTBEAT: &str = "system/heartbeat";
    pub const CAPABILITY_GRANT: &str = "capability/grant";
    pub const CAPABILITY_REVOKE: &str = "capability/revoke";
    pub const CAPABILITY_GRANT_ACK: &str = "capability/grant-ack";
    pub const STREAM_REQUEST: &str = "stream/request";
    pub const STREAM_OPEN: &str = "stream/open";
    pub const STREAM_CLOSE: &str = "stream/close";
    pub const MCP_RESPONSE: &str = "mcp/response";
    pub const MCP_REQUEST: &str = "mcp/request";
    pub const CHAT: &str = "chat";
}

/// Error codes surfaced to participants in `payload.code` / `payload.error`.
pub mod error_codes {
    /// Bad framing, missing required field, wrong protocol version.
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    /// Unexpected failure while handling an envelope.
    pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";
    /// Kind not authorized for the sender.
    pub const CAPABILITY_VIOLATION: &str = "capability_violation";
    /// Semantic failure for a specific kind.
    pub const INVALID_REQUEST: &str = "invalid_request";
}

/// A single MEW envelope.
///
/// Header fields are optional on the wire because clients may omit them;
/// the gateway fills them in before fan-out. After stamping, `protocol`,
/// `id`, `ts`, `from` and `kind` are always present in every delivered copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version tag, e.g. `"mew/v0.4"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Envelope id, unique within a space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// ISO-8601 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,

    /// Authenticated sender id. Never trusted from the client; the gateway
    /// overwrites it with the id bound to the originating channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Addressing hint. Does NOT restrict fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<String>>,

    /// Hierarchical operation name, e.g. `mcp/request`.
    pub kind: String,

    /// Ids of envelopes this one correlates to. A scalar on the wire is
    /// normalized to a one-element sequence.
    #[serde(
        default,
        deserialize_with = "deserialize_correlation_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<Vec<String>>,

    /// Sub-conversation grouping under a parent envelope id. Forwarded
    /// verbatim, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Kind-specific payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,

    /// Unknown fields for forward compatibility
    #[serde(flatten)]
    pub unknown_fields: HashMap<String, Value>,
}

impl Envelope {
    /// Create a bare envelope with the given kind and payload. Header fields
    /// stay empty until stamped.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            protocol: None,
            id: None,
            ts: None,
            from: None,
            to: None,
            kind: kind.into(),
            correlation_id: None,
            context: None,
            payload,
            unknown_fields: HashMap::new(),
        }
    }

    /// Create a fully stamped gateway-originated envelope (welcome, presence,
    /// error, ack). Sender is [`GATEWAY_ID`], id and ts are freshly minted.
    pub fn from_gateway(kind: impl Into<String>, payload: Value) -> Self {
        let mut envelope = Self::new(kind, payload);
        envelope.protocol = Some(PROTOCOL_VERSION.to_string());
        envelope.id = Some(mint_id());
        envelope.ts = Some(now_ts());
        envelope.from = Some(GATEWAY_ID.to_string());
        envelope
    }

    /// Set the correlation ids, builder-style.
    pub fn correlated_to(mut self, ids: Vec<String>) -> Self {
        self.correlation_id = Some(ids);
        self
    }

    /// Set the addressing hint, builder-style.
    pub fn addressed_to(mut self, recipients: Vec<String>) -> Self {
        self.to = Some(recipients);
        self
    }

    /// Parse a JSON text frame into an envelope. The top level must be a
    /// JSON object with at least a string `kind`.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Mint an id if the envelope does not carry one, returning the id the
    /// envelope ends up with.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.as_deref().is_none_or(str::is_empty) {
            self.id = Some(mint_id());
        }
        self.id.as_deref().expect("id was just set")
    }

    /// Mint a timestamp if the envelope does not carry one.
    pub fn ensure_ts(&mut self) {
        if self.ts.as_deref().is_none_or(str::is_empty) {
            self.ts = Some(now_ts());
        }
    }

    /// Stamp the gateway-owned header fields before fan-out: fill `protocol`
    /// when missing, mint `id`/`ts` when missing, and overwrite `from` with
    /// the authenticated sender id.
    pub fn stamp(&mut self, sender_id: &str) {
        if self.protocol.as_deref().is_none_or(str::is_empty) {
            self.protocol = Some(PROTOCOL_VERSION.to_string());
        }
        self.ensure_id();
        self.ensure_ts();
        self.from = Some(sender_id.to_string());
    }

    /// Serialize to the canonical single-line wire form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Mint a fresh envelope id.
pub fn mint_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current UTC time in RFC 3339 with millisecond precision.
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Accept `correlation_id` as a scalar or a sequence; normalize to a
/// sequence. Non-string scalars are rendered as their JSON text.
fn deserialize_correlation_id<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(vec![s])),
        Some(Value::Array(items)) => {
            let mut ids = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => ids.push(s),
                    other => ids.push(other.to_string()),
                }
            }
            Ok(Some(ids))
        }
        Some(other) => Ok(Some(vec![other.to_string()])),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
