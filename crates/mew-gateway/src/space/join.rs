//! Join handshake: first-envelope parsing and token verification
//!
//! The first frame on every channel must be a join envelope. Two wire
//! forms are accepted: the current `{"kind":"system/join", ...}` and the
//! legacy `{"type":"join", ...}`; in both, the claimed fields may sit at
//! the envelope top level or inside `payload`.
//!
//! Tokens are resolved once at startup into a [`TokenTable`]; the compare
//! at join time is constant-time.

use mew_core::envelope::kinds;
use serde_json::Value;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

/// The claims extracted from a join envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    /// Claimed participant id.
    pub participant_id: String,
    /// Claimed space id, when present. Must match the gateway's space.
    pub space: Option<String>,
    /// Presented token.
    pub token: Option<String>,
    /// Id of the join envelope itself, for error correlation.
    pub envelope_id: Option<String>,
}

impl JoinRequest {
    /// Interpret a parsed JSON value as a join envelope. Returns `None`
    /// when the value is not a join at all (wrong kind/type).
    pub fn from_value(value: &Value) -> Option<Self> {
        let top = value.as_object()?;
        let is_join = top.get("kind").and_then(Value::as_str) == Some(kinds::SYSTEM_JOIN)
            || top.get("type").and_then(Value::as_str) == Some("join");
        if !is_join {
            return None;
        }

        let payload = top.get("payload").and_then(Value::as_object);
        let field = |key: &str| -> Option<String> {
            top.get(key)
                .and_then(Value::as_str)
                .or_else(|| payload.and_then(|p| p.get(key)).and_then(Value::as_str))
                .map(str::to_string)
                .filter(|s| !s.is_empty())
        };

        let participant_id = field("participantId").or_else(|| field("participant_id"))?;
        Some(Self {
            participant_id,
            space: field("space"),
            token: field("token"),
            envelope_id: top
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|s| !s.is_empty()),
        })
    }
}

/// Pre-resolved tokens for every configured participant.
#[derive(Debug, Default)]
pub struct TokenTable {
    tokens: HashMap<String, String>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, participant_id: impl Into<String>, token: impl Into<String>) {
        self.tokens.insert(participant_id.into(), token.into());
    }

    /// Constant-time token check. Unknown participants always fail.
    pub fn verify(&self, participant_id: &str, presented: &str) -> bool {
        let Some(expected) = self.tokens.get(participant_id) else {
            return false;
        };
        expected.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
