//! Capability patterns and the matcher that authorizes envelope emission
//!
//! A capability pattern matches a (kind, payload) pair. The kind part is an
//! exact string, a `prefix/*` glob, or the match-all `*`. The optional
//! payload part is a recursive structural pattern whose string leaves
//! support `"prefix*"` wildcards and `"!value"` negation.
//!
//! Matching is existential over a participant's capability set: any single
//! matching pattern authorizes the send. Patterns are compared and deduped
//! by their canonical JSON form (keys sorted recursively), which is also
//! how `capability/revoke` matches patterns for removal.

use crate::envelope::{Envelope, kinds};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A matcher over (kind, payload) that authorizes emission of envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityPattern {
    /// Exact kind, `prefix/*` glob, or `*` for match-all.
    pub kind: String,

    /// Recursive payload pattern. Absent means "any payload".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl CapabilityPattern {
    /// Pattern matching a kind with any payload.
    pub fn kind_only(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
        }
    }

    /// Evaluate this pattern against a concrete kind and payload.
    pub fn matches(&self, kind: &str, payload: &Value) -> bool {
        if !kind_matches(&self.kind, kind) {
            return false;
        }
        match &self.payload {
            None => true,
            Some(pattern) => value_matches(pattern, payload),
        }
    }

    /// Evaluate this pattern against an envelope.
    pub fn matches_envelope(&self, envelope: &Envelope) -> bool {
        self.matches(&envelope.kind, &envelope.payload)
    }

    /// Canonical JSON form: recursively key-sorted, compact. Two patterns
    /// are the same capability iff their canonical forms are equal.
    pub fn canonical(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        canonical_json(&value)
    }
}

/// Kind glob evaluation: `*` matches everything; `prefix/*` matches the
/// prefix itself and anything below it; otherwise exact equality.
fn kind_matches(pattern: &str, kind: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return kind == prefix || kind.starts_with(&format!("{prefix}/"));
    }
    pattern == kind
}

/// Recursive payload pattern evaluation.
///
/// Object patterns require every key to be present and matching in the
/// actual value. String leaves support `!value` negation and `prefix*`
/// wildcards. Any other scalar compares by equality.
fn value_matches(pattern: &Value, actual: &Value) -> bool {
    match pattern {
        Value::Object(fields) => {
            let Value::Object(actual_fields) = actual else {
                return false;
            };
            fields.iter().all(|(key, sub_pattern)| {
                actual_fields
                    .get(key)
                    .is_some_and(|actual_value| value_matches(sub_pattern, actual_value))
            })
        }
        Value::String(s) => string_leaf_matches(s, actual),
        other => other == actual,
    }
}

fn string_leaf_matches(pattern: &str, actual: &Value) -> bool {
    if let Some(negated) = pattern.strip_prefix('!') {
        // Matches anything except the negated value.
        return actual.as_str() != Some(negated);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return actual
            .as_str()
            .is_some_and(|s| s.starts_with(prefix));
    }
    actual.as_str() == Some(pattern)
}

/// Render a JSON value with all object keys sorted recursively, compact.
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(fields) => {
                let mut keys: Vec<&String> = fields.keys().collect();
                keys.sort();
                let mut sorted = serde_json::Map::new();
                for key in keys {
                    sorted.insert(key.clone(), sort(&fields[key]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// Order-preserving dedup by canonical form.
pub fn dedup_patterns(patterns: Vec<CapabilityPattern>) -> Vec<CapabilityPattern> {
    let mut seen = std::collections::HashSet::new();
    patterns
        .into_iter()
        .filter(|p| seen.insert(p.canonical()))
        .collect()
}

/// The implicit baseline every joined participant holds regardless of
/// configuration: registering capabilities and answering MCP requests.
pub fn baseline_patterns() -> Vec<CapabilityPattern> {
    vec![
        CapabilityPattern::kind_only(kinds::SYSTEM_REGISTER),
        CapabilityPattern::kind_only(kinds::MCP_RESPONSE),
    ]
}

/// Existential authorization check: true iff any pattern in the set matches
/// the envelope. The `system/heartbeat` bypass is the router's concern, not
/// the matcher's.
pub fn authorizes(patterns: &[CapabilityPattern], envelope: &Envelope) -> bool {
    patterns.iter().any(|p| p.matches_envelope(envelope))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
