//! Space descriptor types

use crate::capability::CapabilityPattern;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Complete space descriptor loaded from `space.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Space identity and transport policy
    pub space: SpaceSection,

    /// Gateway process settings
    #[serde(default)]
    pub gateway: GatewaySection,

    /// Configured participants keyed by participant id
    #[serde(default)]
    pub participants: BTreeMap<String, ParticipantConfig>,

    /// Fallbacks applied to participants without explicit settings
    #[serde(default)]
    pub defaults: DefaultsSection,
}

impl SpaceConfig {
    /// Resolve the transport for a participant: per-participant setting,
    /// then the space-level override map, then the space default.
    pub fn transport_for(&self, participant_id: &str) -> TransportKind {
        if let Some(participant) = self.participants.get(participant_id)
            && let Some(transport) = participant.transport
        {
            return transport;
        }
        if let Some(transport) = self.space.transport.overrides.get(participant_id) {
            return *transport;
        }
        self.space.transport.default
    }

    /// Resolve the configured capability patterns for a participant,
    /// falling back to `defaults.capabilities`.
    pub fn capabilities_for(&self, participant_id: &str) -> Vec<CapabilityPattern> {
        if let Some(participant) = self.participants.get(participant_id)
            && let Some(capabilities) = &participant.capabilities
        {
            return capabilities.clone();
        }
        self.defaults.capabilities.clone()
    }
}

/// The `space:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceSection {
    /// Space id; required, non-empty.
    pub id: String,

    /// Transport selection policy
    #[serde(default)]
    pub transport: TransportSection,
}

/// The `space.transport:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSection {
    /// Transport used by participants without an override
    #[serde(default)]
    pub default: TransportKind,

    /// Per-participant transport overrides
    #[serde(default)]
    pub overrides: BTreeMap<String, TransportKind>,
}

/// Transport kinds the gateway can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Paired FIFOs with `Content-Length` framing
    Stdio,
    /// WebSocket connection to the gateway listener
    Websocket,
}

impl Default for TransportKind {
    fn default() -> Self {
        Self::Stdio
    }
}

/// The `gateway:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySection {
    /// WebSocket listener settings
    #[serde(default)]
    pub websocket: WebsocketSection,
}

/// The `gateway.websocket:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketSection {
    /// Listen address, `host:port` or bare port.
    #[serde(default)]
    pub listen: ListenAddr,
}

impl Default for WebsocketSection {
    fn default() -> Self {
        Self {
            listen: ListenAddr::default(),
        }
    }
}

/// A listen address. Accepts `"host:port"`, `"port"`, or a bare YAML
/// integer; a bare port binds the loopback interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl Default for ListenAddr {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4700,
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ListenAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("listen address cannot be empty".to_string());
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in listen address {s:?}"))?;
                let host = if host.is_empty() { "127.0.0.1" } else { host };
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None => {
                let port = s
                    .parse::<u16>()
                    .map_err(|_| format!("invalid listen address {s:?}"))?;
                Ok(Self {
                    host: "127.0.0.1".to_string(),
                    port,
                })
            }
        }
    }
}

impl Serialize for ListenAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ListenAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Port(u16),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Port(port) => Ok(Self {
                host: "127.0.0.1".to_string(),
                port,
            }),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A `participants.<pid>:` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantConfig {
    /// Transport override for this participant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,

    /// Static tokens accepted at join (first entry is the canonical one)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<String>,

    /// Static capability patterns; absent means `defaults.capabilities`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<CapabilityPattern>>,
}

/// The `defaults:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsSection {
    /// Capability patterns for participants without their own
    #[serde(default)]
    pub capabilities: Vec<CapabilityPattern>,
}
