//! Space configuration loading
//!
//! The gateway is configured by a single YAML descriptor (`space.yaml`)
//! naming the space, its participants, their capability patterns and
//! tokens, and the transports they connect over. The CLI provides the
//! path; loading and validation happen once at startup, and a config
//! error aborts the process.

mod types;

pub use types::{
    DefaultsSection, GatewaySection, ListenAddr, ParticipantConfig, SpaceConfig, SpaceSection,
    TransportKind, TransportSection, WebsocketSection,
};

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading the space descriptor.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// YAML did not parse or did not match the schema
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// Parsed but semantically invalid
    #[error("invalid space config: {message}")]
    Invalid { message: String },
}

/// Load and validate a space descriptor from `path`.
pub fn load_space_config(path: &Path) -> Result<SpaceConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: SpaceConfig = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &SpaceConfig) -> Result<(), ConfigError> {
    if config.space.id.trim().is_empty() {
        return Err(ConfigError::Invalid {
            message: "space.id is required".to_string(),
        });
    }
    for id in config.participants.keys() {
        if id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "participant ids cannot be empty".to_string(),
            });
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
