//! Participant token resolution
//!
//! Tokens are static secrets compared at join time. Resolution order per
//! participant, evaluated once at gateway startup:
//!
//! 1. Environment variable `MEW_TOKEN_<UPPER_SNAKE_ID>`
//! 2. Token file `<spaceDir>/.mew/tokens/<pid>.token`
//! 3. First entry of the participant's configured `tokens`
//! 4. Freshly generated random token, persisted to the token file
//!
//! Generated tokens are 32 bytes of OS randomness, base64url-encoded
//! without padding. The token directory is created with owner-only
//! permissions and a `.gitignore` that keeps it out of version control.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Directory under the space dir holding per-participant token files.
pub const TOKEN_DIR: &str = ".mew/tokens";

const GITIGNORE_CONTENT: &str = "*\n!.gitignore\n";
const TOKEN_BYTES: usize = 32;

/// Errors raised while resolving or persisting tokens.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token file or directory I/O failed
    #[error("token I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Environment variable consulted for a participant's token:
/// `MEW_TOKEN_<UPPER_SNAKE_ID>` (non-alphanumeric id characters map to `_`).
pub fn token_env_var(participant_id: &str) -> String {
    let upper_snake: String = participant_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MEW_TOKEN_{upper_snake}")
}

/// Path of a participant's token file under the space directory.
pub fn token_file_path(space_dir: &Path, participant_id: &str) -> PathBuf {
    space_dir
        .join(TOKEN_DIR)
        .join(format!("{participant_id}.token"))
}

/// Resolve the token for one participant, generating and persisting a fresh
/// one when nothing else supplies it.
pub fn resolve_token(
    space_dir: &Path,
    participant_id: &str,
    configured: &[String],
) -> Result<String, TokenError> {
    if let Ok(token) = std::env::var(token_env_var(participant_id))
        && !token.trim().is_empty()
    {
        debug!("Token for {participant_id} resolved from environment");
        return Ok(token.trim().to_string());
    }

    let path = token_file_path(space_dir, participant_id);
    if let Ok(raw) = std::fs::read_to_string(&path) {
        let token = raw.trim();
        if !token.is_empty() {
            debug!("Token for {participant_id} resolved from {}", path.display());
            return Ok(token.to_string());
        }
    }

    if let Some(token) = configured.first() {
        debug!("Token for {participant_id} resolved from configuration");
        return Ok(token.clone());
    }

    let token = generate_token();
    write_token_file(space_dir, participant_id, &token)?;
    debug!(
        "Generated token for {participant_id}, persisted to {}",
        path.display()
    );
    Ok(token)
}

/// Generate a fresh random token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Persist a token with owner-only permissions, creating the token
/// directory and its `.gitignore` as needed.
pub fn write_token_file(
    space_dir: &Path,
    participant_id: &str,
    token: &str,
) -> Result<String, TokenError> {
    let dir = space_dir.join(TOKEN_DIR);
    std::fs::create_dir_all(&dir).map_err(|source| TokenError::Io {
        path: dir.clone(),
        source,
    })?;
    set_mode(&dir, 0o700)?;

    let gitignore = dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, GITIGNORE_CONTENT).map_err(|source| TokenError::Io {
            path: gitignore.clone(),
            source,
        })?;
    }

    let path = token_file_path(space_dir, participant_id);
    std::fs::write(&path, format!("{token}\n")).map_err(|source| TokenError::Io {
        path: path.clone(),
        source,
    })?;
    set_mode(&path, 0o600)?;
    Ok(token.to_string())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), TokenError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|source| {
        TokenError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), TokenError> {
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
