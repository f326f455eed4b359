//! Persistent server host key.
//!
//! The key file holds the 32 raw secret key bytes. It is created on first
//! use so a fresh install gets a stable identity without a setup step.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use protocol::HostIdentity;

/// Length of the secret key stored on disk.
pub const HOST_KEY_LENGTH: usize = 32;

/// Loads the host key at `path`, generating and saving one if missing.
pub fn load_or_generate(path: &Path) -> Result<HostIdentity> {
    if path.exists() {
        return load(path);
    }

    let identity = HostIdentity::generate();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    fs::write(path, identity.secret_key_bytes())
        .with_context(|| format!("Failed to write host key file: {}", path.display()))?;
    restrict_permissions(path)?;

    tracing::info!(
        path = %path.display(),
        fingerprint = %identity.fingerprint(),
        "Generated new host key"
    );
    Ok(identity)
}

/// Loads an existing host key.
pub fn load(path: &Path) -> Result<HostIdentity> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read host key file: {}", path.display()))?;
    if bytes.len() != HOST_KEY_LENGTH {
        anyhow::bail!(
            "Invalid host key file {}: expected {} bytes, got {}",
            path.display(),
            HOST_KEY_LENGTH,
            bytes.len()
        );
    }

    let mut key = [0u8; HOST_KEY_LENGTH];
    key.copy_from_slice(&bytes);
    let identity = HostIdentity::from_secret_key_bytes(&key);
    tracing::debug!(fingerprint = %identity.fingerprint(), "Loaded host key");
    Ok(identity)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
