//! SSH credential resolution

use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How a connector authenticates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credentials {
    /// Whatever the SSH agent / default identities offer
    #[default]
    Agent,
    /// Explicit path to a private key file
    KeyFile(PathBuf),
    /// Base64-encoded private key in the named environment variable
    KeyEnv(String),
    /// Password (library-mediated sessions only)
    Password(String),
}

impl Credentials {
    /// Resolve to a key file usable with `ssh -i`
    ///
    /// `Agent` resolves to `None`. For `KeyEnv`, the key is decoded and
    /// written to a private temporary file that lives as long as the
    /// returned [`ResolvedKey`].
    ///
    /// # Errors
    /// Returns `KeyError` if the key cannot be found or decoded, or for
    /// password credentials, which the `ssh` client cannot take
    /// non-interactively.
    pub fn resolve_key_file(&self) -> Result<Option<ResolvedKey>, KeyError> {
        match self {
            Credentials::Agent => Ok(None),
            Credentials::KeyFile(path) => {
                validate_key_permissions(path)?;
                Ok(Some(ResolvedKey::Path(path.clone())))
            }
            Credentials::KeyEnv(var_name) => {
                let key_data = env_key(var_name)?;
                let temp_path = write_temp_key(&key_data)?;
                Ok(Some(ResolvedKey::Temp(temp_path)))
            }
            Credentials::Password(_) => Err(KeyError::Unsupported(
                "password authentication needs a library-mediated session".to_string(),
            )),
        }
    }

    /// Load the private key for library-mediated authentication
    ///
    /// Returns `None` for `Agent` and `Password`.
    ///
    /// # Errors
    /// Returns `KeyError` if the key cannot be read or parsed
    pub fn load_private_key(&self) -> Result<Option<PrivateKey>, KeyError> {
        match self {
            Credentials::Agent | Credentials::Password(_) => Ok(None),
            Credentials::KeyFile(path) => {
                validate_key_permissions(path)?;
                let key = russh::keys::load_secret_key(path, None)
                    .map_err(|e| KeyError::Parse(e.to_string()))?;
                Ok(Some(key))
            }
            Credentials::KeyEnv(var_name) => {
                let key_data = env_key(var_name)?;
                let text = String::from_utf8(key_data)
                    .map_err(|_| KeyError::Parse("key is not valid UTF-8".to_string()))?;
                let key = russh::keys::decode_secret_key(&text, None)
                    .map_err(|e| KeyError::Parse(e.to_string()))?;
                Ok(Some(key))
            }
        }
    }
}

/// Resolved key location
#[derive(Debug)]
pub enum ResolvedKey {
    /// Path to key file
    Path(PathBuf),
    /// Temporary file (will be deleted on drop)
    Temp(PathBuf),
}

impl ResolvedKey {
    /// Get path to pass to `ssh -i`
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ResolvedKey::Path(p) | ResolvedKey::Temp(p) => p,
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("invalid private key: {0}")]
    Parse(String),

    #[error("unsupported credentials: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn env_key(var_name: &str) -> Result<Vec<u8>, KeyError> {
    use base64::Engine;

    let encoded = env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| KeyError::InvalidBase64)
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)?;
    let mode = metadata.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

fn write_temp_key(key_data: &[u8]) -> Result<PathBuf, KeyError> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    static SEQ: AtomicU64 = AtomicU64::new(0);

    let temp_path = env::temp_dir().join(format!(
        "tendlab_ssh_key_{}_{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&temp_path)?;
    file.write_all(key_data)?;

    debug!(path = %temp_path.display(), "wrote temporary SSH key");

    Ok(temp_path)
}

impl Drop for ResolvedKey {
    fn drop(&mut self) {
        if let ResolvedKey::Temp(path) = self
            && let Err(e) = std::fs::remove_file(&*path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove temp key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_resolves_to_nothing() {
        assert!(Credentials::Agent.resolve_key_file().unwrap().is_none());
        assert!(Credentials::Agent.load_private_key().unwrap().is_none());
    }

    #[test]
    fn test_password_has_no_key_file() {
        let creds = Credentials::Password("hunter2".to_string());
        assert!(matches!(
            creds.resolve_key_file(),
            Err(KeyError::Unsupported(_))
        ));
    }

    #[test]
    fn test_missing_env_key() {
        let creds = Credentials::KeyEnv("TENDLAB_TEST_KEY_THAT_IS_NOT_SET".to_string());
        assert!(matches!(creds.resolve_key_file(), Err(KeyError::EnvNotSet(_))));
    }

    #[test]
    fn test_temp_key_removed_on_drop() {
        let path = write_temp_key(b"not really a key").unwrap();
        assert!(path.exists());

        let key = ResolvedKey::Temp(path.clone());
        assert_eq!(key.path(), path.as_path());
        drop(key);

        assert!(!path.exists());
    }
}
