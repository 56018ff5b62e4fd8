//! Device credential persistence.
//!
//! The relay issues the agent a device id and bearer token on first
//! enrollment; they live in `credentials.json` next to the config file so
//! the kiosk reauthenticates automatically across restarts. When the relay
//! rejects the token the connection manager asks for it to be cleared, and
//! the next start goes back through enrollment.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::config::{config_dir, ConfigError};

/// Error type for credential file operations.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The platform config directory could not be determined.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A file system I/O error occurred.
    #[error("I/O error accessing credentials at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The credential file content could not be parsed.
    #[error("failed to parse credentials: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Credentials issued by the relay after enrollment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub device_id: Uuid,
    pub token: String,
}

/// Resolves the full path to the credential file.
///
/// # Errors
///
/// Returns [`CredentialError::Config`] if the base directory cannot be
/// determined.
pub fn credentials_file_path() -> Result<PathBuf, CredentialError> {
    Ok(config_dir()?.join("credentials.json"))
}

/// Loads stored credentials, returning `None` if the device has not
/// enrolled yet.
///
/// # Errors
///
/// Returns [`CredentialError::Io`] for file-system errors other than "not
/// found", and [`CredentialError::Parse`] if the file is corrupt.
pub fn load_credentials() -> Result<Option<DeviceCredentials>, CredentialError> {
    let path = credentials_file_path()?;

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let creds: DeviceCredentials = serde_json::from_str(&content)?;
            Ok(Some(creds))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CredentialError::Io { path, source: e }),
    }
}

/// Persists credentials to disk, creating the directory if needed.
///
/// # Errors
///
/// Returns [`CredentialError::Io`] for file-system failures.
pub fn save_credentials(creds: &DeviceCredentials) -> Result<(), CredentialError> {
    let path = credentials_file_path()?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| CredentialError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = serde_json::to_string_pretty(creds)?;
    std::fs::write(&path, content).map_err(|source| CredentialError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Removes stored credentials. Missing file is not an error.
///
/// # Errors
///
/// Returns [`CredentialError::Io`] for file-system failures other than
/// "not found".
pub fn clear_credentials() -> Result<(), CredentialError> {
    let path = credentials_file_path()?;

    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CredentialError::Io { path, source: e }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_round_trip_through_json() {
        // Arrange
        let creds = DeviceCredentials {
            device_id: Uuid::new_v4(),
            token: "tok_abc123".to_string(),
        };

        // Act
        let json = serde_json::to_string_pretty(&creds).expect("serialize");
        let restored: DeviceCredentials = serde_json::from_str(&json).expect("deserialize");

        // Assert
        assert_eq!(creds, restored);
    }

    #[test]
    fn test_corrupt_credential_file_is_a_parse_error() {
        let result: Result<DeviceCredentials, serde_json::Error> =
            serde_json::from_str("{not json");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_load_clear_via_temp_file() {
        // Arrange: drive the same logic save/load use, against a temp path
        let dir = std::env::temp_dir().join(format!("screenlink_cred_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("credentials.json");

        let creds = DeviceCredentials {
            device_id: Uuid::new_v4(),
            token: "tok_persist".to_string(),
        };

        // Act
        std::fs::write(&path, serde_json::to_string_pretty(&creds).unwrap()).unwrap();
        let loaded: DeviceCredentials =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        // Assert
        assert_eq!(loaded, creds);
        assert!(!path.exists());

        std::fs::remove_dir_all(&dir).ok();
    }
}
