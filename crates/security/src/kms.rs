//! Key management service seam.
//!
//! The control-plane only ever asks a KMS for secret bytes by id (TLS
//! private keys, node share material). The local backend maps ids to files
//! under a secrets directory; cloud backends are selected by platform at
//! startup and are not compiled into this tree.

use mpc_types::PlatformType;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum KmsError {
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    #[error("KMS connection error: {0}")]
    Connection(String),

    #[error("KMS authentication error: {0}")]
    Authentication(String),

    #[error("KMS configuration error: {0}")]
    Configuration(String),
}

/// Opaque secret fetch used for TLS private keys and share material.
pub trait KeyManagementService: Send + Sync {
    fn get_secret(&self, secret_id: &str) -> Result<Vec<u8>, KmsError>;

    /// Backend label, used in logs only.
    fn backend(&self) -> &str;
}

/// File-backed KMS for LOCAL deployments: each secret id names a file under
/// the secrets directory.
pub struct LocalKms {
    secrets_dir: PathBuf,
}

impl LocalKms {
    pub fn new(secrets_dir: impl Into<PathBuf>) -> Self {
        Self {
            secrets_dir: secrets_dir.into(),
        }
    }

    fn resolve(&self, secret_id: &str) -> Result<PathBuf, KmsError> {
        let relative = Path::new(secret_id);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(KmsError::Configuration(format!(
                "secret id must be a relative path without '..': {secret_id}"
            )));
        }
        Ok(self.secrets_dir.join(relative))
    }
}

impl KeyManagementService for LocalKms {
    fn get_secret(&self, secret_id: &str) -> Result<Vec<u8>, KmsError> {
        let path = self.resolve(secret_id)?;
        debug!(secret_id, path = %path.display(), "loading local secret");
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KmsError::SecretNotFound(secret_id.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                KmsError::Authentication(format!("cannot read secret {secret_id}: {e}"))
            }
            _ => KmsError::Connection(format!("cannot read secret {secret_id}: {e}")),
        })
    }

    fn backend(&self) -> &str {
        "local"
    }
}

/// Select the KMS backend for the deployment platform. Only LOCAL is built
/// into this tree; cloud platforms need their provider crates linked in.
pub fn create_kms(
    platform: PlatformType,
    secrets_dir: &str,
) -> Result<Arc<dyn KeyManagementService>, KmsError> {
    match platform {
        PlatformType::Local => Ok(Arc::new(LocalKms::new(secrets_dir))),
        other => Err(KmsError::Configuration(format!(
            "{other} KMS backend is not compiled into this build"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_kms_reads_secret() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("node1.key"), b"pem bytes").unwrap();

        let kms = LocalKms::new(dir.path());
        assert_eq!(kms.get_secret("node1.key").unwrap(), b"pem bytes");
        assert_eq!(kms.backend(), "local");
    }

    #[test]
    fn test_missing_secret_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let kms = LocalKms::new(dir.path());
        assert!(matches!(
            kms.get_secret("absent.key"),
            Err(KmsError::SecretNotFound(_))
        ));
    }

    #[test]
    fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let kms = LocalKms::new(dir.path());
        assert!(matches!(
            kms.get_secret("../etc/shadow"),
            Err(KmsError::Configuration(_))
        ));
        assert!(matches!(
            kms.get_secret("/etc/shadow"),
            Err(KmsError::Configuration(_))
        ));
    }

    #[test]
    fn test_cloud_backends_not_compiled() {
        assert!(create_kms(PlatformType::Aws, "/tmp").is_err());
        assert!(create_kms(PlatformType::Local, "/tmp").is_ok());
    }
}
