//! Read-only resource loader seam, used for CA and certificate PEM files.

use mpc_types::PlatformType;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource io error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("resource configuration error: {0}")]
    Configuration(String),
}

pub trait ReadOnlyResourceLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<Vec<u8>, ResourceError>;

    fn exists(&self, path: &str) -> bool;
}

/// Filesystem loader rooted at a base directory.
pub struct LocalResourceLoader {
    base_dir: PathBuf,
}

impl LocalResourceLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ResourceError> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ResourceError::Configuration(format!(
                "resource path must be relative without '..': {path}"
            )));
        }
        Ok(self.base_dir.join(relative))
    }
}

impl ReadOnlyResourceLoader for LocalResourceLoader {
    fn load(&self, path: &str) -> Result<Vec<u8>, ResourceError> {
        let resolved = self.resolve(path)?;
        std::fs::read(&resolved).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ResourceError::NotFound(path.to_string()),
            _ => ResourceError::Io {
                path: path.to_string(),
                source: e,
            },
        })
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }
}

/// Select the resource loader for the deployment platform.
pub fn create_resource_loader(
    platform: PlatformType,
    base_dir: &str,
) -> Result<Arc<dyn ReadOnlyResourceLoader>, ResourceError> {
    match platform {
        PlatformType::Local => Ok(Arc::new(LocalResourceLoader::new(base_dir))),
        other => Err(ResourceError::Configuration(format!(
            "{other} resource loader is not compiled into this build"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.pem"), b"cert").unwrap();

        let loader = LocalResourceLoader::new(dir.path());
        assert!(loader.exists("ca.pem"));
        assert!(!loader.exists("other.pem"));
        assert_eq!(loader.load("ca.pem").unwrap(), b"cert");
        assert!(matches!(
            loader.load("other.pem"),
            Err(ResourceError::NotFound(_))
        ));
    }

    #[test]
    fn test_traversal_rejected() {
        let loader = LocalResourceLoader::new("/tmp");
        assert!(loader.load("../secret").is_err());
    }
}
