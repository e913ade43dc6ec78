//! Certificate material assembly for mTLS endpoints.
//!
//! CA and certificate PEM come from the read-only resource loader; the
//! private key comes from the KMS. Nothing here touches the filesystem
//! directly.

use crate::kms::{KeyManagementService, KmsError};
use crate::resource::{ReadOnlyResourceLoader, ResourceError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Kms(#[from] KmsError),

    #[error("invalid PEM in {source_name}: {reason}")]
    InvalidPem { source_name: String, reason: String },

    #[error("TLS configuration rejected: {0}")]
    Config(String),
}

/// Loads the certificate chain, private key, and CA set for one endpoint.
#[derive(Clone)]
pub struct CertificateManager {
    loader: Arc<dyn ReadOnlyResourceLoader>,
    kms: Arc<dyn KeyManagementService>,
    ca_cert_path: String,
    cert_path: String,
    key_secret_id: String,
}

impl CertificateManager {
    pub fn new(
        loader: Arc<dyn ReadOnlyResourceLoader>,
        kms: Arc<dyn KeyManagementService>,
        ca_cert_path: impl Into<String>,
        cert_path: impl Into<String>,
        key_secret_id: impl Into<String>,
    ) -> Self {
        Self {
            loader,
            kms,
            ca_cert_path: ca_cert_path.into(),
            cert_path: cert_path.into(),
            key_secret_id: key_secret_id.into(),
        }
    }

    /// Load everything needed for one mTLS endpoint: own chain, own private
    /// key, and the CA certificates used to verify the peer.
    pub fn load_certificates(
        &self,
    ) -> Result<
        (
            Vec<CertificateDer<'static>>,
            PrivateKeyDer<'static>,
            Vec<CertificateDer<'static>>,
        ),
        TlsSetupError,
    > {
        debug!(
            ca = %self.ca_cert_path,
            cert = %self.cert_path,
            key = %self.key_secret_id,
            kms = self.kms.backend(),
            "loading mTLS certificate material"
        );

        let cert_pem = self.loader.load(&self.cert_path)?;
        let certs = parse_cert_chain(&cert_pem, &self.cert_path)?;

        let key_pem = self.kms.get_secret(&self.key_secret_id)?;
        let key = parse_private_key(&key_pem, &self.key_secret_id)?;

        let ca_pem = self.loader.load(&self.ca_cert_path)?;
        let ca_certs = parse_cert_chain(&ca_pem, &self.ca_cert_path)?;

        Ok((certs, key, ca_certs))
    }
}

/// Parse one or more certificates from PEM bytes.
pub fn parse_cert_chain(
    pem: &[u8],
    source_name: &str,
) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let mut reader = Cursor::new(pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsSetupError::InvalidPem {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsSetupError::InvalidPem {
            source_name: source_name.to_string(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Parse a private key from PEM bytes. PKCS#8 first, then PKCS#1 (RSA) and
/// SEC1 (EC).
pub fn parse_private_key(
    pem: &[u8],
    source_name: &str,
) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    let mut reader = Cursor::new(pem);
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| TlsSetupError::InvalidPem {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?
    {
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut reader = Cursor::new(pem);
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| TlsSetupError::InvalidPem {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?
    {
        return Ok(PrivateKeyDer::Pkcs1(key));
    }

    let mut reader = Cursor::new(pem);
    if let Some(key) = rustls_pemfile::ec_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| TlsSetupError::InvalidPem {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?
    {
        return Ok(PrivateKeyDer::Sec1(key));
    }

    Err(TlsSetupError::InvalidPem {
        source_name: source_name.to_string(),
        reason: "no private key found".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;
    use crate::resource::LocalResourceLoader;

    fn self_signed() -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_load_certificates_via_loader_and_kms() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_pem, key_pem) = self_signed();
        std::fs::write(dir.path().join("ca.pem"), &cert_pem).unwrap();
        std::fs::write(dir.path().join("server.pem"), &cert_pem).unwrap();
        std::fs::write(dir.path().join("server.key"), &key_pem).unwrap();

        let manager = CertificateManager::new(
            Arc::new(LocalResourceLoader::new(dir.path())),
            Arc::new(LocalKms::new(dir.path())),
            "ca.pem",
            "server.pem",
            "server.key",
        );
        let (certs, _key, ca_certs) = manager.load_certificates().unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(ca_certs.len(), 1);
    }

    #[test]
    fn test_missing_material_surfaces_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::new(
            Arc::new(LocalResourceLoader::new(dir.path())),
            Arc::new(LocalKms::new(dir.path())),
            "ca.pem",
            "server.pem",
            "server.key",
        );
        assert!(matches!(
            manager.load_certificates(),
            Err(TlsSetupError::Resource(_))
        ));
    }

    #[test]
    fn test_garbage_pem_rejected() {
        assert!(parse_cert_chain(b"not pem", "x").is_err());
        assert!(parse_private_key(b"not pem", "x").is_err());
    }
}
