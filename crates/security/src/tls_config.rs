//! rustls configuration builders for both hops.
//!
//! Policy: TLS 1.2 minimum; TLS 1.2 restricted to ECDHE-(EC)DSA/RSA with
//! AES-GCM; TLS 1.3 restricted to the three AEAD suites. Both sides of both
//! hops are mutually authenticated against the configured CA.

use crate::cert_manager::{CertificateManager, TlsSetupError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, CipherSuite, ClientConfig, DigitallySignedStruct, Error as RustlsError,
    RootCertStore, ServerConfig, SignatureScheme,
};
use std::sync::Arc;
use tracing::{debug, info};

const ALLOWED_SUITES: &[CipherSuite] = &[
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
];

/// Ring provider restricted to the allowed cipher suites.
fn restricted_provider() -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    provider
        .cipher_suites
        .retain(|suite| ALLOWED_SUITES.contains(&suite.suite()));
    provider
}

fn root_store(ca_certs: Vec<CertificateDer<'static>>) -> Result<RootCertStore, TlsSetupError> {
    let mut store = RootCertStore::empty();
    for cert in ca_certs {
        store
            .add(cert)
            .map_err(|e| TlsSetupError::Config(format!("cannot add CA certificate: {e}")))?;
    }
    Ok(store)
}

/// Server-side mTLS configuration: requires a client certificate signed by
/// the configured CA.
pub struct ServerConfigBuilder {
    cert_manager: CertificateManager,
}

impl ServerConfigBuilder {
    pub fn new(cert_manager: CertificateManager) -> Self {
        Self { cert_manager }
    }

    pub fn build(&self) -> Result<ServerConfig, TlsSetupError> {
        let (certs, key, ca_certs) = self.cert_manager.load_certificates()?;
        let roots = root_store(ca_certs)?;
        let provider = Arc::new(restricted_provider());

        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .map_err(|e| TlsSetupError::Config(format!("client verifier: {e}")))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| TlsSetupError::Config(format!("protocol versions: {e}")))?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsSetupError::Config(format!("server certificate: {e}")))?;

        info!("mTLS server configuration ready");
        Ok(config)
    }
}

/// Client-side mTLS configuration. Peers are addressed by IP inside the
/// mesh, so hostname verification can be relaxed while the CA signature
/// chain stays enforced.
pub struct ClientConfigBuilder {
    cert_manager: CertificateManager,
    skip_hostname_verification: bool,
}

impl ClientConfigBuilder {
    pub fn new(cert_manager: CertificateManager) -> Self {
        Self {
            cert_manager,
            skip_hostname_verification: false,
        }
    }

    /// Accept any peer certificate signed by the CA regardless of the name
    /// it was issued for.
    pub fn skip_hostname_verification(mut self) -> Self {
        self.skip_hostname_verification = true;
        self
    }

    pub fn build(&self) -> Result<ClientConfig, TlsSetupError> {
        let (certs, key, ca_certs) = self.cert_manager.load_certificates()?;
        let roots = root_store(ca_certs)?;
        let provider = Arc::new(restricted_provider());

        let webpki_verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .map_err(|e| TlsSetupError::Config(format!("server verifier: {e}")))?;

        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| TlsSetupError::Config(format!("protocol versions: {e}")))?;

        let config = if self.skip_hostname_verification {
            debug!("hostname verification relaxed for in-mesh client config");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(CaOnlyVerifier {
                    inner: webpki_verifier,
                }))
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsSetupError::Config(format!("client certificate: {e}")))?
        } else {
            builder
                .with_webpki_verifier(webpki_verifier)
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsSetupError::Config(format!("client certificate: {e}")))?
        };

        info!("mTLS client configuration ready");
        Ok(config)
    }
}

/// Delegates to the WebPKI verifier and forgives only name mismatches; an
/// untrusted signature chain still fails the handshake.
#[derive(Debug)]
struct CaOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for CaOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(RustlsError::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(RustlsError::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;
    use crate::resource::LocalResourceLoader;

    fn ca_signed_material(dir: &std::path::Path) {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .unwrap();

        std::fs::write(dir.join("ca.pem"), ca_cert.pem()).unwrap();
        std::fs::write(dir.join("leaf.pem"), leaf_cert.pem()).unwrap();
        std::fs::write(dir.join("leaf.key"), leaf_key.serialize_pem()).unwrap();
    }

    fn manager(dir: &std::path::Path) -> CertificateManager {
        CertificateManager::new(
            Arc::new(LocalResourceLoader::new(dir)),
            Arc::new(LocalKms::new(dir)),
            "ca.pem",
            "leaf.pem",
            "leaf.key",
        )
    }

    #[test]
    fn test_server_config_builds() {
        let dir = tempfile::tempdir().unwrap();
        ca_signed_material(dir.path());
        ServerConfigBuilder::new(manager(dir.path())).build().unwrap();
    }

    #[test]
    fn test_client_config_builds_both_modes() {
        let dir = tempfile::tempdir().unwrap();
        ca_signed_material(dir.path());
        ClientConfigBuilder::new(manager(dir.path())).build().unwrap();
        ClientConfigBuilder::new(manager(dir.path()))
            .skip_hostname_verification()
            .build()
            .unwrap();
    }
}
