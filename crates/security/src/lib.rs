//! Security plumbing: KMS and resource-loader seams, certificate loading,
//! rustls configuration, and the optional kernel firewall helper.

pub mod cert_manager;
pub mod firewall;
pub mod kms;
pub mod resource;
pub mod tls_config;

pub use cert_manager::{CertificateManager, TlsSetupError};
pub use firewall::{FirewallError, KernelFirewall};
pub use kms::{create_kms, KeyManagementService, KmsError, LocalKms};
pub use resource::{create_resource_loader, LocalResourceLoader, ReadOnlyResourceLoader, ResourceError};
pub use tls_config::{ClientConfigBuilder, ServerConfigBuilder};
