//! Shared identifier and enumeration types for the MPC signing service.

mod algorithm;
mod ids;
mod platform;
mod status;

pub use algorithm::{Algorithm, UnknownAlgorithm};
pub use ids::{KeyId, PlayerId, TenantId, TxId};
pub use platform::{PlatformType, UnknownPlatform};
pub use status::ConnectionStatus;

/// Tenant assumed when a key was never bound to one.
pub const DEFAULT_TENANT_ID: &str = "default-tenant";
