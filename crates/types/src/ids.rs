use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a distributed key across its lifetime.
pub type KeyId = String;

/// Identifier of a single signing attempt; scopes the per-tx scratch and is
/// reused across the five phases of one signing.
pub type TxId = String;

/// Identifier scoping a set of keys to one tenant.
pub type TenantId = String;

/// Identifies a node within a signing quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl PlayerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for PlayerId {
    fn from(id: u64) -> Self {
        PlayerId(id)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
