use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Signature algorithms the service can host shares for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    EcdsaSecp256k1,
    EcdsaSecp256r1,
    EcdsaStark,
    EddsaEd25519,
}

/// Raised when an algorithm string or wire discriminant is not recognized.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::EcdsaSecp256k1,
        Algorithm::EcdsaSecp256r1,
        Algorithm::EcdsaStark,
        Algorithm::EddsaEd25519,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::EcdsaSecp256k1 => "ECDSA_SECP256K1",
            Algorithm::EcdsaSecp256r1 => "ECDSA_SECP256R1",
            Algorithm::EcdsaStark => "ECDSA_STARK",
            Algorithm::EddsaEd25519 => "EDDSA_ED25519",
        }
    }

    pub fn is_ecdsa(&self) -> bool {
        !matches!(self, Algorithm::EddsaEd25519)
    }

    /// Stable discriminant used in wire messages.
    pub fn to_wire(&self) -> u32 {
        match self {
            Algorithm::EcdsaSecp256k1 => 0,
            Algorithm::EcdsaSecp256r1 => 1,
            Algorithm::EcdsaStark => 2,
            Algorithm::EddsaEd25519 => 3,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self, UnknownAlgorithm> {
        match value {
            0 => Ok(Algorithm::EcdsaSecp256k1),
            1 => Ok(Algorithm::EcdsaSecp256r1),
            2 => Ok(Algorithm::EcdsaStark),
            3 => Ok(Algorithm::EddsaEd25519),
            other => Err(UnknownAlgorithm(other.to_string())),
        }
    }
}

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ECDSA_SECP256K1" => Ok(Algorithm::EcdsaSecp256k1),
            "ECDSA_SECP256R1" => Ok(Algorithm::EcdsaSecp256r1),
            "ECDSA_STARK" => Ok(Algorithm::EcdsaStark),
            "EDDSA_ED25519" => Ok(Algorithm::EddsaEd25519),
            other => Err(UnknownAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        for algo in Algorithm::ALL {
            assert_eq!(algo.as_str().parse::<Algorithm>().unwrap(), algo);
        }
    }

    #[test]
    fn test_wire_round_trip() {
        for algo in Algorithm::ALL {
            assert_eq!(Algorithm::from_wire(algo.to_wire()).unwrap(), algo);
        }
        assert!(Algorithm::from_wire(99).is_err());
    }

    #[test]
    fn test_is_ecdsa() {
        assert!(Algorithm::EcdsaSecp256k1.is_ecdsa());
        assert!(!Algorithm::EddsaEd25519.is_ecdsa());
    }
}
