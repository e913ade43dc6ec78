use thiserror::Error;

/// Failure model shared by every provider phase method and persistency
/// operation. Failures are local to the player; quorum decisions belong to
/// the coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid algorithm: {0}")]
    InvalidAlgorithm(String),

    #[error("missing phase state: {0}")]
    MissingPhaseState(String),

    #[error("bad key: {0}")]
    BadKey(String),

    #[error("proof verification failed: {0}")]
    ProofVerification(String),

    #[error("internal crypto error: {0}")]
    Internal(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
