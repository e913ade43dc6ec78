use mpc_network::NetworkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("node id already registered: {0}")]
    DuplicateNode(String),

    #[error("unknown node id: {0}")]
    UnknownNode(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    TlsSetup(#[from] mpc_security::TlsSetupError),
}
