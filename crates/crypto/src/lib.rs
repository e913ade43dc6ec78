//! Crypto provider interfaces and the node-side persistency they consume.
//!
//! The MPC math itself lives behind the [`provider::CryptoProvider`]
//! capability traits; [`local::LocalCryptoProvider`] is the in-tree backend,
//! a deterministic simulation that still produces algebraically valid
//! signatures so the control-plane can be exercised end to end.

pub mod error;
pub mod local;
pub mod persistency;
pub mod provider;

pub use error::{CryptoError, CryptoResult};
pub use local::LocalCryptoProvider;
pub use persistency::{
    AuxiliaryKeys, InMemoryPersistency, KeyMetadata, KeyPersistency, SetupData, TxScratch,
    TxScratchStore,
};
pub use provider::{
    Commitment, CryptoProvider, Decommitment, EcdsaSignature, EcdsaSigner, EddsaCommitment,
    EddsaPartialSignature, EddsaR, EddsaSignature, EddsaSigner, KeyGenResult, KeyGenerator,
    MtaDelta, MtaRequest, MtaResponse, PaillierProof, PartialSignature, RsAndCommitments,
    ZkProof,
};
