//! Capability traits exposed by a crypto provider.
//!
//! Key generation and both signing protocols run in five phases. Each phase
//! consumes the previous phase's outputs from every player, keyed by
//! `(key_id, tx_id)` for signing and `key_id` for key generation. Artifacts
//! are opaque byte strings except where a structure is fixed by the wire
//! contract.

use crate::error::CryptoResult;
use mpc_types::{Algorithm, PlayerId};
use std::collections::BTreeMap;

macro_rules! artifact {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(pub Vec<u8>);

        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn into_bytes(self) -> Vec<u8> {
                self.0
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(data: Vec<u8>) -> Self {
                Self(data)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

artifact!(
    /// Key-generation phase-1 output.
    Commitment
);
artifact!(
    /// Key-generation phase-2 output; opens a phase-1 commitment.
    Decommitment
);
artifact!(
    /// Key-generation phase-3 output.
    ZkProof
);
artifact!(
    /// Key-generation phase-4 output.
    PaillierProof
);
artifact!(
    /// ECDSA phase-1 output.
    MtaRequest
);
artifact!(
    /// ECDSA phase-2 output.
    MtaResponse
);
artifact!(
    /// ECDSA phase-3 output.
    MtaDelta
);
artifact!(
    /// A player's partial signature scalar `s_i` (32 bytes).
    PartialSignature
);
artifact!(
    /// EdDSA phase-1 output: commitment to the nonce point.
    EddsaCommitment
);
artifact!(
    /// EdDSA phase-2 output: the revealed nonce point `R_i` (32 bytes).
    EddsaR
);
artifact!(
    /// EdDSA partial signature scalar `s_i` (32 bytes).
    EddsaPartialSignature
);

/// Key-generation phase-5 output. Every honest player obtains identical
/// `public_key` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenResult {
    pub public_key: Vec<u8>,
    pub algorithm: Algorithm,
    pub player_id: PlayerId,
}

/// Final ECDSA signature. `v` is the recovery id, 0 or 1; the 27/28
/// adjusted form is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdsaSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl EcdsaSignature {
    /// `r ‖ s ‖ v`, 65 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&self.r);
        out.extend_from_slice(&self.s);
        out.push(self.v);
        out
    }
}

/// Final EdDSA signature. No recovery byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EddsaSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl EddsaSignature {
    /// `R ‖ s`, 64 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.r);
        out.extend_from_slice(&self.s);
        out
    }
}

/// EdDSA phase-3 output: the verified nonce points together with the
/// phase-1 commitments they were checked against. Phase 4 refuses an empty
/// or inconsistent commitments map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RsAndCommitments {
    pub rs: BTreeMap<u64, EddsaR>,
    pub commitments: BTreeMap<u64, EddsaCommitment>,
}

/// Distributed key generation, five phases keyed by `key_id`.
pub trait KeyGenerator: Send + Sync {
    /// Record the setup parameters and emit this player's commitment.
    /// Fails `InvalidAlgorithm` if the provider does not host the algorithm.
    fn phase1_generate_commitment(
        &self,
        key_id: &str,
        tenant_id: &str,
        algorithm: Algorithm,
        player_ids: &[u64],
        threshold: u32,
    ) -> CryptoResult<Commitment>;

    /// Requires one commitment per player, including self.
    fn phase2_generate_decommitment(
        &self,
        key_id: &str,
        all_commitments: &BTreeMap<u64, Commitment>,
    ) -> CryptoResult<Decommitment>;

    /// Verifies each decommitment against the matching commitment.
    fn phase3_generate_zk_proof(
        &self,
        key_id: &str,
        all_decommitments: &BTreeMap<u64, Decommitment>,
    ) -> CryptoResult<ZkProof>;

    /// Verifies all ZK proofs; returns a fresh Paillier proof.
    fn phase4_verify_and_generate_paillier_proof(
        &self,
        key_id: &str,
        all_zk_proofs: &BTreeMap<u64, ZkProof>,
    ) -> CryptoResult<PaillierProof>;

    /// Stores the share and metadata; returns the public key. Identical on
    /// every honest player.
    fn phase5_create_public_key(
        &self,
        key_id: &str,
        all_paillier_proofs: &BTreeMap<u64, PaillierProof>,
    ) -> CryptoResult<KeyGenResult>;
}

/// MTA-based threshold ECDSA signing, five phases keyed by `(key_id, tx_id)`.
pub trait EcdsaSigner: Send + Sync {
    /// `message_hash` must be exactly 32 bytes.
    fn phase1_start_signing(
        &self,
        key_id: &str,
        tx_id: &str,
        message_hash: &[u8],
        player_ids: &[u64],
    ) -> CryptoResult<MtaRequest>;

    fn phase2_mta_response(
        &self,
        key_id: &str,
        tx_id: &str,
        all_mta_requests: &BTreeMap<u64, MtaRequest>,
    ) -> CryptoResult<MtaResponse>;

    fn phase3_mta_verify(
        &self,
        key_id: &str,
        tx_id: &str,
        all_mta_responses: &BTreeMap<u64, MtaResponse>,
    ) -> CryptoResult<MtaDelta>;

    fn phase4_get_partial_signature(
        &self,
        key_id: &str,
        tx_id: &str,
        all_deltas: &BTreeMap<u64, MtaDelta>,
    ) -> CryptoResult<PartialSignature>;

    fn phase5_get_final_signature(
        &self,
        key_id: &str,
        tx_id: &str,
        all_partial_signatures: &BTreeMap<u64, PartialSignature>,
    ) -> CryptoResult<EcdsaSignature>;
}

/// Commitment-based threshold EdDSA signing, five phases keyed by
/// `(key_id, tx_id)`. Phase 1 consumes the unhashed message.
pub trait EddsaSigner: Send + Sync {
    fn phase1_start_signing(
        &self,
        key_id: &str,
        tx_id: &str,
        message: &[u8],
        player_ids: &[u64],
    ) -> CryptoResult<EddsaCommitment>;

    fn phase2_decommit_r(
        &self,
        key_id: &str,
        tx_id: &str,
        all_commitments: &BTreeMap<u64, EddsaCommitment>,
    ) -> CryptoResult<EddsaR>;

    fn phase3_broadcast_r(
        &self,
        key_id: &str,
        tx_id: &str,
        all_rs: &BTreeMap<u64, EddsaR>,
    ) -> CryptoResult<RsAndCommitments>;

    fn phase4_get_partial_signature(
        &self,
        key_id: &str,
        tx_id: &str,
        rs_and_commitments: &RsAndCommitments,
    ) -> CryptoResult<EddsaPartialSignature>;

    fn phase5_get_final_signature(
        &self,
        key_id: &str,
        tx_id: &str,
        all_partial_signatures: &BTreeMap<u64, EddsaPartialSignature>,
    ) -> CryptoResult<EddsaSignature>;
}

/// A crypto backend: the three capabilities plus identity metadata used in
/// logs.
pub trait CryptoProvider: Send + Sync {
    fn key_generator(&self) -> &dyn KeyGenerator;
    fn ecdsa_signer(&self) -> &dyn EcdsaSigner;
    fn eddsa_signer(&self) -> &dyn EddsaSigner;
    fn provider_name(&self) -> &str;
    fn version(&self) -> &str;
}
