//! The in-tree crypto backend.
//!
//! `LocalCryptoProvider` implements all three capabilities over additive
//! deterministic shares. It is a simulation of the real MPC engine with the
//! same phase discipline, persistency contract, and failure model, and its
//! final signatures are valid ECDSA / Ed25519 signatures under the group
//! public key, which keeps the end-to-end path honest.

mod math;

pub use math::{ecdsa_verify, eddsa_verify, group_public_key};

use crate::error::{CryptoError, CryptoResult};
use crate::persistency::{
    AuxiliaryKeys, KeyMetadata, KeyPersistency, SetupData, TxScratch, TxScratchStore,
};
use crate::provider::*;
use math::hash256;
use mpc_types::{Algorithm, PlayerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const KEYGEN_COMMIT_TAG: &[u8] = b"keygen-commit-v1";
const KEYGEN_ZK_TAG: &[u8] = b"keygen-zk-v1";
const KEYGEN_PAILLIER_TAG: &[u8] = b"keygen-paillier-v1";
const AUX_PAILLIER_TAG: &[u8] = b"aux-paillier-v1";
const AUX_PEDERSEN_TAG: &[u8] = b"aux-pedersen-v1";
const MTA_REQUEST_TAG: &[u8] = b"mta-request-v1";
const MTA_RESPONSE_TAG: &[u8] = b"mta-response-v1";
const MTA_DELTA_TAG: &[u8] = b"mta-delta-v1";
const EDDSA_COMMIT_TAG: &[u8] = b"eddsa-commit-v1";

/// Keygen scratch carried in persistency setup data between phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeygenSetup {
    algorithm: Algorithm,
    tenant_id: String,
    player_ids: Vec<u64>,
    threshold: u32,
    /// Revealed public shares, present once phase 3 has verified them.
    decommitments: Option<BTreeMap<u64, Vec<u8>>>,
}

impl KeygenSetup {
    fn encode(&self) -> CryptoResult<SetupData> {
        serde_json::to_vec(self)
            .map(SetupData)
            .map_err(|e| CryptoError::Internal(format!("setup data encode: {e}")))
    }

    fn decode(data: &SetupData) -> CryptoResult<Self> {
        serde_json::from_slice(&data.0)
            .map_err(|e| CryptoError::Internal(format!("setup data decode: {e}")))
    }
}

pub struct LocalCryptoProvider {
    player_id: u64,
    persistency: Arc<dyn KeyPersistency>,
    scratch: TxScratchStore,
}

impl LocalCryptoProvider {
    pub fn new(player_id: u64, persistency: Arc<dyn KeyPersistency>) -> Self {
        Self {
            player_id,
            persistency,
            scratch: TxScratchStore::new(),
        }
    }

    pub fn player_id(&self) -> u64 {
        self.player_id
    }

    /// In-flight signing transactions, used by shutdown accounting.
    pub fn pending_transactions(&self) -> usize {
        self.scratch.len()
    }

    fn load_setup(&self, key_id: &str) -> CryptoResult<KeygenSetup> {
        let data = self.persistency.load_setup_data(key_id).map_err(|_| {
            CryptoError::MissingPhaseState(format!("keygen phase 1 never ran for key {key_id}"))
        })?;
        KeygenSetup::decode(&data)
    }

    /// Signing on a key this node has never seen derives the deterministic
    /// share first. `load_key` on a missing key still fails `BadKey`.
    fn ensure_signing_key(&self, key_id: &str, default: Algorithm) -> CryptoResult<Algorithm> {
        if self.persistency.key_exist(key_id) {
            let (algorithm, _) = self.persistency.load_key(key_id)?;
            return Ok(algorithm);
        }
        let share = math::derive_share(key_id, self.player_id);
        self.persistency.store_key(key_id, default, share, 0)?;
        debug!(key_id, algorithm = %default, "provisioned deterministic share");
        Ok(default)
    }

    fn expected_keygen_commitment(&self, key_id: &str, player_id: u64, decommitment: &[u8]) -> [u8; 32] {
        hash256(&[
            KEYGEN_COMMIT_TAG,
            key_id.as_bytes(),
            &player_id.to_le_bytes(),
            decommitment,
        ])
    }

    /// Require `artifacts` to carry exactly one entry per expected player.
    fn check_player_set<T>(
        expected: &[u64],
        artifacts: &BTreeMap<u64, T>,
        what: &str,
    ) -> CryptoResult<()> {
        if artifacts.len() != expected.len() {
            return Err(CryptoError::Internal(format!(
                "expected {} {what}, got {}",
                expected.len(),
                artifacts.len()
            )));
        }
        for player in expected {
            if !artifacts.contains_key(player) {
                return Err(CryptoError::Internal(format!(
                    "missing {what} for player {player}"
                )));
            }
        }
        Ok(())
    }
}

/// Transcript hash over a map of per-player artifacts; deterministic by
/// BTreeMap ordering.
fn transcript<T: AsRef<[u8]>>(artifacts: &BTreeMap<u64, T>) -> [u8; 32] {
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(artifacts.len() * 2);
    for (player, artifact) in artifacts {
        parts.push(player.to_le_bytes().to_vec());
        parts.push(artifact.as_ref().to_vec());
    }
    let refs: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
    hash256(&refs)
}

// ---------------------------------------------------------------------------
// Key generation
// ---------------------------------------------------------------------------

impl KeyGenerator for LocalCryptoProvider {
    fn phase1_generate_commitment(
        &self,
        key_id: &str,
        tenant_id: &str,
        algorithm: Algorithm,
        player_ids: &[u64],
        threshold: u32,
    ) -> CryptoResult<Commitment> {
        if algorithm == Algorithm::EcdsaStark {
            return Err(CryptoError::InvalidAlgorithm(
                "ECDSA_STARK is not supported by the local provider".to_string(),
            ));
        }
        if player_ids.is_empty() || !player_ids.contains(&self.player_id) {
            return Err(CryptoError::Internal(format!(
                "player {} is not part of the quorum",
                self.player_id
            )));
        }
        if threshold == 0 || threshold as usize > player_ids.len() {
            return Err(CryptoError::Internal(format!(
                "threshold {threshold} out of range for {} players",
                player_ids.len()
            )));
        }

        let setup = KeygenSetup {
            algorithm,
            tenant_id: tenant_id.to_string(),
            player_ids: player_ids.to_vec(),
            threshold,
            decommitments: None,
        };
        self.persistency.store_setup_data(key_id, setup.encode()?)?;

        let share = math::derive_share(key_id, self.player_id);
        let public_share = math::public_share(algorithm, &share)?;
        let commitment = self.expected_keygen_commitment(key_id, self.player_id, &public_share);
        Ok(Commitment(commitment.to_vec()))
    }

    fn phase2_generate_decommitment(
        &self,
        key_id: &str,
        all_commitments: &BTreeMap<u64, Commitment>,
    ) -> CryptoResult<Decommitment> {
        let setup = self.load_setup(key_id)?;
        Self::check_player_set(&setup.player_ids, all_commitments, "commitment")?;

        let share = math::derive_share(key_id, self.player_id);
        let public_share = math::public_share(setup.algorithm, &share)?;
        let own = self.expected_keygen_commitment(key_id, self.player_id, &public_share);
        let presented = all_commitments
            .get(&self.player_id)
            .ok_or_else(|| CryptoError::Internal("own commitment missing".to_string()))?;
        if presented.0 != own {
            return Err(CryptoError::ProofVerification(
                "own commitment does not match phase 1 output".to_string(),
            ));
        }

        self.persistency
            .store_setup_commitments(key_id, all_commitments.clone())?;
        Ok(Decommitment(public_share))
    }

    fn phase3_generate_zk_proof(
        &self,
        key_id: &str,
        all_decommitments: &BTreeMap<u64, Decommitment>,
    ) -> CryptoResult<ZkProof> {
        let mut setup = self.load_setup(key_id)?;
        let commitments = self.persistency.load_setup_commitments(key_id).map_err(|_| {
            CryptoError::MissingPhaseState(format!("keygen phase 2 never ran for key {key_id}"))
        })?;
        Self::check_player_set(&setup.player_ids, all_decommitments, "decommitment")?;

        for (player, decommitment) in all_decommitments {
            let commitment = commitments.get(player).ok_or_else(|| {
                CryptoError::ProofVerification(format!("no commitment stored for player {player}"))
            })?;
            let expected = self.expected_keygen_commitment(key_id, *player, &decommitment.0);
            if commitment.0 != expected {
                return Err(CryptoError::ProofVerification(format!(
                    "decommitment for player {player} does not open its commitment"
                )));
            }
        }

        let revealed: BTreeMap<u64, Vec<u8>> = all_decommitments
            .iter()
            .map(|(player, d)| (*player, d.0.clone()))
            .collect();
        let digest = transcript(&revealed);
        setup.decommitments = Some(revealed);
        self.persistency.store_setup_data(key_id, setup.encode()?)?;

        Ok(ZkProof(
            hash256(&[
                KEYGEN_ZK_TAG,
                key_id.as_bytes(),
                &self.player_id.to_le_bytes(),
                &digest,
            ])
            .to_vec(),
        ))
    }

    fn phase4_verify_and_generate_paillier_proof(
        &self,
        key_id: &str,
        all_zk_proofs: &BTreeMap<u64, ZkProof>,
    ) -> CryptoResult<PaillierProof> {
        let setup = self.load_setup(key_id)?;
        let revealed = setup.decommitments.as_ref().ok_or_else(|| {
            CryptoError::MissingPhaseState(format!("keygen phase 3 never ran for key {key_id}"))
        })?;
        Self::check_player_set(&setup.player_ids, all_zk_proofs, "zk proof")?;

        let digest = transcript(revealed);
        for (player, proof) in all_zk_proofs {
            let expected = hash256(&[
                KEYGEN_ZK_TAG,
                key_id.as_bytes(),
                &player.to_le_bytes(),
                &digest,
            ]);
            if proof.0 != expected {
                return Err(CryptoError::ProofVerification(format!(
                    "zk proof for player {player} does not verify"
                )));
            }
        }

        Ok(PaillierProof(
            hash256(&[
                KEYGEN_PAILLIER_TAG,
                key_id.as_bytes(),
                &self.player_id.to_le_bytes(),
                &digest,
            ])
            .to_vec(),
        ))
    }

    fn phase5_create_public_key(
        &self,
        key_id: &str,
        all_paillier_proofs: &BTreeMap<u64, PaillierProof>,
    ) -> CryptoResult<KeyGenResult> {
        let setup = self.load_setup(key_id)?;
        let revealed = setup.decommitments.as_ref().ok_or_else(|| {
            CryptoError::MissingPhaseState(format!("keygen phase 3 never ran for key {key_id}"))
        })?;
        Self::check_player_set(&setup.player_ids, all_paillier_proofs, "paillier proof")?;

        let digest = transcript(revealed);
        for (player, proof) in all_paillier_proofs {
            let expected = hash256(&[
                KEYGEN_PAILLIER_TAG,
                key_id.as_bytes(),
                &player.to_le_bytes(),
                &digest,
            ]);
            if proof.0 != expected {
                return Err(CryptoError::ProofVerification(format!(
                    "paillier proof for player {player} does not verify"
                )));
            }
        }

        let public_key = math::aggregate_public_key(setup.algorithm, revealed)?;

        let share = math::derive_share(key_id, self.player_id);
        self.persistency
            .store_key(key_id, setup.algorithm, share, 0)?;
        self.persistency.store_key_metadata(
            key_id,
            KeyMetadata {
                public_key: public_key.clone(),
                algorithm: setup.algorithm,
                player_ids: setup.player_ids.clone(),
                threshold: setup.threshold,
            },
            false,
        )?;
        self.persistency.store_auxiliary_keys(
            key_id,
            AuxiliaryKeys {
                paillier: hash256(&[
                    AUX_PAILLIER_TAG,
                    key_id.as_bytes(),
                    &self.player_id.to_le_bytes(),
                ])
                .to_vec(),
                ring_pedersen: hash256(&[
                    AUX_PEDERSEN_TAG,
                    key_id.as_bytes(),
                    &self.player_id.to_le_bytes(),
                ])
                .to_vec(),
            },
        )?;
        self.persistency
            .store_keyid_tenant_id(key_id, &setup.tenant_id)?;
        self.persistency.delete_temporary_key_data(key_id, false)?;

        debug!(key_id, algorithm = %setup.algorithm, "key generation complete");
        Ok(KeyGenResult {
            public_key,
            algorithm: setup.algorithm,
            player_id: PlayerId(self.player_id),
        })
    }
}

// ---------------------------------------------------------------------------
// ECDSA signing
// ---------------------------------------------------------------------------

impl LocalCryptoProvider {
    fn ecdsa_scratch(&self, key_id: &str, tx_id: &str) -> CryptoResult<(Algorithm, TxScratch)> {
        let scratch = self.scratch.load(key_id, tx_id)?;
        match scratch.algorithm {
            Some(algorithm) if algorithm.is_ecdsa() => Ok((algorithm, scratch)),
            Some(other) => Err(CryptoError::InvalidAlgorithm(format!(
                "transaction {tx_id} is {other}, not ECDSA"
            ))),
            None => Err(CryptoError::MissingPhaseState(format!(
                "no algorithm recorded for tx {tx_id}"
            ))),
        }
    }

    fn expected_mta_request(key_id: &str, tx_id: &str, player: u64, message_hash: &[u8]) -> Vec<u8> {
        hash256(&[
            MTA_REQUEST_TAG,
            key_id.as_bytes(),
            tx_id.as_bytes(),
            &player.to_le_bytes(),
            message_hash,
        ])
        .to_vec()
    }
}

impl EcdsaSigner for LocalCryptoProvider {
    fn phase1_start_signing(
        &self,
        key_id: &str,
        tx_id: &str,
        message_hash: &[u8],
        player_ids: &[u64],
    ) -> CryptoResult<MtaRequest> {
        if message_hash.len() != 32 {
            return Err(CryptoError::Internal(format!(
                "message hash must be 32 bytes, got {}",
                message_hash.len()
            )));
        }
        if player_ids.is_empty() || !player_ids.contains(&self.player_id) {
            return Err(CryptoError::Internal(format!(
                "player {} is not part of the signing quorum",
                self.player_id
            )));
        }

        let algorithm = self.ensure_signing_key(key_id, Algorithm::EcdsaSecp256k1)?;
        if !algorithm.is_ecdsa() {
            return Err(CryptoError::InvalidAlgorithm(format!(
                "key {key_id} is {algorithm}, not ECDSA"
            )));
        }

        let mut players = player_ids.to_vec();
        players.sort_unstable();
        players.dedup();
        self.scratch.init(
            key_id,
            tx_id,
            TxScratch {
                algorithm: Some(algorithm),
                message: message_hash.to_vec(),
                player_ids: players,
                ..TxScratch::default()
            },
        );

        Ok(MtaRequest(Self::expected_mta_request(
            key_id,
            tx_id,
            self.player_id,
            message_hash,
        )))
    }

    fn phase2_mta_response(
        &self,
        key_id: &str,
        tx_id: &str,
        all_mta_requests: &BTreeMap<u64, MtaRequest>,
    ) -> CryptoResult<MtaResponse> {
        let (_, scratch) = self.ecdsa_scratch(key_id, tx_id)?;
        Self::check_player_set(&scratch.player_ids, all_mta_requests, "MTA request")?;

        for (player, request) in all_mta_requests {
            let expected = Self::expected_mta_request(key_id, tx_id, *player, &scratch.message);
            if request.0 != expected {
                return Err(CryptoError::ProofVerification(format!(
                    "MTA request for player {player} does not verify"
                )));
            }
        }

        let digest = transcript(all_mta_requests);
        self.scratch.update(key_id, tx_id, |s| {
            s.mta_requests = Some(all_mta_requests.clone());
        })?;

        Ok(MtaResponse(
            hash256(&[
                MTA_RESPONSE_TAG,
                key_id.as_bytes(),
                tx_id.as_bytes(),
                &self.player_id.to_le_bytes(),
                &digest,
            ])
            .to_vec(),
        ))
    }

    fn phase3_mta_verify(
        &self,
        key_id: &str,
        tx_id: &str,
        all_mta_responses: &BTreeMap<u64, MtaResponse>,
    ) -> CryptoResult<MtaDelta> {
        let (_, scratch) = self.ecdsa_scratch(key_id, tx_id)?;
        let requests = scratch.mta_requests.as_ref().ok_or_else(|| {
            CryptoError::MissingPhaseState(format!("signing phase 2 never ran for tx {tx_id}"))
        })?;
        Self::check_player_set(&scratch.player_ids, all_mta_responses, "MTA response")?;

        let request_digest = transcript(requests);
        for (player, response) in all_mta_responses {
            let expected = hash256(&[
                MTA_RESPONSE_TAG,
                key_id.as_bytes(),
                tx_id.as_bytes(),
                &player.to_le_bytes(),
                &request_digest,
            ]);
            if response.0 != expected {
                return Err(CryptoError::ProofVerification(format!(
                    "MTA response for player {player} does not verify"
                )));
            }
        }

        let digest = transcript(all_mta_responses);
        self.scratch.update(key_id, tx_id, |s| {
            s.mta_responses = Some(all_mta_responses.clone());
        })?;

        Ok(MtaDelta(
            hash256(&[
                MTA_DELTA_TAG,
                key_id.as_bytes(),
                tx_id.as_bytes(),
                &self.player_id.to_le_bytes(),
                &digest,
            ])
            .to_vec(),
        ))
    }

    fn phase4_get_partial_signature(
        &self,
        key_id: &str,
        tx_id: &str,
        all_deltas: &BTreeMap<u64, MtaDelta>,
    ) -> CryptoResult<PartialSignature> {
        let (algorithm, scratch) = self.ecdsa_scratch(key_id, tx_id)?;
        let responses = scratch.mta_responses.as_ref().ok_or_else(|| {
            CryptoError::MissingPhaseState(format!("signing phase 3 never ran for tx {tx_id}"))
        })?;
        Self::check_player_set(&scratch.player_ids, all_deltas, "MTA delta")?;

        let response_digest = transcript(responses);
        for (player, delta) in all_deltas {
            let expected = hash256(&[
                MTA_DELTA_TAG,
                key_id.as_bytes(),
                tx_id.as_bytes(),
                &player.to_le_bytes(),
                &response_digest,
            ]);
            if delta.0 != expected {
                return Err(CryptoError::ProofVerification(format!(
                    "MTA delta for player {player} does not verify"
                )));
            }
        }

        let (_, share) = self.persistency.load_key(key_id)?;
        let message_hash: [u8; 32] = scratch.message.as_slice().try_into().map_err(|_| {
            CryptoError::Internal("stored message hash is not 32 bytes".to_string())
        })?;
        let partial = math::ecdsa_partial(
            algorithm,
            key_id,
            tx_id,
            &message_hash,
            &share,
            scratch.player_ids.len() as u64,
        )?;

        self.scratch.update(key_id, tx_id, |s| {
            let mut partials = BTreeMap::new();
            partials.insert(self.player_id, PartialSignature(partial.to_vec()));
            s.mta_deltas = Some(all_deltas.clone());
            s.partial_signatures = Some(partials);
        })?;

        Ok(PartialSignature(partial.to_vec()))
    }

    fn phase5_get_final_signature(
        &self,
        key_id: &str,
        tx_id: &str,
        all_partial_signatures: &BTreeMap<u64, PartialSignature>,
    ) -> CryptoResult<EcdsaSignature> {
        let (algorithm, scratch) = self.ecdsa_scratch(key_id, tx_id)?;
        if scratch.partial_signatures.is_none() {
            return Err(CryptoError::MissingPhaseState(format!(
                "signing phase 4 never ran for tx {tx_id}"
            )));
        }
        Self::check_player_set(&scratch.player_ids, all_partial_signatures, "partial signature")?;

        let mut partials = BTreeMap::new();
        for (player, partial) in all_partial_signatures {
            let bytes: [u8; 32] = partial.0.as_slice().try_into().map_err(|_| {
                CryptoError::Internal(format!(
                    "partial signature for player {player} is not 32 bytes"
                ))
            })?;
            partials.insert(*player, bytes);
        }

        let signature = math::ecdsa_combine(algorithm, key_id, tx_id, &partials)?;

        let message_hash: [u8; 32] = scratch.message.as_slice().try_into().map_err(|_| {
            CryptoError::Internal("stored message hash is not 32 bytes".to_string())
        })?;
        let public_key = math::group_public_key(algorithm, key_id, &scratch.player_ids)?;
        math::ecdsa_verify(algorithm, &message_hash, &public_key, &signature)?;

        // End of transaction: the final phase owns scratch teardown.
        self.scratch.remove(key_id, tx_id);
        Ok(signature)
    }
}

// ---------------------------------------------------------------------------
// EdDSA signing
// ---------------------------------------------------------------------------

impl LocalCryptoProvider {
    fn eddsa_scratch(&self, key_id: &str, tx_id: &str) -> CryptoResult<TxScratch> {
        let scratch = self.scratch.load(key_id, tx_id)?;
        match scratch.algorithm {
            Some(Algorithm::EddsaEd25519) => Ok(scratch),
            Some(other) => Err(CryptoError::InvalidAlgorithm(format!(
                "transaction {tx_id} is {other}, not EdDSA"
            ))),
            None => Err(CryptoError::MissingPhaseState(format!(
                "no algorithm recorded for tx {tx_id}"
            ))),
        }
    }

    fn expected_eddsa_commitment(key_id: &str, tx_id: &str, player: u64, r_point: &[u8]) -> Vec<u8> {
        hash256(&[
            EDDSA_COMMIT_TAG,
            key_id.as_bytes(),
            tx_id.as_bytes(),
            &player.to_le_bytes(),
            r_point,
        ])
        .to_vec()
    }
}

impl EddsaSigner for LocalCryptoProvider {
    fn phase1_start_signing(
        &self,
        key_id: &str,
        tx_id: &str,
        message: &[u8],
        player_ids: &[u64],
    ) -> CryptoResult<EddsaCommitment> {
        if player_ids.is_empty() || !player_ids.contains(&self.player_id) {
            return Err(CryptoError::Internal(format!(
                "player {} is not part of the signing quorum",
                self.player_id
            )));
        }
        let algorithm = self.ensure_signing_key(key_id, Algorithm::EddsaEd25519)?;
        if algorithm != Algorithm::EddsaEd25519 {
            return Err(CryptoError::InvalidAlgorithm(format!(
                "key {key_id} is {algorithm}, not EdDSA"
            )));
        }

        let mut players = player_ids.to_vec();
        players.sort_unstable();
        players.dedup();
        self.scratch.init(
            key_id,
            tx_id,
            TxScratch {
                algorithm: Some(algorithm),
                message: message.to_vec(),
                player_ids: players,
                ..TxScratch::default()
            },
        );

        let nonce = math::eddsa_nonce_scalar(key_id, tx_id, self.player_id, message);
        let r_point = math::eddsa_nonce_point(&nonce);
        Ok(EddsaCommitment(Self::expected_eddsa_commitment(
            key_id,
            tx_id,
            self.player_id,
            &r_point,
        )))
    }

    fn phase2_decommit_r(
        &self,
        key_id: &str,
        tx_id: &str,
        all_commitments: &BTreeMap<u64, EddsaCommitment>,
    ) -> CryptoResult<EddsaR> {
        let scratch = self.eddsa_scratch(key_id, tx_id)?;
        Self::check_player_set(&scratch.player_ids, all_commitments, "commitment")?;

        let nonce = math::eddsa_nonce_scalar(key_id, tx_id, self.player_id, &scratch.message);
        let r_point = math::eddsa_nonce_point(&nonce);
        let own = Self::expected_eddsa_commitment(key_id, tx_id, self.player_id, &r_point);
        let presented = all_commitments
            .get(&self.player_id)
            .ok_or_else(|| CryptoError::Internal("own commitment missing".to_string()))?;
        if presented.0 != own {
            return Err(CryptoError::ProofVerification(
                "own commitment does not match phase 1 output".to_string(),
            ));
        }

        self.scratch.update(key_id, tx_id, |s| {
            s.eddsa_commitments = Some(all_commitments.clone());
        })?;
        Ok(EddsaR(r_point.to_vec()))
    }

    fn phase3_broadcast_r(
        &self,
        key_id: &str,
        tx_id: &str,
        all_rs: &BTreeMap<u64, EddsaR>,
    ) -> CryptoResult<RsAndCommitments> {
        let scratch = self.eddsa_scratch(key_id, tx_id)?;
        let commitments = scratch.eddsa_commitments.as_ref().ok_or_else(|| {
            CryptoError::MissingPhaseState(format!("signing phase 2 never ran for tx {tx_id}"))
        })?;
        Self::check_player_set(&scratch.player_ids, all_rs, "nonce point")?;

        for (player, r) in all_rs {
            let commitment = commitments.get(player).ok_or_else(|| {
                CryptoError::ProofVerification(format!("no commitment stored for player {player}"))
            })?;
            let expected = Self::expected_eddsa_commitment(key_id, tx_id, *player, &r.0);
            if commitment.0 != expected {
                return Err(CryptoError::ProofVerification(format!(
                    "nonce point for player {player} does not open its commitment"
                )));
            }
        }

        self.scratch.update(key_id, tx_id, |s| {
            s.eddsa_rs = Some(all_rs.clone());
            s.eddsa_rs_verified = true;
        })?;

        Ok(RsAndCommitments {
            rs: all_rs.clone(),
            commitments: commitments.clone(),
        })
    }

    fn phase4_get_partial_signature(
        &self,
        key_id: &str,
        tx_id: &str,
        rs_and_commitments: &RsAndCommitments,
    ) -> CryptoResult<EddsaPartialSignature> {
        let scratch = self.eddsa_scratch(key_id, tx_id)?;
        let verified_rs = scratch.eddsa_rs.as_ref().filter(|_| scratch.eddsa_rs_verified);
        let verified_rs = verified_rs.ok_or_else(|| {
            CryptoError::MissingPhaseState(format!("signing phase 3 never ran for tx {tx_id}"))
        })?;

        // Phase 4 refuses to proceed without the verified commitments map.
        if rs_and_commitments.commitments.is_empty() {
            return Err(CryptoError::MissingPhaseState(
                "phase 4 requires the verified commitments map".to_string(),
            ));
        }
        if rs_and_commitments.rs != *verified_rs {
            return Err(CryptoError::ProofVerification(
                "presented nonce points do not match the verified set".to_string(),
            ));
        }

        let rs_bytes: BTreeMap<u64, Vec<u8>> = verified_rs
            .iter()
            .map(|(player, r)| (*player, r.0.clone()))
            .collect();
        let aggregated_r = math::eddsa_aggregate_r(&rs_bytes)?;

        let public_key_vec =
            math::group_public_key(Algorithm::EddsaEd25519, key_id, &scratch.player_ids)?;
        let public_key: [u8; 32] = public_key_vec.as_slice().try_into().map_err(|_| {
            CryptoError::Internal("ed25519 public key is not 32 bytes".to_string())
        })?;
        let challenge = math::eddsa_challenge(&aggregated_r, &public_key, &scratch.message);

        let (_, share) = self.persistency.load_key(key_id)?;
        let nonce = math::eddsa_nonce_scalar(key_id, tx_id, self.player_id, &scratch.message);
        let partial = math::eddsa_partial(&nonce, &challenge, &share);

        self.scratch.update(key_id, tx_id, |s| {
            let mut partials = BTreeMap::new();
            partials.insert(self.player_id, PartialSignature(partial.to_vec()));
            s.partial_signatures = Some(partials);
        })?;

        Ok(EddsaPartialSignature(partial.to_vec()))
    }

    fn phase5_get_final_signature(
        &self,
        key_id: &str,
        tx_id: &str,
        all_partial_signatures: &BTreeMap<u64, EddsaPartialSignature>,
    ) -> CryptoResult<EddsaSignature> {
        let scratch = self.eddsa_scratch(key_id, tx_id)?;
        if scratch.partial_signatures.is_none() {
            return Err(CryptoError::MissingPhaseState(format!(
                "signing phase 4 never ran for tx {tx_id}"
            )));
        }
        let rs = scratch.eddsa_rs.as_ref().ok_or_else(|| {
            CryptoError::MissingPhaseState(format!("signing phase 3 never ran for tx {tx_id}"))
        })?;
        Self::check_player_set(&scratch.player_ids, all_partial_signatures, "partial signature")?;

        let rs_bytes: BTreeMap<u64, Vec<u8>> =
            rs.iter().map(|(player, r)| (*player, r.0.clone())).collect();
        let aggregated_r = math::eddsa_aggregate_r(&rs_bytes)?;

        let mut partials = BTreeMap::new();
        for (player, partial) in all_partial_signatures {
            let bytes: [u8; 32] = partial.0.as_slice().try_into().map_err(|_| {
                CryptoError::Internal(format!(
                    "partial signature for player {player} is not 32 bytes"
                ))
            })?;
            partials.insert(*player, bytes);
        }
        let signature = math::eddsa_combine(aggregated_r, &partials)?;

        let public_key_vec =
            math::group_public_key(Algorithm::EddsaEd25519, key_id, &scratch.player_ids)?;
        let public_key: [u8; 32] = public_key_vec.as_slice().try_into().map_err(|_| {
            CryptoError::Internal("ed25519 public key is not 32 bytes".to_string())
        })?;
        math::eddsa_verify(&scratch.message, &public_key, &signature)?;

        self.scratch.remove(key_id, tx_id);
        Ok(signature)
    }
}

impl CryptoProvider for LocalCryptoProvider {
    fn key_generator(&self) -> &dyn KeyGenerator {
        self
    }

    fn ecdsa_signer(&self) -> &dyn EcdsaSigner {
        self
    }

    fn eddsa_signer(&self) -> &dyn EddsaSigner {
        self
    }

    fn provider_name(&self) -> &str {
        "local"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }
}
