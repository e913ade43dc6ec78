//! Phase handlers: decode one wire request, drive the matching provider
//! phase, and encode the response. Provider failures become
//! `success = false` responses; the connection is never torn down here.

use mpc_crypto::{
    Commitment, CryptoError, CryptoProvider, Decommitment, EddsaCommitment,
    EddsaPartialSignature, EddsaR, MtaDelta, MtaRequest, MtaResponse, PaillierProof,
    PartialSignature, RsAndCommitments, ZkProof,
};
use mpc_types::Algorithm;
use mpc_wire::proto::{
    self, KeygenPhaseRequest, KeygenPhaseResponse, RsAndCommitments as WireRsAndCommitments,
    SigningPhaseRequest, SigningPhaseResponse, WireKeyResult, WireSignature,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

fn artifact_map<T: From<Vec<u8>>>(raw: &std::collections::HashMap<u64, Vec<u8>>) -> BTreeMap<u64, T> {
    raw.iter()
        .map(|(player, bytes)| (*player, T::from(bytes.clone())))
        .collect()
}

fn signing_failure(phase: u32, error: &CryptoError) -> SigningPhaseResponse {
    SigningPhaseResponse {
        success: false,
        error_message: error.to_string(),
        phase,
        artifact: Vec::new(),
        signature: None,
    }
}

fn signing_success(phase: u32, artifact: Vec<u8>) -> SigningPhaseResponse {
    SigningPhaseResponse {
        success: true,
        error_message: String::new(),
        phase,
        artifact,
        signature: None,
    }
}

/// ECDSA signing phases 1-5.
pub fn handle_ecdsa_signing(
    provider: &Arc<dyn CryptoProvider>,
    request: &SigningPhaseRequest,
) -> SigningPhaseResponse {
    let signer = provider.ecdsa_signer();
    let key_id = request.key_id.as_str();
    let tx_id = request.tx_id.as_str();
    debug!(key_id, tx_id, phase = request.phase, "ecdsa signing phase");

    let result = match request.phase {
        1 => signer
            .phase1_start_signing(key_id, tx_id, &request.message, &request.player_ids)
            .map(|out| signing_success(1, out.into_bytes())),
        2 => signer
            .phase2_mta_response(key_id, tx_id, &artifact_map::<MtaRequest>(&request.artifacts))
            .map(|out| signing_success(2, out.into_bytes())),
        3 => signer
            .phase3_mta_verify(key_id, tx_id, &artifact_map::<MtaResponse>(&request.artifacts))
            .map(|out| signing_success(3, out.into_bytes())),
        4 => signer
            .phase4_get_partial_signature(
                key_id,
                tx_id,
                &artifact_map::<MtaDelta>(&request.artifacts),
            )
            .map(|out| signing_success(4, out.into_bytes())),
        5 => signer
            .phase5_get_final_signature(
                key_id,
                tx_id,
                &artifact_map::<PartialSignature>(&request.artifacts),
            )
            .map(|signature| SigningPhaseResponse {
                success: true,
                error_message: String::new(),
                phase: 5,
                artifact: Vec::new(),
                signature: Some(WireSignature {
                    r: signature.r.to_vec(),
                    s: signature.s.to_vec(),
                    v: signature.v as u32,
                    has_v: true,
                }),
            }),
        other => Err(CryptoError::Internal(format!(
            "unknown ECDSA signing phase: {other}"
        ))),
    };

    result.unwrap_or_else(|e| signing_failure(request.phase, &e))
}

/// EdDSA signing phases 1-5. Phase 3 returns the verified
/// `RsAndCommitments` encoded in the artifact; phase 4 reads the nonce
/// points from `artifacts` and the commitments from `aux_artifacts`.
pub fn handle_eddsa_signing(
    provider: &Arc<dyn CryptoProvider>,
    request: &SigningPhaseRequest,
) -> SigningPhaseResponse {
    let signer = provider.eddsa_signer();
    let key_id = request.key_id.as_str();
    let tx_id = request.tx_id.as_str();
    debug!(key_id, tx_id, phase = request.phase, "eddsa signing phase");

    let result = match request.phase {
        1 => signer
            .phase1_start_signing(key_id, tx_id, &request.message, &request.player_ids)
            .map(|out| signing_success(1, out.into_bytes())),
        2 => signer
            .phase2_decommit_r(
                key_id,
                tx_id,
                &artifact_map::<EddsaCommitment>(&request.artifacts),
            )
            .map(|out| signing_success(2, out.into_bytes())),
        3 => signer
            .phase3_broadcast_r(key_id, tx_id, &artifact_map::<EddsaR>(&request.artifacts))
            .map(|out| {
                let wire = WireRsAndCommitments {
                    rs: out.rs.iter().map(|(p, r)| (*p, r.0.clone())).collect(),
                    commitments: out
                        .commitments
                        .iter()
                        .map(|(p, c)| (*p, c.0.clone()))
                        .collect(),
                };
                signing_success(3, proto::encode(&wire))
            }),
        4 => {
            let rs_and_commitments = RsAndCommitments {
                rs: artifact_map::<EddsaR>(&request.artifacts),
                commitments: artifact_map::<EddsaCommitment>(&request.aux_artifacts),
            };
            signer
                .phase4_get_partial_signature(key_id, tx_id, &rs_and_commitments)
                .map(|out| signing_success(4, out.into_bytes()))
        }
        5 => signer
            .phase5_get_final_signature(
                key_id,
                tx_id,
                &artifact_map::<EddsaPartialSignature>(&request.artifacts),
            )
            .map(|signature| SigningPhaseResponse {
                success: true,
                error_message: String::new(),
                phase: 5,
                artifact: Vec::new(),
                signature: Some(WireSignature {
                    r: signature.r.to_vec(),
                    s: signature.s.to_vec(),
                    v: 0,
                    has_v: false,
                }),
            }),
        other => Err(CryptoError::Internal(format!(
            "unknown EdDSA signing phase: {other}"
        ))),
    };

    result.unwrap_or_else(|e| signing_failure(request.phase, &e))
}

fn keygen_failure(phase: u32, error: &CryptoError) -> KeygenPhaseResponse {
    KeygenPhaseResponse {
        success: false,
        error_message: error.to_string(),
        phase,
        artifact: Vec::new(),
        key_result: None,
    }
}

fn keygen_success(phase: u32, artifact: Vec<u8>) -> KeygenPhaseResponse {
    KeygenPhaseResponse {
        success: true,
        error_message: String::new(),
        phase,
        artifact,
        key_result: None,
    }
}

/// Key generation phases 1-5.
pub fn handle_keygen(
    provider: &Arc<dyn CryptoProvider>,
    request: &KeygenPhaseRequest,
) -> KeygenPhaseResponse {
    let generator = provider.key_generator();
    let key_id = request.key_id.as_str();
    debug!(key_id, phase = request.phase, "keygen phase");

    let result = match request.phase {
        1 => match Algorithm::from_wire(request.algorithm) {
            Ok(algorithm) => generator
                .phase1_generate_commitment(
                    key_id,
                    &request.tenant_id,
                    algorithm,
                    &request.player_ids,
                    request.threshold,
                )
                .map(|out| keygen_success(1, out.into_bytes())),
            Err(e) => Err(CryptoError::InvalidAlgorithm(e.to_string())),
        },
        2 => generator
            .phase2_generate_decommitment(key_id, &artifact_map::<Commitment>(&request.artifacts))
            .map(|out| keygen_success(2, out.into_bytes())),
        3 => generator
            .phase3_generate_zk_proof(key_id, &artifact_map::<Decommitment>(&request.artifacts))
            .map(|out| keygen_success(3, out.into_bytes())),
        4 => generator
            .phase4_verify_and_generate_paillier_proof(
                key_id,
                &artifact_map::<ZkProof>(&request.artifacts),
            )
            .map(|out| keygen_success(4, out.into_bytes())),
        5 => generator
            .phase5_create_public_key(key_id, &artifact_map::<PaillierProof>(&request.artifacts))
            .map(|result| KeygenPhaseResponse {
                success: true,
                error_message: String::new(),
                phase: 5,
                artifact: Vec::new(),
                key_result: Some(WireKeyResult {
                    public_key: result.public_key,
                    algorithm: result.algorithm.to_wire(),
                    player_id: result.player_id.as_u64(),
                }),
            }),
        other => Err(CryptoError::Internal(format!(
            "unknown keygen phase: {other}"
        ))),
    };

    result.unwrap_or_else(|e| keygen_failure(request.phase, &e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpc_crypto::{InMemoryPersistency, LocalCryptoProvider};
    use std::collections::HashMap;

    fn provider(player: u64) -> Arc<dyn CryptoProvider> {
        Arc::new(LocalCryptoProvider::new(
            player,
            Arc::new(InMemoryPersistency::new()),
        ))
    }

    #[test]
    fn test_ecdsa_phase1_success() {
        let provider = provider(0);
        let request = SigningPhaseRequest {
            algorithm: Algorithm::EcdsaSecp256k1.to_wire(),
            phase: 1,
            key_id: "k1".to_string(),
            tx_id: "tx1".to_string(),
            player_id: 0,
            player_ids: vec![0, 1, 2],
            message: vec![0xAB; 32],
            artifacts: HashMap::new(),
            aux_artifacts: HashMap::new(),
        };
        let response = handle_ecdsa_signing(&provider, &request);
        assert!(response.success, "{}", response.error_message);
        assert!(!response.artifact.is_empty());
    }

    #[test]
    fn test_ecdsa_out_of_order_phase_is_failure_response() {
        let provider = provider(0);
        let request = SigningPhaseRequest {
            algorithm: Algorithm::EcdsaSecp256k1.to_wire(),
            phase: 3,
            key_id: "k1".to_string(),
            tx_id: "tx-unknown".to_string(),
            player_id: 0,
            player_ids: vec![0],
            message: Vec::new(),
            artifacts: HashMap::new(),
            aux_artifacts: HashMap::new(),
        };
        let response = handle_ecdsa_signing(&provider, &request);
        assert!(!response.success);
        assert!(response.error_message.contains("missing phase state"));
    }

    #[test]
    fn test_unknown_phase_rejected() {
        let provider = provider(0);
        let request = SigningPhaseRequest {
            algorithm: Algorithm::EcdsaSecp256k1.to_wire(),
            phase: 9,
            key_id: "k1".to_string(),
            tx_id: "tx1".to_string(),
            player_id: 0,
            player_ids: vec![0],
            message: vec![0u8; 32],
            artifacts: HashMap::new(),
            aux_artifacts: HashMap::new(),
        };
        assert!(!handle_ecdsa_signing(&provider, &request).success);
    }

    #[test]
    fn test_keygen_phase1_rejects_unknown_algorithm() {
        let provider = provider(0);
        let request = KeygenPhaseRequest {
            algorithm: 99,
            phase: 1,
            key_id: "k1".to_string(),
            tenant_id: "t".to_string(),
            player_id: 0,
            player_ids: vec![0, 1],
            threshold: 2,
            artifacts: HashMap::new(),
        };
        let response = handle_keygen(&provider, &request);
        assert!(!response.success);
        assert!(response.error_message.contains("invalid algorithm"));
    }
}
