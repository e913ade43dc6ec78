//! Five-phase fan-out: the coordinator drives signing and key generation
//! by broadcasting each phase's collected artifacts to every target node
//! and gathering that phase's outputs.

use crate::orchestrator::Coordinator;
use mpc_network::client::NodeClient;
use mpc_types::Algorithm;
use mpc_wire::proto::{
    coordinator_node_message::Payload, CoordinatorNodeMessage, KeygenPhaseRequest,
    SigningPhaseRequest, WireSignature,
};
use mpc_wire::MessageType;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("no connected nodes to sign with")]
    NoNodes,

    #[error("{available} connected nodes, threshold requires {required}")]
    InsufficientNodes { available: u32, required: u32 },

    #[error("phase {phase} failed on {} node(s): {}", failures.len(), summarize(failures))]
    PhaseFailed {
        phase: u32,
        failures: Vec<(String, String)>,
        successes: u32,
    },

    #[error("node returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("algorithm {0} cannot be signed with")]
    UnsupportedAlgorithm(Algorithm),
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(node, message)| format!("{node}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
pub struct SigningOutcome {
    pub key_id: String,
    pub algorithm: Algorithm,
    pub final_signature: Vec<u8>,
    pub shard_signatures: Vec<Vec<u8>>,
    pub successful_shards: u32,
}

#[derive(Debug, Clone)]
pub struct KeygenOutcome {
    pub key_id: String,
    pub algorithm: Algorithm,
    pub public_key: Vec<u8>,
}

pub struct SigningService {
    coordinator: Arc<Coordinator>,
    /// Algorithms learned from completed keygens; unknown keys default to
    /// secp256k1, matching the node-side provisioning default.
    key_directory: Mutex<HashMap<String, Algorithm>>,
}

impl SigningService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            key_directory: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_key_algorithm(&self, key_id: &str, algorithm: Algorithm) {
        self.key_directory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key_id.to_string(), algorithm);
    }

    pub fn key_algorithm(&self, key_id: &str) -> Algorithm {
        self.key_directory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key_id)
            .copied()
            .unwrap_or(Algorithm::EcdsaSecp256k1)
    }

    fn targets(
        &self,
        threshold: u32,
        total_shards: u32,
    ) -> Result<Vec<(Arc<NodeClient>, u64)>, SigningError> {
        let mut targets = self.coordinator.signing_targets();
        if targets.is_empty() {
            return Err(SigningError::NoNodes);
        }
        if total_shards > 0 && targets.len() > total_shards as usize {
            targets.truncate(total_shards as usize);
        }
        if (targets.len() as u32) < threshold {
            return Err(SigningError::InsufficientNodes {
                available: targets.len() as u32,
                required: threshold,
            });
        }
        Ok(targets)
    }

    /// Run one phase against every target and collect each player's
    /// artifact from the responses.
    async fn run_signing_phase(
        &self,
        targets: &[(Arc<NodeClient>, u64)],
        message_type: MessageType,
        build: impl Fn(u64) -> SigningPhaseRequest,
        phase: u32,
    ) -> Result<Vec<(u64, mpc_wire::proto::SigningPhaseResponse)>, SigningError> {
        let requests: Vec<CoordinatorNodeMessage> = targets
            .iter()
            .map(|(_, player_id)| {
                CoordinatorNodeMessage::signing_request(
                    message_type.as_u16() as u32,
                    build(*player_id),
                )
            })
            .collect();

        let results = futures::future::join_all(
            targets
                .iter()
                .zip(&requests)
                .map(|((client, _), request)| client.send_request(request)),
        )
        .await;

        let mut outputs = Vec::with_capacity(targets.len());
        let mut failures = Vec::new();
        for ((client, player_id), result) in targets.iter().zip(results) {
            match result {
                Ok(message) => match message.payload {
                    Some(Payload::SigningResponse(response)) if response.success => {
                        outputs.push((*player_id, response));
                    }
                    Some(Payload::SigningResponse(response)) => {
                        failures.push((client.node_id().to_string(), response.error_message));
                    }
                    Some(Payload::Error(error)) => {
                        failures.push((client.node_id().to_string(), error.error_message));
                    }
                    other => {
                        failures.push((
                            client.node_id().to_string(),
                            format!("unexpected payload: {other:?}"),
                        ));
                    }
                },
                Err(e) => failures.push((client.node_id().to_string(), e.to_string())),
            }
        }

        if !failures.is_empty() {
            return Err(SigningError::PhaseFailed {
                phase,
                failures,
                successes: outputs.len() as u32,
            });
        }
        Ok(outputs)
    }

    /// Drive a full 5-phase signing for one wallet request.
    pub async fn sign(
        &self,
        key_id: &str,
        transaction_data: &[u8],
        threshold: u32,
        total_shards: u32,
    ) -> Result<SigningOutcome, SigningError> {
        let algorithm = self.key_algorithm(key_id);
        let message_type = match algorithm {
            Algorithm::EddsaEd25519 => MessageType::EddsaSign,
            Algorithm::EcdsaStark => return Err(SigningError::UnsupportedAlgorithm(algorithm)),
            _ => MessageType::EcdsaSign,
        };

        // ECDSA signs a 32-byte digest of the transaction; EdDSA consumes
        // the raw bytes.
        let message: Vec<u8> = if algorithm.is_ecdsa() {
            Sha256::digest(transaction_data).to_vec()
        } else {
            transaction_data.to_vec()
        };

        let targets = self.targets(threshold, total_shards)?;
        let player_ids: Vec<u64> = targets.iter().map(|(_, player)| *player).collect();
        let tx_id = Uuid::new_v4().to_string();
        info!(key_id, %tx_id, %algorithm, players = ?player_ids, "starting signing");

        let base = |player_id: u64, phase: u32| SigningPhaseRequest {
            algorithm: algorithm.to_wire(),
            phase,
            key_id: key_id.to_string(),
            tx_id: tx_id.clone(),
            player_id,
            player_ids: player_ids.clone(),
            message: Vec::new(),
            artifacts: HashMap::new(),
            aux_artifacts: HashMap::new(),
        };

        // Phase 1: start signing, collect first-round artifacts.
        let phase1 = self
            .run_signing_phase(
                &targets,
                message_type,
                |player_id| SigningPhaseRequest {
                    message: message.clone(),
                    ..base(player_id, 1)
                },
                1,
            )
            .await?;
        let phase1_artifacts = collect_artifacts(&phase1);

        // Phase 2: previous artifacts fan back out.
        let phase2 = self
            .run_signing_phase(
                &targets,
                message_type,
                |player_id| SigningPhaseRequest {
                    artifacts: phase1_artifacts.clone(),
                    ..base(player_id, 2)
                },
                2,
            )
            .await?;
        let phase2_artifacts = collect_artifacts(&phase2);

        // Phase 3: for EdDSA this is the R broadcast; nodes return the
        // verified Rs-and-commitments set which we do not need to reparse,
        // since phase 4 rebuilds it from the phase 1/2 maps.
        let phase3 = self
            .run_signing_phase(
                &targets,
                message_type,
                |player_id| SigningPhaseRequest {
                    artifacts: phase2_artifacts.clone(),
                    ..base(player_id, 3)
                },
                3,
            )
            .await?;
        let phase3_artifacts = collect_artifacts(&phase3);

        // Phase 4: ECDSA consumes the deltas; EdDSA consumes the nonce
        // points plus the phase-1 commitments.
        let phase4 = self
            .run_signing_phase(
                &targets,
                message_type,
                |player_id| {
                    if algorithm.is_ecdsa() {
                        SigningPhaseRequest {
                            artifacts: phase3_artifacts.clone(),
                            ..base(player_id, 4)
                        }
                    } else {
                        SigningPhaseRequest {
                            artifacts: phase2_artifacts.clone(),
                            aux_artifacts: phase1_artifacts.clone(),
                            ..base(player_id, 4)
                        }
                    }
                },
                4,
            )
            .await?;
        let partials = collect_artifacts(&phase4);

        // Phase 5: everyone combines; the final signatures are identical.
        let phase5 = self
            .run_signing_phase(
                &targets,
                message_type,
                |player_id| SigningPhaseRequest {
                    artifacts: partials.clone(),
                    ..base(player_id, 5)
                },
                5,
            )
            .await?;

        let signature = phase5
            .first()
            .and_then(|(_, response)| response.signature.clone())
            .ok_or_else(|| {
                SigningError::MalformedResponse("phase 5 response without a signature".to_string())
            })?;
        let final_signature = encode_signature(&signature);

        let mut shard_signatures: Vec<(u64, Vec<u8>)> = partials.clone().into_iter().collect();
        shard_signatures.sort_by_key(|(player, _)| *player);

        debug!(key_id, %tx_id, bytes = final_signature.len(), "signature assembled");
        Ok(SigningOutcome {
            key_id: key_id.to_string(),
            algorithm,
            final_signature,
            shard_signatures: shard_signatures.into_iter().map(|(_, s)| s).collect(),
            successful_shards: phase5.len() as u32,
        })
    }

    /// Drive a full 5-phase distributed key generation.
    pub async fn generate_key(
        &self,
        key_id: &str,
        tenant_id: &str,
        algorithm: Algorithm,
        threshold: u32,
    ) -> Result<KeygenOutcome, SigningError> {
        let targets = self.targets(threshold, 0)?;
        let player_ids: Vec<u64> = targets.iter().map(|(_, player)| *player).collect();
        info!(key_id, %algorithm, players = ?player_ids, "starting keygen");

        let base = |player_id: u64, phase: u32| KeygenPhaseRequest {
            algorithm: algorithm.to_wire(),
            phase,
            key_id: key_id.to_string(),
            tenant_id: tenant_id.to_string(),
            player_id,
            player_ids: player_ids.clone(),
            threshold,
            artifacts: HashMap::new(),
        };

        let mut artifacts: HashMap<u64, Vec<u8>> = HashMap::new();
        let mut public_key = Vec::new();
        for phase in 1..=5u32 {
            let requests: Vec<CoordinatorNodeMessage> = targets
                .iter()
                .map(|(_, player_id)| {
                    CoordinatorNodeMessage::keygen_request(KeygenPhaseRequest {
                        artifacts: if phase == 1 {
                            HashMap::new()
                        } else {
                            artifacts.clone()
                        },
                        ..base(*player_id, phase)
                    })
                })
                .collect();

            let results = futures::future::join_all(
                targets
                    .iter()
                    .zip(&requests)
                    .map(|((client, _), request)| client.send_request(request)),
            )
            .await;

            let mut next_artifacts = HashMap::new();
            let mut failures = Vec::new();
            let mut successes = 0u32;
            for ((client, player_id), result) in targets.iter().zip(results) {
                match result {
                    Ok(message) => match message.payload {
                        Some(Payload::KeygenResponse(response)) if response.success => {
                            successes += 1;
                            if phase == 5 {
                                if let Some(result) = response.key_result {
                                    public_key = result.public_key;
                                }
                            } else {
                                next_artifacts.insert(*player_id, response.artifact);
                            }
                        }
                        Some(Payload::KeygenResponse(response)) => {
                            failures.push((client.node_id().to_string(), response.error_message));
                        }
                        Some(Payload::Error(error)) => {
                            failures.push((client.node_id().to_string(), error.error_message));
                        }
                        other => failures.push((
                            client.node_id().to_string(),
                            format!("unexpected payload: {other:?}"),
                        )),
                    },
                    Err(e) => failures.push((client.node_id().to_string(), e.to_string())),
                }
            }

            if !failures.is_empty() {
                return Err(SigningError::PhaseFailed {
                    phase,
                    failures,
                    successes,
                });
            }
            artifacts = next_artifacts;
        }

        if public_key.is_empty() {
            return Err(SigningError::MalformedResponse(
                "keygen phase 5 returned no public key".to_string(),
            ));
        }
        self.record_key_algorithm(key_id, algorithm);
        info!(key_id, %algorithm, "keygen complete");
        Ok(KeygenOutcome {
            key_id: key_id.to_string(),
            algorithm,
            public_key,
        })
    }
}

fn collect_artifacts(
    outputs: &[(u64, mpc_wire::proto::SigningPhaseResponse)],
) -> HashMap<u64, Vec<u8>> {
    outputs
        .iter()
        .map(|(player, response)| (*player, response.artifact.clone()))
        .collect()
}

fn encode_signature(signature: &WireSignature) -> Vec<u8> {
    let mut out = Vec::with_capacity(signature.r.len() + signature.s.len() + 1);
    out.extend_from_slice(&signature.r);
    out.extend_from_slice(&signature.s);
    if signature.has_v {
        out.push(signature.v as u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_signature_lengths() {
        let ecdsa = WireSignature {
            r: vec![1u8; 32],
            s: vec![2u8; 32],
            v: 1,
            has_v: true,
        };
        assert_eq!(encode_signature(&ecdsa).len(), 65);

        let eddsa = WireSignature {
            r: vec![1u8; 32],
            s: vec![2u8; 32],
            v: 0,
            has_v: false,
        };
        assert_eq!(encode_signature(&eddsa).len(), 64);
    }

    #[test]
    fn test_summarize_failures() {
        let failures = vec![
            ("n1".to_string(), "bad key".to_string()),
            ("n2".to_string(), "timeout".to_string()),
        ];
        assert_eq!(summarize(&failures), "n1: bad key; n2: timeout");
    }
}
