//! End-to-end signing over a real 3-node loopback cluster.

mod common;

use common::*;
use mpc_coordinator::{SigningError, SigningService};
use mpc_crypto::local::{ecdsa_verify, eddsa_verify, group_public_key};
use mpc_crypto::{EcdsaSignature, EddsaSignature};
use mpc_network::TlsTimeouts;
use mpc_types::Algorithm;
use mpc_wire::proto::{CoordinatorNodeMessage, SigningPhaseRequest};
use mpc_wire::MessageType;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_three_node_ecdsa_signing_happy_path() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    let (servers, coordinator) =
        start_cluster(dir.path(), 3, TlsTimeouts::default(), None).await;
    let signing = SigningService::new(Arc::clone(&coordinator));

    let transaction_data = vec![0x01u8; 32];
    let started = std::time::Instant::now();
    let outcome = signing.sign("k1", &transaction_data, 2, 3).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(outcome.algorithm, Algorithm::EcdsaSecp256k1);
    assert_eq!(outcome.successful_shards, 3);
    assert_eq!(outcome.shard_signatures.len(), 3);
    assert_eq!(outcome.final_signature.len(), 65, "r||s||v for ECDSA");

    // The signature is a real ECDSA signature over SHA-256(tx) under the
    // aggregate key of players {0,1,2}.
    let message_hash: [u8; 32] = Sha256::digest(&transaction_data).into();
    let public_key = group_public_key(Algorithm::EcdsaSecp256k1, "k1", &[0, 1, 2]).unwrap();
    let signature = EcdsaSignature {
        r: outcome.final_signature[..32].try_into().unwrap(),
        s: outcome.final_signature[32..64].try_into().unwrap(),
        v: outcome.final_signature[64],
    };
    assert!(signature.v <= 1);
    ecdsa_verify(
        Algorithm::EcdsaSecp256k1,
        &message_hash,
        &public_key,
        &signature,
    )
    .unwrap();

    coordinator.disconnect_all().await;
    for server in servers {
        server.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_keygen_then_eddsa_signing() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    let (servers, coordinator) =
        start_cluster(dir.path(), 3, TlsTimeouts::default(), None).await;
    let signing = SigningService::new(Arc::clone(&coordinator));

    let keygen = signing
        .generate_key("k-ed", "tenant-a", Algorithm::EddsaEd25519, 2)
        .await
        .unwrap();
    assert_eq!(keygen.public_key.len(), 32);
    assert_eq!(
        keygen.public_key,
        group_public_key(Algorithm::EddsaEd25519, "k-ed", &[0, 1, 2]).unwrap()
    );
    assert_eq!(signing.key_algorithm("k-ed"), Algorithm::EddsaEd25519);

    let message = b"unhashed transfer payload".to_vec();
    let outcome = signing.sign("k-ed", &message, 2, 3).await.unwrap();
    assert_eq!(outcome.algorithm, Algorithm::EddsaEd25519);
    assert_eq!(outcome.final_signature.len(), 64, "R||s, no recovery byte");

    let public_key: [u8; 32] = keygen.public_key.as_slice().try_into().unwrap();
    let signature = EddsaSignature {
        r: outcome.final_signature[..32].try_into().unwrap(),
        s: outcome.final_signature[32..].try_into().unwrap(),
    };
    eddsa_verify(&message, &public_key, &signature).unwrap();

    coordinator.disconnect_all().await;
    for server in servers {
        server.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_duplicate_keygen_fails_second_time() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    let (servers, coordinator) =
        start_cluster(dir.path(), 3, TlsTimeouts::default(), None).await;
    let signing = SigningService::new(Arc::clone(&coordinator));

    signing
        .generate_key("k-once", "tenant-a", Algorithm::EcdsaSecp256k1, 2)
        .await
        .unwrap();
    // A key_id is created exactly once per node.
    let err = signing
        .generate_key("k-once", "tenant-a", Algorithm::EcdsaSecp256k1, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, SigningError::PhaseFailed { .. }));

    coordinator.disconnect_all().await;
    for server in servers {
        server.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_broadcast_with_slow_node_returns_false_and_leaves_pending() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    // Requests time out after 1 s; node 1 stalls for 4 s.
    let timeouts = TlsTimeouts {
        read: Duration::from_secs(1),
        ..TlsTimeouts::default()
    };
    let (servers, coordinator) = start_cluster(
        dir.path(),
        3,
        timeouts,
        Some((1, Duration::from_secs(4))),
    )
    .await;

    let message = CoordinatorNodeMessage::signing_request(
        MessageType::EcdsaSign.as_u16() as u32,
        SigningPhaseRequest {
            algorithm: Algorithm::EcdsaSecp256k1.to_wire(),
            phase: 1,
            key_id: "k-slow".to_string(),
            tx_id: "tx-slow".to_string(),
            player_id: 0,
            player_ids: vec![0, 1, 2],
            message: vec![0x02u8; 32],
            artifacts: Default::default(),
            aux_artifacts: Default::default(),
        },
    );

    let all_success = coordinator.broadcast_to_all_connected(&message).await;
    assert!(!all_success, "slow node must fail the broadcast");

    // Fast nodes answered; the slow node's pending entry stays until its
    // late response arrives and is silently dropped.
    assert!(coordinator.node("n0").unwrap().messages_received() >= 1);
    assert!(coordinator.node("n2").unwrap().messages_received() >= 1);
    assert_eq!(coordinator.node("n1").unwrap().pending_request_count(), 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(coordinator.node("n1").unwrap().pending_request_count(), 0);
    assert!(coordinator.node("n1").unwrap().is_connected());

    coordinator.disconnect_all().await;
    for server in servers {
        server.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_insufficient_nodes_rejected() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    let (servers, coordinator) =
        start_cluster(dir.path(), 2, TlsTimeouts::default(), None).await;
    let signing = SigningService::new(Arc::clone(&coordinator));

    let err = signing.sign("k1", &[0u8; 32], 3, 3).await.unwrap_err();
    assert!(matches!(err, SigningError::InsufficientNodes { .. }));

    coordinator.disconnect_all().await;
    for server in servers {
        server.stop().await;
    }
}
