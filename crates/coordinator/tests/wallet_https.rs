//! Wallet ingress tests: pipelining order, protobuf failures, and the
//! full HTTPS → nodes → signature path.

mod common;

use common::*;
use mpc_coordinator::https::{SessionConfig, WalletHttpsServer, WalletServerConfig};
use mpc_coordinator::{SigningService, WalletMessageRouter};
use mpc_network::TlsTimeouts;
use mpc_wire::proto::{
    self, wallet_coordinator_message::Payload, WalletCoordinatorMessage, WalletRequestHeader,
    WalletSigningRequest, WalletSigningResponse, WALLET_SIGNING_REQUEST, WALLET_STATUS_CHECK,
};
use std::sync::Arc;
use std::time::Duration;

fn server_config(port: u16) -> WalletServerConfig {
    WalletServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port,
        handler_threads: 8,
        session: SessionConfig::default(),
        timeouts: TlsTimeouts::default(),
    }
}

/// Router whose signing handler sleeps for `transaction_data[0] * 100` ms
/// and echoes the key id back, for ordering tests.
fn delay_router() -> Arc<WalletMessageRouter> {
    let mut router = WalletMessageRouter::empty();
    router.register(
        WALLET_SIGNING_REQUEST,
        Arc::new(|message: WalletCoordinatorMessage| {
            Box::pin(async move {
                let Some(Payload::SigningRequest(request)) = &message.payload else {
                    panic!("expected signing request");
                };
                let delay_ms = request.transaction_data.first().copied().unwrap_or(0) as u64 * 100;
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                let response = WalletCoordinatorMessage {
                    message_type: WALLET_SIGNING_REQUEST,
                    payload: Some(Payload::SigningResponse(WalletSigningResponse {
                        header: None,
                        key_id: request.key_id.clone(),
                        final_signature: Vec::new(),
                        shard_signatures: Vec::new(),
                        successful_shards: 0,
                    })),
                };
                (200, response)
            })
        }),
    );
    Arc::new(router)
}

fn signing_body(key_id: &str, request_id: &str, transaction_data: Vec<u8>) -> Vec<u8> {
    proto::encode(&WalletCoordinatorMessage {
        message_type: WALLET_SIGNING_REQUEST,
        payload: Some(Payload::SigningRequest(WalletSigningRequest {
            header: Some(WalletRequestHeader {
                request_id: request_id.to_string(),
                timestamp: 1_700_000_000,
                coordinator_id: "coordinator-1".to_string(),
            }),
            key_id: key_id.to_string(),
            transaction_data,
            threshold: 2,
            total_shards: 3,
        })),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_pipelined_responses_preserve_accept_order() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    let server = WalletHttpsServer::new(server_config(0), server_tls(dir.path()), delay_router());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let stream = wallet_connect(dir.path(), port).await;
    let (mut reader, mut writer) = split_wallet_stream(stream);

    // A is slowest (300 ms), B medium (100 ms), C immediate.
    write_post(&mut writer, "/api/v1/sign", Some("A"), &signing_body("a", "A", vec![3])).await;
    write_post(&mut writer, "/api/v1/sign", Some("B"), &signing_body("b", "B", vec![1])).await;
    write_post(&mut writer, "/api/v1/sign", Some("C"), &signing_body("c", "C", vec![0])).await;

    let mut order = Vec::new();
    for _ in 0..3 {
        let response = read_response(&mut reader).await;
        assert_eq!(response.status, 200);
        order.push(response.headers.get("x-request-id").cloned().unwrap());

        let decoded: WalletCoordinatorMessage = proto::decode(&response.body).unwrap();
        match decoded.payload {
            Some(Payload::SigningResponse(r)) => {
                // The echoed key id pairs with the request id.
                let expected = order.last().unwrap().to_ascii_lowercase();
                assert_eq!(r.key_id, expected);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
    assert_eq!(order, vec!["A", "B", "C"], "responses must leave in accept order");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_malformed_protobuf_is_400_and_connection_survives() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    let server = WalletHttpsServer::new(server_config(0), server_tls(dir.path()), delay_router());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let stream = wallet_connect(dir.path(), port).await;
    let (mut reader, mut writer) = split_wallet_stream(stream);

    // Wire type 7 is invalid, so this can never decode.
    write_post(&mut writer, "/api/v1/sign", Some("bad"), &[0xFF, 0xFF, 0xFF, 0x07]).await;
    let response = read_response(&mut reader).await;
    assert_eq!(response.status, 400);

    // Keep-alive: the same connection still serves a valid request.
    write_post(&mut writer, "/api/v1/sign", Some("good"), &signing_body("k", "good", vec![0])).await;
    let response = read_response(&mut reader).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("x-request-id").map(String::as_str), Some("good"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_malformed_http_is_400_and_closes() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    let server = WalletHttpsServer::new(server_config(0), server_tls(dir.path()), delay_router());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let stream = wallet_connect(dir.path(), port).await;
    let (mut reader, mut writer) = split_wallet_stream(stream);

    use tokio::io::AsyncWriteExt;
    writer.write_all(b"NONSENSE\r\n\r\n").await.unwrap();
    writer.flush().await.unwrap();

    let response = read_response(&mut reader).await;
    assert_eq!(response.status, 400);
    assert_eq!(
        response.headers.get("connection").map(String::as_str),
        Some("close")
    );

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_router_miss_is_500() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    // Empty router: every message type misses.
    let server = WalletHttpsServer::new(
        server_config(0),
        server_tls(dir.path()),
        Arc::new(WalletMessageRouter::empty()),
    );
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let stream = wallet_connect(dir.path(), port).await;
    let (mut reader, mut writer) = split_wallet_stream(stream);
    write_post(&mut writer, "/api/v1/sign", None, &signing_body("k", "r", vec![0])).await;
    let response = read_response(&mut reader).await;
    assert_eq!(response.status, 500);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_https_signing_end_to_end() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    write_test_pki(dir.path());

    let (servers, coordinator) =
        start_cluster(dir.path(), 3, TlsTimeouts::default(), None).await;
    let signing = Arc::new(SigningService::new(Arc::clone(&coordinator)));
    let router = Arc::new(WalletMessageRouter::new(signing, Arc::clone(&coordinator)));

    let server = WalletHttpsServer::new(server_config(0), server_tls(dir.path()), router);
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let stream = wallet_connect(dir.path(), port).await;
    let (mut reader, mut writer) = split_wallet_stream(stream);

    let started = std::time::Instant::now();
    write_post(
        &mut writer,
        "/api/v1/sign",
        Some("req-1"),
        &signing_body("k1", "req-1", vec![0x01; 32]),
    )
    .await;
    let response = read_response(&mut reader).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(response.status, 200);

    let decoded: WalletCoordinatorMessage = proto::decode(&response.body).unwrap();
    match decoded.payload {
        Some(Payload::SigningResponse(r)) => {
            let header = r.header.unwrap();
            assert!(header.success, "{}", header.error_message);
            assert_eq!(header.request_id, "req-1");
            assert_eq!(r.successful_shards, 3);
            assert_eq!(r.final_signature.len(), 65);
            assert_eq!(r.shard_signatures.len(), 3);
            assert_eq!(r.key_id, "k1");
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    // Status check rides the same connection.
    let status_body = proto::encode(&WalletCoordinatorMessage {
        message_type: WALLET_STATUS_CHECK,
        payload: Some(Payload::StatusRequest(proto::WalletStatusRequest {
            header: Some(WalletRequestHeader {
                request_id: "req-2".to_string(),
                timestamp: 1_700_000_000,
                coordinator_id: "coordinator-1".to_string(),
            }),
        })),
    });
    write_post(&mut writer, "/api/v1/sign", Some("req-2"), &status_body).await;
    let response = read_response(&mut reader).await;
    assert_eq!(response.status, 200);
    let decoded: WalletCoordinatorMessage = proto::decode(&response.body).unwrap();
    match decoded.payload {
        Some(Payload::StatusResponse(status)) => {
            assert_eq!(status.total_nodes, 3);
            assert_eq!(status.connected_nodes, 3);
            assert_eq!(status.nodes.len(), 3);
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    server.stop().await;
    coordinator.disconnect_all().await;
    for node in servers {
        node.stop().await;
    }
}
