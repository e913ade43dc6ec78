//! One wallet HTTPS connection.
//!
//! A read task parses requests and submits them to the handler pool; a
//! write task pops a FIFO of response futures and writes each as it
//! resolves. The FIFO is what guarantees responses leave the wire in the
//! order requests were accepted, however the handler pool interleaves.

use crate::https::parser::{read_body, read_request_head, serialize_response, HttpParseError};
use crate::router::WalletMessageRouter;
use mpc_wire::proto::{self, WalletCoordinatorMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-connection policy knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_requests: usize,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// What the write task needs for one response slot.
struct ResponseSlot {
    future: oneshot::Receiver<(u16, WalletCoordinatorMessage)>,
    request_id: Option<String>,
    keep_alive: bool,
}

/// A response that bypasses the handler pool (parse failures).
fn ready_slot(
    status: u16,
    body: WalletCoordinatorMessage,
    request_id: Option<String>,
    keep_alive: bool,
) -> ResponseSlot {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send((status, body));
    ResponseSlot {
        future: rx,
        request_id,
        keep_alive,
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Drive one connection to completion. `activity` is shared with the idle
/// sweeper; `cancel` stops the session from outside.
pub async fn run_session(
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    router: Arc<WalletMessageRouter>,
    handler_permits: Arc<Semaphore>,
    config: SessionConfig,
    cancel: CancellationToken,
    activity: Arc<AtomicU64>,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    // FIFO of response futures; the single writer awaits them in order.
    let (slot_tx, mut slot_rx) = mpsc::channel::<ResponseSlot>(64);

    let write_cancel = cancel.clone();
    let write_activity = Arc::clone(&activity);
    let write_timeout = config.write_timeout;
    let writer_task = tokio::spawn(async move {
        while let Some(slot) = slot_rx.recv().await {
            // Head-of-line blocking is the point: responses go out in
            // accept order regardless of handler completion order.
            let (status, body) = match slot.future.await {
                Ok(response) => response,
                Err(_) => (
                    500,
                    WalletCoordinatorMessage {
                        message_type: 0,
                        payload: None,
                    },
                ),
            };
            let body_bytes = proto::encode(&body);
            let raw = serialize_response(
                status,
                &body_bytes,
                slot.keep_alive,
                slot.request_id.as_deref(),
            );
            let write = tokio::time::timeout(write_timeout, write_half.write_all(&raw)).await;
            match write {
                Ok(Ok(())) => {
                    let _ = write_half.flush().await;
                    write_activity.store(now_millis(), Ordering::Relaxed);
                }
                _ => {
                    write_cancel.cancel();
                    break;
                }
            }
            if !slot.keep_alive {
                write_cancel.cancel();
                break;
            }
        }
        let _ = tokio::time::timeout(Duration::from_secs(2), write_half.shutdown()).await;
    });

    let mut requests_handled = 0usize;
    loop {
        let head = tokio::select! {
            _ = cancel.cancelled() => break,
            head = tokio::time::timeout(config.idle_timeout, read_request_head(&mut reader)) => head,
        };
        let head = match head {
            Err(_) => {
                debug!("session idle timeout");
                break;
            }
            Ok(Err(e)) => {
                // Malformed HTTP is fatal to the connection; answer 400 and
                // stop reading.
                warn!(error = %e, "malformed wallet request");
                let _ = slot_tx
                    .send(ready_slot(
                        e.status_code(),
                        error_body(&e),
                        None,
                        false,
                    ))
                    .await;
                break;
            }
            Ok(Ok(None)) => {
                debug!("wallet closed the connection");
                break;
            }
            Ok(Ok(Some(head))) => head,
        };
        activity.store(now_millis(), Ordering::Relaxed);

        let body = match read_body(&mut reader, head.content_length).await {
            Ok(body) => body,
            Err(_) => break,
        };

        requests_handled += 1;
        let keep_alive = head.keep_alive && requests_handled < config.max_requests;

        let message = match proto::decode::<WalletCoordinatorMessage>(&body) {
            Ok(message) => message,
            Err(e) => {
                // A bad Protobuf body only fails this request; the
                // connection continues if keep-alive permits.
                debug!(error = %e, "protobuf body rejected");
                let sent = slot_tx
                    .send(ready_slot(
                        400,
                        parse_error_body(&e),
                        head.request_id.clone(),
                        keep_alive,
                    ))
                    .await;
                if sent.is_err() || !keep_alive {
                    break;
                }
                continue;
            }
        };

        let (response_tx, response_rx) = oneshot::channel();
        if slot_tx
            .send(ResponseSlot {
                future: response_rx,
                request_id: head.request_id.clone(),
                keep_alive,
            })
            .await
            .is_err()
        {
            break;
        }

        // Handler pool: bounded concurrency, completion order untied from
        // accept order.
        let router = Arc::clone(&router);
        let permits = Arc::clone(&handler_permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            let response = router.route(message).await;
            let _ = response_tx.send(response);
        });

        if !keep_alive {
            break;
        }
    }

    drop(slot_tx);
    let _ = writer_task.await;
    cancel.cancel();
}

fn error_body(error: &HttpParseError) -> WalletCoordinatorMessage {
    use mpc_wire::proto::{wallet_coordinator_message::Payload, WalletResponseHeader, WalletSigningResponse};
    WalletCoordinatorMessage {
        message_type: proto::WALLET_SIGNING_REQUEST,
        payload: Some(Payload::SigningResponse(WalletSigningResponse {
            header: Some(WalletResponseHeader {
                success: false,
                error_message: error.to_string(),
                request_id: String::new(),
                timestamp: now_millis() / 1000,
            }),
            ..WalletSigningResponse::default()
        })),
    }
}

fn parse_error_body(error: &prost::DecodeError) -> WalletCoordinatorMessage {
    use mpc_wire::proto::{wallet_coordinator_message::Payload, WalletResponseHeader, WalletSigningResponse};
    WalletCoordinatorMessage {
        message_type: proto::WALLET_SIGNING_REQUEST,
        payload: Some(Payload::SigningResponse(WalletSigningResponse {
            header: Some(WalletResponseHeader {
                success: false,
                error_message: format!("protobuf parse failed: {error}"),
                request_id: String::new(),
                timestamp: now_millis() / 1000,
            }),
            ..WalletSigningResponse::default()
        })),
    }
}
