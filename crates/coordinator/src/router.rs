//! Wallet message routing: `message_type → async handler` with O(1)
//! dispatch, mirroring the node-side router.

use crate::orchestrator::Coordinator;
use crate::signing::{SigningError, SigningService};
use futures::future::BoxFuture;
use mpc_wire::proto::{
    wallet_coordinator_message::Payload, WalletCoordinatorMessage, WalletNodeStatus,
    WalletResponseHeader, WalletSigningResponse, WalletStatusResponse, WALLET_SIGNING_REQUEST,
    WALLET_STATUS_CHECK,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const WALLET_TYPE_BASE: u32 = 1001;
const WALLET_TYPE_COUNT: usize = 2;

/// Async handler returning the HTTP status and the response body.
pub type WalletHandler = Arc<
    dyn Fn(WalletCoordinatorMessage) -> BoxFuture<'static, (u16, WalletCoordinatorMessage)>
        + Send
        + Sync,
>;

pub struct WalletMessageRouter {
    handlers: [Option<WalletHandler>; WALLET_TYPE_COUNT],
}

impl WalletMessageRouter {
    pub fn empty() -> Self {
        Self {
            handlers: [None, None],
        }
    }

    /// Full router wired to the signing service and orchestrator.
    pub fn new(signing: Arc<SigningService>, coordinator: Arc<Coordinator>) -> Self {
        let mut router = Self::empty();
        router.register(WALLET_SIGNING_REQUEST, signing_handler(signing));
        router.register(WALLET_STATUS_CHECK, status_handler(coordinator));
        router
    }

    pub fn register(&mut self, message_type: u32, handler: WalletHandler) -> bool {
        match slot(message_type) {
            Some(index) => {
                self.handlers[index] = Some(handler);
                true
            }
            None => false,
        }
    }

    /// Dispatch one wallet message. A miss (unknown or unbound type) is a
    /// 500 with a structured error body.
    pub async fn route(&self, message: WalletCoordinatorMessage) -> (u16, WalletCoordinatorMessage) {
        let message_type = message.message_type;
        let handler = slot(message_type).and_then(|index| self.handlers[index].clone());
        match handler {
            Some(handler) => handler(message).await,
            None => {
                warn!(message_type, "no wallet handler bound");
                (
                    500,
                    error_response(
                        message_type,
                        &message,
                        format!("no handler for message type {message_type}"),
                    ),
                )
            }
        }
    }
}

fn slot(message_type: u32) -> Option<usize> {
    let index = message_type.checked_sub(WALLET_TYPE_BASE)? as usize;
    (index < WALLET_TYPE_COUNT).then_some(index)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn request_id_of(message: &WalletCoordinatorMessage) -> String {
    match &message.payload {
        Some(Payload::SigningRequest(request)) => request
            .header
            .as_ref()
            .map(|h| h.request_id.clone())
            .unwrap_or_default(),
        Some(Payload::StatusRequest(request)) => request
            .header
            .as_ref()
            .map(|h| h.request_id.clone())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn response_header(success: bool, error_message: String, request_id: String) -> WalletResponseHeader {
    WalletResponseHeader {
        success,
        error_message,
        request_id,
        timestamp: unix_seconds(),
    }
}

/// Error body matching the request's payload family.
fn error_response(
    message_type: u32,
    request: &WalletCoordinatorMessage,
    error_message: String,
) -> WalletCoordinatorMessage {
    let header = response_header(false, error_message, request_id_of(request));
    let payload = match message_type {
        WALLET_STATUS_CHECK => Payload::StatusResponse(WalletStatusResponse {
            header: Some(header),
            ..WalletStatusResponse::default()
        }),
        _ => Payload::SigningResponse(WalletSigningResponse {
            header: Some(header),
            ..WalletSigningResponse::default()
        }),
    };
    WalletCoordinatorMessage {
        message_type,
        payload: Some(payload),
    }
}

fn signing_handler(signing: Arc<SigningService>) -> WalletHandler {
    Arc::new(move |message: WalletCoordinatorMessage| {
        let signing = Arc::clone(&signing);
        Box::pin(async move {
            let Some(Payload::SigningRequest(request)) = &message.payload else {
                return (
                    400,
                    error_response(
                        message.message_type,
                        &message,
                        "signing request payload missing".to_string(),
                    ),
                );
            };
            let request_id = request_id_of(&message);
            info!(
                key_id = %request.key_id,
                request_id = %request_id,
                threshold = request.threshold,
                total_shards = request.total_shards,
                "wallet signing request"
            );

            match signing
                .sign(
                    &request.key_id,
                    &request.transaction_data,
                    request.threshold,
                    request.total_shards,
                )
                .await
            {
                Ok(outcome) => (
                    200,
                    WalletCoordinatorMessage {
                        message_type: message.message_type,
                        payload: Some(Payload::SigningResponse(WalletSigningResponse {
                            header: Some(response_header(true, String::new(), request_id)),
                            key_id: outcome.key_id,
                            final_signature: outcome.final_signature,
                            shard_signatures: outcome.shard_signatures,
                            successful_shards: outcome.successful_shards,
                        })),
                    },
                ),
                Err(e) => {
                    warn!(key_id = %request.key_id, error = %e, "signing failed");
                    let successful_shards = match &e {
                        SigningError::PhaseFailed { successes, .. } => *successes,
                        _ => 0,
                    };
                    (
                        200,
                        WalletCoordinatorMessage {
                            message_type: message.message_type,
                            payload: Some(Payload::SigningResponse(WalletSigningResponse {
                                header: Some(response_header(false, e.to_string(), request_id)),
                                key_id: request.key_id.clone(),
                                final_signature: Vec::new(),
                                shard_signatures: Vec::new(),
                                successful_shards,
                            })),
                        },
                    )
                }
            }
        })
    })
}

fn status_handler(coordinator: Arc<Coordinator>) -> WalletHandler {
    Arc::new(move |message: WalletCoordinatorMessage| {
        let coordinator = Arc::clone(&coordinator);
        Box::pin(async move {
            let request_id = request_id_of(&message);
            let stats = coordinator.get_stats();
            let nodes: Vec<WalletNodeStatus> = coordinator
                .node_summaries()
                .into_iter()
                .map(|(node_id, platform, connected, shard_index)| WalletNodeStatus {
                    node_id,
                    platform: platform.to_string(),
                    connected,
                    shard_index,
                })
                .collect();
            (
                200,
                WalletCoordinatorMessage {
                    message_type: message.message_type,
                    payload: Some(Payload::StatusResponse(WalletStatusResponse {
                        header: Some(response_header(true, String::new(), request_id)),
                        total_nodes: stats.total_nodes,
                        connected_nodes: stats.connected_nodes,
                        uptime_seconds: stats.uptime_seconds,
                        nodes,
                    })),
                },
            )
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_router_miss_is_500() {
        let router = WalletMessageRouter::empty();
        let message = WalletCoordinatorMessage {
            message_type: 4242,
            payload: None,
        };
        let (status, response) = router.route(message).await;
        assert_eq!(status, 500);
        match response.payload {
            Some(Payload::SigningResponse(r)) => {
                assert!(!r.header.unwrap().success);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_registered_handler_is_dispatched() {
        let mut router = WalletMessageRouter::empty();
        router.register(
            WALLET_SIGNING_REQUEST,
            Arc::new(|message| {
                Box::pin(async move {
                    (
                        200,
                        error_response(message.message_type, &message, "marker".to_string()),
                    )
                })
            }),
        );
        let (status, response) = router
            .route(WalletCoordinatorMessage {
                message_type: WALLET_SIGNING_REQUEST,
                payload: None,
            })
            .await;
        assert_eq!(status, 200);
        match response.payload {
            Some(Payload::SigningResponse(r)) => {
                assert_eq!(r.header.unwrap().error_message, "marker");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_slot_bounds() {
        assert_eq!(slot(1001), Some(0));
        assert_eq!(slot(1002), Some(1));
        assert_eq!(slot(1003), None);
        assert_eq!(slot(0), None);
    }
}
