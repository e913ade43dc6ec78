//! Wire-type routing: an array indexed by `MessageType` whose entries are
//! handler functions. Unknown or unbound types produce a structured error
//! response instead of touching the connection.

use crate::handlers;
use mpc_crypto::CryptoProvider;
use mpc_network::server::MessageHandler;
use mpc_wire::proto::{self, coordinator_node_message::Payload, CoordinatorNodeMessage};
use mpc_wire::MessageType;
use std::sync::Arc;
use tracing::warn;

type HandlerFn = Arc<dyn Fn(&CoordinatorNodeMessage) -> CoordinatorNodeMessage + Send + Sync>;

pub struct NodeMessageRouter {
    handlers: [Option<HandlerFn>; MessageType::COUNT as usize],
}

impl NodeMessageRouter {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        let mut handlers: [Option<HandlerFn>; MessageType::COUNT as usize] = Default::default();

        let ecdsa_provider = Arc::clone(&provider);
        handlers[MessageType::EcdsaSign.as_u16() as usize] = Some(Arc::new(
            move |message: &CoordinatorNodeMessage| match &message.payload {
                Some(Payload::SigningRequest(request)) => CoordinatorNodeMessage::signing_response(
                    message.message_type,
                    handlers::handle_ecdsa_signing(&ecdsa_provider, request),
                ),
                _ => CoordinatorNodeMessage::error(
                    message.message_type,
                    "ECDSA signing frame without a signing request payload",
                ),
            },
        ));

        let eddsa_provider = Arc::clone(&provider);
        handlers[MessageType::EddsaSign.as_u16() as usize] = Some(Arc::new(
            move |message: &CoordinatorNodeMessage| match &message.payload {
                Some(Payload::SigningRequest(request)) => CoordinatorNodeMessage::signing_response(
                    message.message_type,
                    handlers::handle_eddsa_signing(&eddsa_provider, request),
                ),
                _ => CoordinatorNodeMessage::error(
                    message.message_type,
                    "EdDSA signing frame without a signing request payload",
                ),
            },
        ));

        let keygen_provider = Arc::clone(&provider);
        handlers[MessageType::Keygen.as_u16() as usize] = Some(Arc::new(
            move |message: &CoordinatorNodeMessage| match &message.payload {
                Some(Payload::KeygenRequest(request)) => CoordinatorNodeMessage::keygen_response(
                    handlers::handle_keygen(&keygen_provider, request),
                ),
                _ => CoordinatorNodeMessage::error(
                    message.message_type,
                    "keygen frame without a keygen request payload",
                ),
            },
        ));

        Self { handlers }
    }

    pub fn route(
        &self,
        message_type: MessageType,
        request: CoordinatorNodeMessage,
    ) -> CoordinatorNodeMessage {
        match self.handlers.get(message_type.as_u16() as usize).and_then(Option::as_ref) {
            Some(handler) => handler(&request),
            None => {
                warn!(?message_type, "no handler bound for message type");
                proto::CoordinatorNodeMessage::error(
                    request.message_type,
                    format!("no handler bound for message type {}", request.message_type),
                )
            }
        }
    }

    /// Adapt the router into the server's handler closure.
    pub fn into_message_handler(self: Arc<Self>) -> MessageHandler {
        Arc::new(move |message_type, request| self.route(message_type, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpc_crypto::{InMemoryPersistency, LocalCryptoProvider};
    use mpc_wire::proto::SigningPhaseRequest;

    fn router() -> NodeMessageRouter {
        NodeMessageRouter::new(Arc::new(LocalCryptoProvider::new(
            0,
            Arc::new(InMemoryPersistency::new()),
        )))
    }

    #[test]
    fn test_error_type_is_unbound() {
        let router = router();
        let request = CoordinatorNodeMessage::error(0, "probe");
        let response = router.route(MessageType::Error, request);
        assert!(!response.is_success());
    }

    #[test]
    fn test_payload_mismatch_yields_error_response() {
        let router = router();
        // Keygen frame carrying a signing payload.
        let request = CoordinatorNodeMessage::signing_request(
            MessageType::Keygen.as_u16() as u32,
            SigningPhaseRequest::default(),
        );
        let response = router.route(MessageType::Keygen, request);
        assert!(!response.is_success());
    }

    #[test]
    fn test_signing_routes_to_provider() {
        let router = router();
        let request = CoordinatorNodeMessage::signing_request(
            MessageType::EcdsaSign.as_u16() as u32,
            SigningPhaseRequest {
                algorithm: 0,
                phase: 1,
                key_id: "k1".to_string(),
                tx_id: "tx1".to_string(),
                player_id: 0,
                player_ids: vec![0],
                message: vec![1u8; 32],
                artifacts: Default::default(),
                aux_artifacts: Default::default(),
            },
        );
        let response = router.route(MessageType::EcdsaSign, request);
        assert!(response.is_success());
    }
}
