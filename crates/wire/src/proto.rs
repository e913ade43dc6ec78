//! Protobuf message bodies, maintained by hand in prost's generated style.
//!
//! `CoordinatorNodeMessage` travels inside the 32-byte frame between the
//! coordinator and nodes; `WalletCoordinatorMessage` is the HTTPS body
//! between the wallet server and the coordinator.

use prost::Message;
use std::collections::HashMap;

/// Wallet-facing message type discriminants.
pub const WALLET_SIGNING_REQUEST: u32 = 1001;
pub const WALLET_STATUS_CHECK: u32 = 1002;
pub const WALLET_MAX_MESSAGE_TYPE: u32 = 1003;

// ---------------------------------------------------------------------------
// Coordinator ↔ node
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CoordinatorNodeMessage {
    #[prost(uint32, tag = "1")]
    pub message_type: u32,
    #[prost(oneof = "coordinator_node_message::Payload", tags = "2, 3, 4, 5, 6")]
    pub payload: ::core::option::Option<coordinator_node_message::Payload>,
}

pub mod coordinator_node_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        SigningRequest(super::SigningPhaseRequest),
        #[prost(message, tag = "3")]
        SigningResponse(super::SigningPhaseResponse),
        #[prost(message, tag = "4")]
        KeygenRequest(super::KeygenPhaseRequest),
        #[prost(message, tag = "5")]
        KeygenResponse(super::KeygenPhaseResponse),
        #[prost(message, tag = "6")]
        Error(super::ErrorResponse),
    }
}

/// One phase of the 5-phase signing protocol, addressed to one player.
/// `artifacts` carries the previous phase's per-player outputs;
/// `aux_artifacts` carries the EdDSA phase-4 commitments map.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SigningPhaseRequest {
    #[prost(uint32, tag = "1")]
    pub algorithm: u32,
    #[prost(uint32, tag = "2")]
    pub phase: u32,
    #[prost(string, tag = "3")]
    pub key_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub tx_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub player_id: u64,
    #[prost(uint64, repeated, tag = "6")]
    pub player_ids: ::prost::alloc::vec::Vec<u64>,
    #[prost(bytes = "vec", tag = "7")]
    pub message: ::prost::alloc::vec::Vec<u8>,
    #[prost(map = "uint64, bytes", tag = "8")]
    pub artifacts: ::std::collections::HashMap<u64, ::prost::alloc::vec::Vec<u8>>,
    #[prost(map = "uint64, bytes", tag = "9")]
    pub aux_artifacts: ::std::collections::HashMap<u64, ::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SigningPhaseResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub phase: u32,
    /// This player's output for the phase (empty on failure).
    #[prost(bytes = "vec", tag = "4")]
    pub artifact: ::prost::alloc::vec::Vec<u8>,
    /// Populated by phase 5 only.
    #[prost(message, optional, tag = "5")]
    pub signature: ::core::option::Option<WireSignature>,
}

/// Final signature; `has_v` distinguishes ECDSA (r, s, v) from EdDSA (R, s).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireSignature {
    #[prost(bytes = "vec", tag = "1")]
    pub r: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub s: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub v: u32,
    #[prost(bool, tag = "4")]
    pub has_v: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeygenPhaseRequest {
    #[prost(uint32, tag = "1")]
    pub algorithm: u32,
    #[prost(uint32, tag = "2")]
    pub phase: u32,
    #[prost(string, tag = "3")]
    pub key_id: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub tenant_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "5")]
    pub player_id: u64,
    #[prost(uint64, repeated, tag = "6")]
    pub player_ids: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint32, tag = "7")]
    pub threshold: u32,
    #[prost(map = "uint64, bytes", tag = "8")]
    pub artifacts: ::std::collections::HashMap<u64, ::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeygenPhaseResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub phase: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub artifact: ::prost::alloc::vec::Vec<u8>,
    /// Populated by phase 5 only.
    #[prost(message, optional, tag = "5")]
    pub key_result: ::core::option::Option<WireKeyResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireKeyResult {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub algorithm: u32,
    #[prost(uint64, tag = "3")]
    pub player_id: u64,
}

/// Structured error returned for unknown or unbound message types.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorResponse {
    #[prost(uint32, tag = "1")]
    pub original_message_type: u32,
    #[prost(string, tag = "2")]
    pub error_message: ::prost::alloc::string::String,
}

/// EdDSA phase-3 output: every player's revealed nonce point alongside the
/// phase-1 commitments they were checked against.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RsAndCommitments {
    #[prost(map = "uint64, bytes", tag = "1")]
    pub rs: ::std::collections::HashMap<u64, ::prost::alloc::vec::Vec<u8>>,
    #[prost(map = "uint64, bytes", tag = "2")]
    pub commitments: ::std::collections::HashMap<u64, ::prost::alloc::vec::Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Wallet ↔ coordinator
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalletCoordinatorMessage {
    #[prost(uint32, tag = "1")]
    pub message_type: u32,
    #[prost(oneof = "wallet_coordinator_message::Payload", tags = "2, 3, 4, 5")]
    pub payload: ::core::option::Option<wallet_coordinator_message::Payload>,
}

pub mod wallet_coordinator_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        SigningRequest(super::WalletSigningRequest),
        #[prost(message, tag = "3")]
        SigningResponse(super::WalletSigningResponse),
        #[prost(message, tag = "4")]
        StatusRequest(super::WalletStatusRequest),
        #[prost(message, tag = "5")]
        StatusResponse(super::WalletStatusResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalletRequestHeader {
    #[prost(string, tag = "1")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
    #[prost(string, tag = "3")]
    pub coordinator_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalletResponseHeader {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_message: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "4")]
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalletSigningRequest {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<WalletRequestHeader>,
    #[prost(string, tag = "2")]
    pub key_id: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub transaction_data: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub threshold: u32,
    #[prost(uint32, tag = "5")]
    pub total_shards: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalletSigningResponse {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<WalletResponseHeader>,
    #[prost(string, tag = "2")]
    pub key_id: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub final_signature: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub shard_signatures: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(uint32, tag = "5")]
    pub successful_shards: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalletStatusRequest {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<WalletRequestHeader>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalletNodeStatus {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub platform: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub connected: bool,
    #[prost(uint32, tag = "4")]
    pub shard_index: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WalletStatusResponse {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<WalletResponseHeader>,
    #[prost(message, repeated, tag = "2")]
    pub nodes: ::prost::alloc::vec::Vec<WalletNodeStatus>,
    #[prost(uint32, tag = "3")]
    pub total_nodes: u32,
    #[prost(uint32, tag = "4")]
    pub connected_nodes: u32,
    #[prost(uint64, tag = "5")]
    pub uptime_seconds: u64,
}

// ---------------------------------------------------------------------------
// Convenience constructors
// ---------------------------------------------------------------------------

impl CoordinatorNodeMessage {
    pub fn signing_request(message_type: u32, request: SigningPhaseRequest) -> Self {
        Self {
            message_type,
            payload: Some(coordinator_node_message::Payload::SigningRequest(request)),
        }
    }

    pub fn signing_response(message_type: u32, response: SigningPhaseResponse) -> Self {
        Self {
            message_type,
            payload: Some(coordinator_node_message::Payload::SigningResponse(response)),
        }
    }

    pub fn keygen_request(request: KeygenPhaseRequest) -> Self {
        Self {
            message_type: super::frame::MessageType::Keygen.as_u16() as u32,
            payload: Some(coordinator_node_message::Payload::KeygenRequest(request)),
        }
    }

    pub fn keygen_response(response: KeygenPhaseResponse) -> Self {
        Self {
            message_type: super::frame::MessageType::Keygen.as_u16() as u32,
            payload: Some(coordinator_node_message::Payload::KeygenResponse(response)),
        }
    }

    pub fn error(original_message_type: u32, error_message: impl Into<String>) -> Self {
        Self {
            message_type: super::frame::MessageType::Error.as_u16() as u32,
            payload: Some(coordinator_node_message::Payload::Error(ErrorResponse {
                original_message_type,
                error_message: error_message.into(),
            })),
        }
    }

    /// Whether the payload reports success. Error payloads and absent
    /// payloads count as failures.
    pub fn is_success(&self) -> bool {
        match &self.payload {
            Some(coordinator_node_message::Payload::SigningResponse(r)) => r.success,
            Some(coordinator_node_message::Payload::KeygenResponse(r)) => r.success,
            _ => false,
        }
    }
}

impl RsAndCommitments {
    pub fn new(
        rs: HashMap<u64, Vec<u8>>,
        commitments: HashMap<u64, Vec<u8>>,
    ) -> Self {
        Self { rs, commitments }
    }
}

/// Encode any prost message to bytes.
pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

/// Decode a prost message from bytes.
pub fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M, prost::DecodeError> {
    M::decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_request_round_trip() {
        let mut artifacts = HashMap::new();
        artifacts.insert(0u64, vec![1, 2, 3]);
        artifacts.insert(1u64, vec![4, 5, 6]);

        let request = SigningPhaseRequest {
            algorithm: 0,
            phase: 2,
            key_id: "k1".to_string(),
            tx_id: "tx-9".to_string(),
            player_id: 1,
            player_ids: vec![0, 1, 2],
            message: vec![0xAB; 32],
            artifacts,
            aux_artifacts: HashMap::new(),
        };
        let wrapped = CoordinatorNodeMessage::signing_request(0, request.clone());

        let bytes = encode(&wrapped);
        let decoded: CoordinatorNodeMessage = decode(&bytes).unwrap();
        assert_eq!(decoded, wrapped);
        match decoded.payload {
            Some(coordinator_node_message::Payload::SigningRequest(r)) => {
                assert_eq!(r, request);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_wallet_message_round_trip() {
        let request = WalletSigningRequest {
            header: Some(WalletRequestHeader {
                request_id: "req-1".to_string(),
                timestamp: 1_700_000_000,
                coordinator_id: "coord-1".to_string(),
            }),
            key_id: "k1".to_string(),
            transaction_data: vec![0x01; 32],
            threshold: 2,
            total_shards: 3,
        };
        let message = WalletCoordinatorMessage {
            message_type: WALLET_SIGNING_REQUEST,
            payload: Some(wallet_coordinator_message::Payload::SigningRequest(
                request,
            )),
        };

        let decoded: WalletCoordinatorMessage = decode(&encode(&message)).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.message_type, WALLET_SIGNING_REQUEST);
    }

    #[test]
    fn test_garbage_bytes_fail_decode() {
        assert!(decode::<WalletCoordinatorMessage>(&[0xFF, 0xFF, 0xFF, 0x07]).is_err());
    }

    #[test]
    fn test_error_payload_is_not_success() {
        let message = CoordinatorNodeMessage::error(0, "unbound message type");
        assert!(!message.is_success());
    }
}
