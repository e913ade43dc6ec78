//! Wire formats for the MPC signing service.
//!
//! Two layers live here: the fixed 32-byte framed transport used between the
//! coordinator and nodes, and the Protobuf message bodies carried inside the
//! frames (coordinator↔node) and inside HTTPS bodies (wallet↔coordinator).

pub mod frame;
pub mod proto;

pub use frame::{
    checksum, Frame, FrameHeader, MessageType, ValidationError, HEADER_LEN, MAGIC_NUMBER,
    MAX_BODY_SIZE, PROTOCOL_VERSION,
};
