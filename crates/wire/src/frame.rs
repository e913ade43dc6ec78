//! Length-prefixed frame codec for the coordinator↔node stream.
//!
//! Layout (packed, little-endian, 32 bytes):
//! magic:u32, version:u16, message_type:u16, body_length:u32, checksum:u32,
//! timestamp:u64, request_id:u64. The body follows immediately.
//!
//! The codec only reports validation failures; closing the connection on a
//! non-OK result is the caller's job.

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// "MPCE"
pub const MAGIC_NUMBER: u32 = 0x4D50_4345;
pub const PROTOCOL_VERSION: u16 = 0x0001;
pub const HEADER_LEN: usize = 32;
pub const MAX_BODY_SIZE: u32 = 1024 * 1024;

/// Frame types carried in the header. Values ≥ `MessageType::COUNT` are
/// rejected as `InvalidMessageType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    EcdsaSign = 0,
    EddsaSign = 1,
    Keygen = 2,
    Error = 3,
}

impl MessageType {
    pub const COUNT: u16 = 4;

    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(MessageType::EcdsaSign),
            1 => Some(MessageType::EddsaSign),
            2 => Some(MessageType::Keygen),
            3 => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}

/// Frame validation failures, in the order checks are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("invalid protocol version")]
    InvalidVersion,
    #[error("body too large")]
    BodyTooLarge,
    #[error("body size mismatch")]
    BodySizeMismatch,
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("corrupted data")]
    CorruptedData,
}

/// XOR of little-endian 4-byte chunks; a trailing partial chunk is
/// zero-extended. Catches silent corruption only, not tampering.
pub fn checksum(body: &[u8]) -> u32 {
    let mut acc = 0u32;
    for chunk in body.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        acc ^= u32::from_le_bytes(word);
    }
    acc
}

/// The fixed 32-byte header. `message_type` stays raw so that frames with
/// out-of-range types can be decoded far enough to be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub message_type: u16,
    pub body_length: u32,
    pub checksum: u32,
    pub timestamp: u64,
    pub request_id: u64,
}

impl FrameHeader {
    pub fn new(message_type: MessageType, body_length: u32, checksum: u32, request_id: u64) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            message_type: message_type.as_u16(),
            body_length,
            checksum,
            timestamp: unix_millis(),
            request_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.message_type.to_le_bytes());
        buf[8..12].copy_from_slice(&self.body_length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[24..32].copy_from_slice(&self.request_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap_or_default()),
            version: u16::from_le_bytes(buf[4..6].try_into().unwrap_or_default()),
            message_type: u16::from_le_bytes(buf[6..8].try_into().unwrap_or_default()),
            body_length: u32::from_le_bytes(buf[8..12].try_into().unwrap_or_default()),
            checksum: u32::from_le_bytes(buf[12..16].try_into().unwrap_or_default()),
            timestamp: u64::from_le_bytes(buf[16..24].try_into().unwrap_or_default()),
            request_id: u64::from_le_bytes(buf[24..32].try_into().unwrap_or_default()),
        }
    }

    /// Checks a receiver can run before reading the body: magic, version,
    /// body length bound, and message type range.
    pub fn validate_basic(&self) -> Result<(), ValidationError> {
        if self.magic != MAGIC_NUMBER {
            return Err(ValidationError::InvalidMagic);
        }
        if self.version != PROTOCOL_VERSION {
            return Err(ValidationError::InvalidVersion);
        }
        if self.body_length > MAX_BODY_SIZE {
            return Err(ValidationError::BodyTooLarge);
        }
        if MessageType::from_u16(self.message_type).is_none() {
            return Err(ValidationError::InvalidMessageType);
        }
        Ok(())
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.message_type)
    }
}

/// One framed message: header plus body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

impl Frame {
    /// Build a frame for `body`, computing length and checksum.
    pub fn new(message_type: MessageType, request_id: u64, body: Vec<u8>) -> Self {
        let header = FrameHeader::new(message_type, body.len() as u32, checksum(&body), request_id);
        Self { header, body }
    }

    /// Serialize header followed by body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Decode a complete frame from a buffer. Validation is the caller's
    /// next step; this only requires enough bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ValidationError> {
        if buf.len() < HEADER_LEN {
            return Err(ValidationError::CorruptedData);
        }
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&buf[..HEADER_LEN]);
        let header = FrameHeader::from_bytes(&header_bytes);
        header.validate_basic()?;
        if buf.len() - HEADER_LEN != header.body_length as usize {
            return Err(ValidationError::BodySizeMismatch);
        }
        let frame = Self {
            header,
            body: buf[HEADER_LEN..].to_vec(),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Full validation: header basics, declared vs actual body size, and
    /// body checksum.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.header.validate_basic()?;
        if self.body.len() != self.header.body_length as usize {
            return Err(ValidationError::BodySizeMismatch);
        }
        if checksum(&self.body) != self.header.checksum {
            return Err(ValidationError::ChecksumMismatch);
        }
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = Frame::new(MessageType::EcdsaSign, 42, b"phase one payload".to_vec());
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_LEN + frame.body.len());

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.header.request_id, 42);
        assert_eq!(decoded.header.message_type(), Some(MessageType::EcdsaSign));
    }

    #[test]
    fn test_empty_body_round_trip() {
        let frame = Frame::new(MessageType::Error, 1, Vec::new());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.header.body_length, 0);
        assert_eq!(decoded.header.checksum, 0);
    }

    #[test]
    fn test_checksum_xor_of_le_chunks() {
        // 8 aligned bytes: two LE words.
        let body = [0x01, 0x02, 0x03, 0x04, 0x10, 0x20, 0x30, 0x40];
        let expected = u32::from_le_bytes([0x01, 0x02, 0x03, 0x04])
            ^ u32::from_le_bytes([0x10, 0x20, 0x30, 0x40]);
        assert_eq!(checksum(&body), expected);

        // Trailing partial chunk is zero-extended.
        let body = [0xFF, 0xEE, 0xDD];
        assert_eq!(checksum(&body), u32::from_le_bytes([0xFF, 0xEE, 0xDD, 0x00]));

        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let mut frame = Frame::new(MessageType::Keygen, 7, b"abc".to_vec());
        frame.header.magic = 0xDEAD_BEEF;
        assert_eq!(frame.validate(), Err(ValidationError::InvalidMagic));
        assert_eq!(
            Frame::decode(&frame.encode()),
            Err(ValidationError::InvalidMagic)
        );
    }

    #[test]
    fn test_invalid_version_rejected() {
        let mut frame = Frame::new(MessageType::Keygen, 7, b"abc".to_vec());
        frame.header.version = 0x0002;
        assert_eq!(frame.validate(), Err(ValidationError::InvalidVersion));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut frame = Frame::new(MessageType::EcdsaSign, 7, vec![0u8; 16]);
        frame.header.body_length = MAX_BODY_SIZE + 1;
        assert_eq!(frame.header.validate_basic(), Err(ValidationError::BodyTooLarge));
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let mut frame = Frame::new(MessageType::EcdsaSign, 7, Vec::new());
        frame.header.message_type = MessageType::COUNT;
        assert_eq!(frame.validate(), Err(ValidationError::InvalidMessageType));
    }

    #[test]
    fn test_body_size_mismatch_rejected() {
        let mut frame = Frame::new(MessageType::EcdsaSign, 7, b"abcd".to_vec());
        frame.header.body_length = 3;
        assert_eq!(frame.validate(), Err(ValidationError::BodySizeMismatch));
    }

    #[test]
    fn test_tampered_body_fails_checksum() {
        let frame = Frame::new(MessageType::EddsaSign, 9, b"some signing artifact".to_vec());
        let mut encoded = frame.encode();
        // Flip one body byte; header (and declared length) untouched.
        encoded[HEADER_LEN + 4] ^= 0x01;
        assert_eq!(
            Frame::decode(&encoded),
            Err(ValidationError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_truncated_buffer_is_corrupted() {
        assert_eq!(Frame::decode(&[0u8; 10]), Err(ValidationError::CorruptedData));
    }
}
