//! Wire frame header (§4.3).
//!
//! Every message on the transport starts with an 8-byte header:
//!
//! ```text
//! u32 object_id | u16 opcode | u16 size_in_qwords
//! ```
//!
//! `size_in_qwords` counts 8-byte words of payload following the header
//! (the payload itself is a sequence of POD records, already 8-byte
//! aligned by construction - see [`crate::pod`]). File descriptors
//! referenced by `Value::Fd` inside the payload travel out-of-band via
//! `SCM_RIGHTS` and are *not* counted here; they are addressed by index
//! into the per-message attached fd array (see [`crate::transport`]).

use crate::error::TransportError;

pub const HEADER_LEN: usize = 8;

/// Maximum payload a single frame may carry, in bytes. `size_in_qwords`
/// is a `u16`, so 8 * u16::MAX is the hard ceiling.
pub const MAX_PAYLOAD_LEN: usize = 8 * u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub object_id: u32,
    pub opcode: u16,
    pub size_in_qwords: u16,
}

impl FrameHeader {
    pub fn payload_len(&self) -> usize {
        self.size_in_qwords as usize * 8
    }

    pub fn new(object_id: u32, opcode: u16, payload_len: usize) -> Result<Self, TransportError> {
        if payload_len % 8 != 0 {
            return Err(TransportError::Pod(crate::error::PodError::MalformedPod(
                "frame payload must be a multiple of 8 bytes",
            )));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(TransportError::MessageTooLarge { size: payload_len, cap: MAX_PAYLOAD_LEN });
        }
        Ok(Self { object_id, opcode, size_in_qwords: (payload_len / 8) as u16 })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.object_id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.opcode.to_le_bytes());
        buf[6..8].copy_from_slice(&self.size_in_qwords.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let object_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let opcode = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        let size_in_qwords = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        Self { object_id, opcode, size_in_qwords }
    }
}

/// A complete frame: header plus payload bytes. The number of fds the
/// accompanying ancillary message carried is tracked separately by the
/// transport - see [`crate::transport::Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(object_id: u32, opcode: u16, payload: Vec<u8>) -> Result<Self, TransportError> {
        let header = FrameHeader::new(object_id, opcode, payload.len())?;
        Ok(Self { header, payload })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader::new(7, 3, 16).unwrap();
        let encoded = header.encode();
        let decoded = FrameHeader::decode(&encoded);
        assert_eq!(header, decoded);
        assert_eq!(decoded.payload_len(), 16);
    }

    #[test]
    fn rejects_unaligned_payload() {
        let err = FrameHeader::new(0, 0, 5).unwrap_err();
        assert!(matches!(err, TransportError::Pod(_)));
    }

    #[test]
    fn rejects_oversized_payload() {
        let err = FrameHeader::new(0, 0, MAX_PAYLOAD_LEN + 8).unwrap_err();
        assert!(matches!(err, TransportError::MessageTooLarge { .. }));
    }

    #[test]
    fn frame_encode_includes_header_and_payload() {
        let frame = Frame::new(1, 2, vec![0u8; 8]).unwrap();
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_LEN + 8);
        assert_eq!(FrameHeader::decode(&encoded[0..8].try_into().unwrap()), frame.header);
    }
}
