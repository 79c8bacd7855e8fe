//! SMUX frame header definitions.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// SMUX frame header size in bytes.
pub const SMUX_HEADER_SIZE: usize = 16;

/// SMUX protocol identifier (first byte of every frame).
pub const SMUX_PROTOCOL_ID: u8 = 83;

bitflags! {
    /// SMUX frame type flags.
    ///
    /// Exactly one flag is set per frame. SYN opens a session, DATA carries
    /// payload, ACK grants flow-control credit, FIN closes a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SmuxFlags: u8 {
        /// Session open.
        const SYN = 0x01;
        /// Flow-control acknowledgement.
        const ACK = 0x02;
        /// Session close.
        const FIN = 0x04;
        /// Payload-bearing frame.
        const DATA = 0x08;
    }
}

impl SmuxFlags {
    /// Whether this frame type carries no payload and no fresh sequence number.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        !self.contains(Self::DATA)
    }
}

/// SMUX frame header.
///
/// Every SMUX frame begins with a fixed 16-byte header. Multi-byte fields
/// are little-endian, matching what the endpoints settle on during the
/// initial exchange (constant thereafter).
///
/// Layout: `protocol_id: u8, flags: u8, session_id: u16, length: u32,
/// sequence_number: u32, highwater: u32`, followed by
/// `length - SMUX_HEADER_SIZE` payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmuxHeader {
    /// Frame type flags.
    pub flags: SmuxFlags,
    /// Session this frame belongs to.
    pub session_id: u16,
    /// Total frame length including the header.
    pub length: u32,
    /// Per-session send sequence number.
    pub sequence_number: u32,
    /// Sender's receive highwater mark (flow-control credit for the peer).
    pub highwater: u32,
}

impl SmuxHeader {
    /// Build a DATA frame header for a payload of `payload_len` bytes.
    #[must_use]
    pub fn data(session_id: u16, sequence_number: u32, highwater: u32, payload_len: usize) -> Self {
        Self {
            flags: SmuxFlags::DATA,
            session_id,
            length: (SMUX_HEADER_SIZE + payload_len) as u32,
            sequence_number,
            highwater,
        }
    }

    /// Build a payload-less control frame header (SYN, ACK or FIN).
    #[must_use]
    pub fn control(flags: SmuxFlags, session_id: u16, sequence_number: u32, highwater: u32) -> Self {
        Self {
            flags,
            session_id,
            length: SMUX_HEADER_SIZE as u32,
            sequence_number,
            highwater,
        }
    }

    /// Parse a header from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < SMUX_HEADER_SIZE {
            return Err(ProtocolError::IncompleteHeader {
                expected: SMUX_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let protocol_id = src.get_u8();
        if protocol_id != SMUX_PROTOCOL_ID {
            return Err(ProtocolError::InvalidProtocolId(protocol_id));
        }

        let flags_byte = src.get_u8();
        let flags =
            SmuxFlags::from_bits(flags_byte).ok_or(ProtocolError::InvalidFlags(flags_byte))?;

        let session_id = src.get_u16_le();
        let length = src.get_u32_le();
        if (length as usize) < SMUX_HEADER_SIZE {
            return Err(ProtocolError::InvalidLength(length));
        }

        let sequence_number = src.get_u32_le();
        let highwater = src.get_u32_le();

        Ok(Self {
            flags,
            session_id,
            length,
            sequence_number,
            highwater,
        })
    }

    /// Encode the header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(SMUX_PROTOCOL_ID);
        dst.put_u8(self.flags.bits());
        dst.put_u16_le(self.session_id);
        dst.put_u32_le(self.length);
        dst.put_u32_le(self.sequence_number);
        dst.put_u32_le(self.highwater);
    }

    /// Encode the header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SMUX_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Get the payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        (self.length as usize).saturating_sub(SMUX_HEADER_SIZE)
    }

    /// Whether this is a payload-less control frame.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        self.flags.is_control()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = SmuxHeader {
            flags: SmuxFlags::DATA,
            session_id: 7,
            length: 100,
            sequence_number: 42,
            highwater: 12,
        };

        let bytes = header.encode_to_bytes();
        assert_eq!(bytes.len(), SMUX_HEADER_SIZE);

        let mut cursor = bytes.as_ref();
        let decoded = SmuxHeader::decode(&mut cursor).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_control_header_has_no_payload() {
        let header = SmuxHeader::control(SmuxFlags::SYN, 1, 0, 4);
        assert_eq!(header.length, SMUX_HEADER_SIZE as u32);
        assert_eq!(header.payload_length(), 0);
        assert!(header.is_control());
    }

    #[test]
    fn test_data_header_length() {
        let header = SmuxHeader::data(3, 0, 4, 92);
        assert_eq!(header.payload_length(), 92);
        assert!(!header.is_control());
    }

    #[test]
    fn test_decode_rejects_bad_protocol_id() {
        let mut bytes = BytesMut::from(&[0u8; SMUX_HEADER_SIZE][..]);
        bytes[0] = 0x42;
        let err = SmuxHeader::decode(&mut bytes.as_ref()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidProtocolId(0x42));
    }

    #[test]
    fn test_decode_rejects_unknown_flags() {
        let header = SmuxHeader::control(SmuxFlags::ACK, 1, 0, 4);
        let mut bytes = BytesMut::from(header.encode_to_bytes().as_ref());
        bytes[1] = 0x80;
        let err = SmuxHeader::decode(&mut bytes.as_ref()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidFlags(0x80));
    }

    #[test]
    fn test_decode_rejects_short_length() {
        let mut header = SmuxHeader::control(SmuxFlags::ACK, 1, 0, 4);
        header.length = 4;
        let bytes = header.encode_to_bytes();
        let err = SmuxHeader::decode(&mut bytes.as_ref()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidLength(4));
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let header = SmuxHeader::control(SmuxFlags::FIN, 1, 0, 4);
        let bytes = header.encode_to_bytes();
        let err = SmuxHeader::decode(&mut &bytes[..10]).unwrap_err();
        assert!(matches!(err, ProtocolError::IncompleteHeader { .. }));
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            flags in prop::sample::select(vec![
                SmuxFlags::SYN,
                SmuxFlags::ACK,
                SmuxFlags::FIN,
                SmuxFlags::DATA,
            ]),
            session_id in any::<u16>(),
            payload_len in 0usize..65536,
            sequence_number in any::<u32>(),
            highwater in any::<u32>(),
        ) {
            let header = SmuxHeader {
                flags,
                session_id,
                length: (SMUX_HEADER_SIZE + payload_len) as u32,
                sequence_number,
                highwater,
            };

            let bytes = header.encode_to_bytes();
            let decoded = SmuxHeader::decode(&mut bytes.as_ref()).unwrap();
            prop_assert_eq!(header, decoded);
        }
    }
}
