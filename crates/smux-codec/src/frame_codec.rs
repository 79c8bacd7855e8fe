//! SMUX frame codec implementation.

use bytes::{BufMut, Bytes, BytesMut};
use smux_protocol::{SMUX_HEADER_SIZE, SmuxHeader};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// Default maximum frame size accepted by the codec (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// An SMUX frame with header and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header.
    pub header: SmuxHeader,
    /// Frame payload (excluding header). Empty for control frames.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given header and payload.
    #[must_use]
    pub fn new(header: SmuxHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a payload-less control frame.
    #[must_use]
    pub fn control(header: SmuxHeader) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Get the total frame size including header.
    #[must_use]
    pub fn total_size(&self) -> usize {
        SMUX_HEADER_SIZE + self.payload.len()
    }
}

/// SMUX frame codec for tokio-util framing.
///
/// Handles the low-level encoding and decoding of SMUX frames over a byte
/// stream, reassembling frames split across TCP segments.
#[derive(Debug, Clone)]
pub struct SmuxCodec {
    /// Maximum frame size to accept.
    max_frame_size: usize,
}

impl SmuxCodec {
    /// Create a new SMUX codec with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a new SMUX codec with a custom maximum frame size.
    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.max(SMUX_HEADER_SIZE);
        self
    }

    /// Get the configured maximum frame size.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for SmuxCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SmuxCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least a header to proceed
        if src.len() < SMUX_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the total length (little-endian u32 at offset 4)
        let length = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;

        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        // Check if we have the complete frame
        if src.len() < length.max(SMUX_HEADER_SIZE) {
            src.reserve(length - src.len());
            return Ok(None);
        }

        // Parse the header; validates protocol id, flags and length
        let mut cursor = &src[..SMUX_HEADER_SIZE];
        let header = SmuxHeader::decode(&mut cursor)?;

        let frame_bytes = src.split_to(length);
        let payload = Bytes::copy_from_slice(&frame_bytes[SMUX_HEADER_SIZE..]);

        tracing::trace!(
            flags = ?header.flags,
            session_id = header.session_id,
            seq = header.sequence_number,
            highwater = header.highwater,
            length = length,
            "decoded SMUX frame"
        );

        Ok(Some(Frame::new(header, payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            // Bytes left over at EOF mean the peer vanished mid-frame.
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for SmuxCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_length = item.total_size();

        if total_length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: total_length,
                max: self.max_frame_size,
            });
        }

        dst.reserve(total_length);

        // Fix up the length so header and payload can never disagree
        let mut header = item.header;
        header.length = total_length as u32;

        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            flags = ?header.flags,
            session_id = header.session_id,
            seq = header.sequence_number,
            highwater = header.highwater,
            length = total_length,
            "encoded SMUX frame"
        );

        Ok(())
    }
}
