use crate::config::{MAGIC_BYTES, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use crate::core::codec::FrameCodec;
use crate::core::serialization::SerializationFormat;
use crate::error::{DecodeError, Result};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 11;

/// What a frame body contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// An [`Envelope`](crate::protocol::envelope::Envelope) to dispatch
    Envelope,
    /// A response correlated to an earlier envelope
    Response,
    /// Connection greeting carrying the sender's server name
    Hello,
}

impl FrameKind {
    pub fn byte(self) -> u8 {
        match self {
            FrameKind::Envelope => 0x01,
            FrameKind::Response => 0x02,
            FrameKind::Hello => 0x03,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Envelope),
            0x02 => Some(FrameKind::Response),
            0x03 => Some(FrameKind::Hello),
            _ => None,
        }
    }
}

/// A single framed unit on the wire.
///
/// Tag bytes are kept raw so that a frame with an unknown kind or format can still be
/// read off the stream and rejected on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub kind: u8,
    pub format: u8,
    pub body: Vec<u8>,
}

impl Frame {
    /// Build a frame at the current protocol version.
    pub fn new(kind: FrameKind, format: SerializationFormat, body: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: kind.byte(),
            format: format.format_byte(),
            body,
        }
    }

    /// Validate the version and kind tags.
    pub fn kind(&self) -> std::result::Result<FrameKind, DecodeError> {
        if self.version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(self.version));
        }
        FrameKind::from_byte(self.kind).ok_or(DecodeError::UnknownKind(self.kind))
    }

    /// Validate the format tag.
    pub fn format(&self) -> std::result::Result<SerializationFormat, DecodeError> {
        SerializationFormat::from_byte(self.format).ok_or(DecodeError::UnknownFormat(self.format))
    }

    /// Total encoded size including header.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Encode into a standalone buffer (used for pub/sub messages).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        FrameCodec::default().encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode exactly one frame from a buffer.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_bytes_with_limit(data, MAX_FRAME_SIZE)
    }

    pub fn from_bytes_with_limit(data: &[u8], max_frame_size: usize) -> Result<Self> {
        let mut buf = BytesMut::from(data);
        let frame = FrameCodec::new(max_frame_size)
            .decode(&mut buf)?
            .ok_or(DecodeError::InvalidHeader)?;

        if !buf.is_empty() {
            return Err(DecodeError::Malformed(format!(
                "{} trailing bytes after frame",
                buf.len()
            ))
            .into());
        }
        Ok(frame)
    }
}
