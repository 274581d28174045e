use crate::config::{MAGIC_BYTES, MAX_FRAME_SIZE};
use crate::core::frame::{Frame, HEADER_LEN};
use crate::error::{DecodeError, ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length-prefixed frame codec.
///
/// Errors returned from `decode` end the stream, so they are reserved for cases where the
/// stream position can no longer be trusted: bad magic bytes or a length over the limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        if src[..4] != MAGIC_BYTES {
            return Err(DecodeError::InvalidHeader.into());
        }

        let len = u32::from_be_bytes([src[7], src[8], src[9], src[10]]) as usize;
        if len > self.max_frame_size {
            return Err(DecodeError::OversizedFrame(len).into());
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let version = src[4];
        let kind = src[5];
        let format = src[6];
        src.advance(HEADER_LEN);
        let body = src.split_to(len).to_vec();

        Ok(Some(Frame {
            version,
            kind,
            format,
            body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.body.len() > self.max_frame_size {
            return Err(DecodeError::OversizedFrame(frame.body.len()).into());
        }

        dst.reserve(HEADER_LEN + frame.body.len());
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(frame.version);
        dst.put_u8(frame.kind);
        dst.put_u8(frame.format);
        dst.put_u32(frame.body.len() as u32);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::FrameKind;
    use crate::core::serialization::SerializationFormat;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn decodes_back_to_back_frames_from_partial_reads() {
        let mut codec = FrameCodec::default();
        let first = Frame::new(FrameKind::Envelope, SerializationFormat::Json, b"one".to_vec());
        let second = Frame::new(FrameKind::Response, SerializationFormat::Json, b"two".to_vec());

        let mut wire = BytesMut::new();
        codec.encode(first.clone(), &mut wire).unwrap();
        codec.encode(second.clone(), &mut wire).unwrap();

        // Feed the stream in two uneven chunks.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[5..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC_BYTES);
        buf.put_slice(&[1, 1, 1]);
        buf.put_u32(4096);

        match codec.decode(&mut buf) {
            Err(ProtocolError::Decode(DecodeError::OversizedFrame(4096))) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn oversized_body_is_not_encoded() {
        let mut codec = FrameCodec::new(4);
        let frame = Frame::new(FrameKind::Envelope, SerializationFormat::Json, vec![0; 5]);
        let mut buf = BytesMut::new();
        assert!(codec.encode(frame, &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
