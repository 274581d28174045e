use crate::config::PROTOCOL_VERSION;
use crate::core::frame::{Frame, FrameKind};
use crate::core::serialization::{SerializationFormat, WireFormat};
use crate::error::{DecodeError, Result};
use crate::protocol::envelope::Envelope;
use crate::protocol::response::{Response, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything that can travel inside a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Envelope(Envelope),
    Response { in_reply_to: u64, response: Response },
    Hello { server: String },
}

#[derive(Serialize, Deserialize)]
struct ReplyBody {
    in_reply_to: u64,
    status: Status,
    #[serde(default)]
    payload: Value,
}

#[derive(Serialize, Deserialize)]
struct HelloBody {
    server: String,
    version: u8,
}

impl WireMessage {
    pub fn kind(&self) -> FrameKind {
        match self {
            WireMessage::Envelope(_) => FrameKind::Envelope,
            WireMessage::Response { .. } => FrameKind::Response,
            WireMessage::Hello { .. } => FrameKind::Hello,
        }
    }

    pub fn to_frame(&self, format: SerializationFormat) -> Result<Frame> {
        let body = match self {
            WireMessage::Envelope(envelope) => envelope.serialize_format(format)?,
            WireMessage::Response {
                in_reply_to,
                response,
            } => ReplyBody {
                in_reply_to: *in_reply_to,
                status: response.status,
                payload: response.payload.clone(),
            }
            .serialize_format(format)?,
            WireMessage::Hello { server } => HelloBody {
                server: server.clone(),
                version: PROTOCOL_VERSION,
            }
            .serialize_format(format)?,
        };
        Ok(Frame::new(self.kind(), format, body))
    }

    /// Interpret a frame. Any failure here concerns this frame only.
    pub fn from_frame(frame: &Frame) -> std::result::Result<Self, DecodeError> {
        let kind = frame.kind()?;
        let format = frame.format()?;
        match kind {
            FrameKind::Envelope => Ok(WireMessage::Envelope(Envelope::deserialize_format(
                &frame.body,
                format,
            )?)),
            FrameKind::Response => {
                let body = ReplyBody::deserialize_format(&frame.body, format)?;
                Ok(WireMessage::Response {
                    in_reply_to: body.in_reply_to,
                    response: Response {
                        status: body.status,
                        payload: body.payload,
                    },
                })
            }
            FrameKind::Hello => {
                let body = HelloBody::deserialize_format(&frame.body, format)?;
                if body.version != PROTOCOL_VERSION {
                    return Err(DecodeError::UnsupportedVersion(body.version));
                }
                Ok(WireMessage::Hello {
                    server: body.server,
                })
            }
        }
    }

    /// Convenience for receivers that only accept envelopes (the pub/sub bus).
    pub fn envelope_from_bytes(data: &[u8]) -> Result<Envelope> {
        let frame = Frame::from_bytes(data)?;
        match Self::from_frame(&frame)? {
            WireMessage::Envelope(envelope) => Ok(envelope),
            _ => Err(DecodeError::UnexpectedFrame {
                expected: "envelope",
            }
            .into()),
        }
    }
}
