//! # Serialization Formats
//!
//! Body formats for frames. Both supported formats are self-describing, so a peer running
//! an older build can still parse an envelope carrying a packet type it has never heard of
//! and reject it by its `type` tag instead of failing mid-parse.
//!
//! ## Formats
//! - **JSON** (default): human-readable, easiest to inspect on a bus
//! - **MessagePack**: compact binary, encoded with field names so it stays self-describing
//!
//! ## Usage
//! ```ignore
//! use interlink::core::serialization::{SerializationFormat, WireFormat};
//!
//! let bytes = envelope.serialize_format(SerializationFormat::MessagePack)?;
//! let back = Envelope::deserialize_format(&bytes, SerializationFormat::MessagePack)?;
//! ```

use crate::error::{DecodeError, ProtocolError};
use serde::{Deserialize, Serialize};

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Human-readable JSON (default)
    #[default]
    Json,
    /// Compact binary MessagePack
    MessagePack,
}

impl SerializationFormat {
    /// Get the format identifier byte for the frame header
    pub fn format_byte(self) -> u8 {
        match self {
            SerializationFormat::Json => 0x01,
            SerializationFormat::MessagePack => 0x02,
        }
    }

    /// Detect format from identifier byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SerializationFormat::Json),
            0x02 => Some(SerializationFormat::MessagePack),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }
}

/// Trait for wire bodies that can be written in any supported format
pub trait WireFormat: Serialize + for<'de> Deserialize<'de> + Sized {
    /// Serialize to bytes using the specified format
    fn serialize_format(&self, format: SerializationFormat) -> crate::error::Result<Vec<u8>> {
        match format {
            SerializationFormat::Json => {
                serde_json::to_vec(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::MessagePack => rmp_serde::to_vec_named(self)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
        }
    }

    /// Deserialize from bytes using the specified format
    fn deserialize_format(
        data: &[u8],
        format: SerializationFormat,
    ) -> std::result::Result<Self, DecodeError> {
        match format {
            SerializationFormat::Json => {
                serde_json::from_slice(data).map_err(|e| DecodeError::Malformed(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::from_slice(data).map_err(|e| DecodeError::Malformed(e.to_string()))
            }
        }
    }
}

impl<T> WireFormat for T where T: Serialize + for<'de> Deserialize<'de> {}
