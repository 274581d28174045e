use crate::error::{DecodeError, ProtocolError, Result};
use crate::protocol::packet::{Origin, Packet, BROADCAST};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// The unit actually transmitted: a packet payload plus who sent it and where it goes.
///
/// Envelopes are built once at send time and never mutated afterwards. The only
/// transformation is [`EnvelopeSigner::sign`](crate::protocol::signing::EnvelopeSigner::sign),
/// which consumes an unsigned envelope and returns the signed one before it is transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    type_id: String,
    sender: String,
    channel: String,
    id: u64,
    timestamp: u64,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

impl Envelope {
    /// Wrap a typed packet. A fresh random id and the current time are assigned.
    pub fn new<P: Packet>(packet: &P, sender: impl Into<String>) -> Result<Self> {
        let payload =
            serde_json::to_value(packet).map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
        Ok(Self::from_parts(
            P::TYPE_ID,
            sender,
            packet.channel(),
            payload,
        ))
    }

    /// Build an envelope from an already-encoded payload.
    pub fn from_parts(
        type_id: impl Into<String>,
        sender: impl Into<String>,
        channel: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            type_id: type_id.into(),
            sender: sender.into(),
            channel: channel.into(),
            id: rand::random(),
            timestamp: now_millis(),
            payload,
            signature: None,
        }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn is_broadcast(&self) -> bool {
        self.channel == BROADCAST
    }

    /// Decode the payload as a concrete packet type.
    pub fn packet<P: DeserializeOwned>(&self) -> std::result::Result<P, DecodeError> {
        P::deserialize(&self.payload).map_err(|e| DecodeError::SchemaMismatch {
            type_id: self.type_id.clone(),
            reason: e.to_string(),
        })
    }

    pub fn origin(&self) -> Origin {
        Origin {
            sender: self.sender.clone(),
            channel: self.channel.clone(),
            id: self.id,
            timestamp: self.timestamp,
        }
    }

    /// Milliseconds elapsed since the envelope was created, by the local clock.
    pub fn age_millis(&self) -> u64 {
        now_millis().saturating_sub(self.timestamp)
    }

    pub(crate) fn with_signature(mut self, signature: String) -> Self {
        self.signature = Some(signature);
        self
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
