//! HMAC-SHA256 envelope signatures.
//!
//! Every server sharing a secret can verify that an envelope was produced by a holder of the
//! secret and that none of its fields were altered in transit, including the sender name.

use crate::error::{DecodeError, ProtocolError, Result};
use crate::protocol::envelope::Envelope;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct EnvelopeSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for EnvelopeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeSigner").finish_non_exhaustive()
    }
}

impl EnvelopeSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let key = secret.as_ref().to_vec();
        if key.is_empty() {
            return Err(ProtocolError::ConfigError(
                "Shared secret cannot be empty".to_string(),
            ));
        }
        Ok(Self { key })
    }

    /// Attach a signature, replacing any existing one.
    pub fn sign(&self, envelope: Envelope) -> Result<Envelope> {
        let mut mac = self.mac()?;
        feed(&mut mac, &envelope)?;
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        Ok(envelope.with_signature(signature))
    }

    pub fn verify(&self, envelope: &Envelope) -> std::result::Result<(), DecodeError> {
        let signature = envelope.signature().ok_or(DecodeError::BadSignature)?;
        let expected = STANDARD
            .decode(signature)
            .map_err(|_| DecodeError::BadSignature)?;

        let mut mac = self.mac().map_err(|_| DecodeError::BadSignature)?;
        feed(&mut mac, envelope).map_err(|_| DecodeError::BadSignature)?;
        mac.verify_slice(&expected)
            .map_err(|_| DecodeError::BadSignature)
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid signing key: {e}")))
    }
}

// Fields are length-prefixed so that no two distinct envelopes feed identical bytes.
fn feed(mac: &mut HmacSha256, envelope: &Envelope) -> Result<()> {
    let payload = serde_json::to_vec(envelope.payload())
        .map_err(|e| ProtocolError::SerializeError(e.to_string()))?;

    for field in [
        envelope.type_id().as_bytes(),
        envelope.sender().as_bytes(),
        envelope.channel().as_bytes(),
        payload.as_slice(),
    ] {
        mac.update(&(field.len() as u64).to_be_bytes());
        mac.update(field);
    }
    mac.update(&envelope.id().to_be_bytes());
    mac.update(&envelope.timestamp().to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::serialization::{SerializationFormat, WireFormat};
    use serde_json::json;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn signed_envelope_verifies_after_transport() {
        let signer = EnvelopeSigner::new("network-secret").unwrap();
        let envelope = signer
            .sign(Envelope::from_parts("ping", "a", "b", json!({"nested": {"k": [1, 2]}})))
            .unwrap();

        for format in [SerializationFormat::Json, SerializationFormat::MessagePack] {
            let bytes = envelope.serialize_format(format).unwrap();
            let received = Envelope::deserialize_format(&bytes, format).unwrap();
            assert_eq!(signer.verify(&received), Ok(()));
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn forged_sender_is_rejected() {
        let signer = EnvelopeSigner::new("network-secret").unwrap();
        let envelope = signer
            .sign(Envelope::from_parts("ping", "a", "b", json!(null)))
            .unwrap();

        let mut text = serde_json::to_value(&envelope).unwrap();
        text["sender"] = json!("mallory");
        let forged: Envelope = serde_json::from_value(text).unwrap();

        assert_eq!(signer.verify(&forged), Err(DecodeError::BadSignature));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn other_secret_and_missing_signature_fail() {
        let signer = EnvelopeSigner::new("one").unwrap();
        let other = EnvelopeSigner::new("two").unwrap();
        let unsigned = Envelope::from_parts("ping", "a", "b", json!(null));
        let signed = signer.sign(unsigned.clone()).unwrap();

        assert_eq!(other.verify(&signed), Err(DecodeError::BadSignature));
        assert_eq!(signer.verify(&unsigned), Err(DecodeError::BadSignature));
        assert!(EnvelopeSigner::new("").is_err());
    }
}
