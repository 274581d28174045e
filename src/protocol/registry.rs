//! # Packet Type Registry
//!
//! Maps packet type tags to their decoder and handler.
//!
//! A registry is a plain owned value; each [`Dispatcher`](crate::protocol::dispatcher::Dispatcher)
//! holds one behind an `Arc`. Independent registries never share state, which keeps tests and
//! multi-network hosts isolated.
//!
//! Registering a type id that is already bound fails with
//! [`ProtocolError::DuplicateRegistration`]. Replacing a handler requires an explicit
//! [`Registry::unregister`] first.

use crate::core::frame::{Frame, FrameKind};
use crate::core::serialization::{SerializationFormat, WireFormat};
use crate::error::constants::{ERR_REGISTRY_READ_LOCK, ERR_REGISTRY_WRITE_LOCK};
use crate::error::{DecodeError, ProtocolError, Result};
use crate::protocol::envelope::Envelope;
use crate::protocol::message::WireMessage;
use crate::protocol::packet::{Origin, Packet};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// What a handler produced: an encoded result or an error description.
pub type HandlerOutcome = std::result::Result<Value, String>;

type Validator = dyn Fn(&Value) -> std::result::Result<(), DecodeError> + Send + Sync;
type Started = std::result::Result<BoxFuture<'static, HandlerOutcome>, DecodeError>;
type Invoker = dyn Fn(&Envelope) -> Started + Send + Sync;

/// A registered (decoder, handler) pair with its types erased.
pub struct Binding {
    validate: Box<Validator>,
    invoke: Box<Invoker>,
}

impl Binding {
    pub(crate) fn validate(&self, payload: &Value) -> std::result::Result<(), DecodeError> {
        (self.validate)(payload)
    }

    /// Decode the payload and start the handler.
    pub(crate) fn invoke(
        &self,
        envelope: &Envelope,
    ) -> std::result::Result<BoxFuture<'static, HandlerOutcome>, DecodeError> {
        (self.invoke)(envelope)
    }
}

pub struct Registry {
    bindings: RwLock<HashMap<String, Arc<Binding>>>,
    format: SerializationFormat,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("format", &self.format)
            .field("type_ids", &self.type_ids())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_format(SerializationFormat::default())
    }

    pub fn with_format(format: SerializationFormat) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            format,
        }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    /// Register a handler for a typed packet; its serde schema is the decoder.
    pub fn register<P, F, Fut, R, E>(&self, handler: F) -> Result<()>
    where
        P: Packet,
        F: Fn(P, Origin) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        self.register_with(
            P::TYPE_ID,
            |payload: &Value| {
                P::deserialize(payload).map_err(|e| DecodeError::SchemaMismatch {
                    type_id: P::TYPE_ID.to_string(),
                    reason: e.to_string(),
                })
            },
            handler,
        )
    }

    /// Register an explicit `(type id, decoder, handler)` triple.
    pub fn register_with<T, D, F, Fut, R, E>(
        &self,
        type_id: impl Into<String>,
        decoder: D,
        handler: F,
    ) -> Result<()>
    where
        T: Send + 'static,
        D: Fn(&Value) -> std::result::Result<T, DecodeError> + Send + Sync + 'static,
        F: Fn(T, Origin) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        let type_id = type_id.into();
        if type_id.is_empty() {
            return Err(ProtocolError::ConfigError(
                "Packet type id cannot be empty".to_string(),
            ));
        }

        let decoder = Arc::new(decoder);
        let validate_with = Arc::clone(&decoder);

        let binding = Binding {
            validate: Box::new(move |payload: &Value| validate_with(payload).map(|_| ())),
            invoke: Box::new(move |envelope: &Envelope| {
                let packet = decoder(envelope.payload())?;
                let pending = handler(packet, envelope.origin());
                Ok(async move {
                    match pending.await {
                        Ok(value) => serde_json::to_value(value)
                            .map_err(|e| format!("Failed to encode handler result: {e}")),
                        Err(e) => Err(e.to_string()),
                    }
                }
                .boxed())
            }),
        };

        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_REGISTRY_WRITE_LOCK.to_string()))?;

        if bindings.contains_key(&type_id) {
            return Err(ProtocolError::DuplicateRegistration(type_id));
        }

        debug!(type_id = %type_id, "Registered packet type");
        bindings.insert(type_id, Arc::new(binding));
        Ok(())
    }

    /// Remove a binding. Returns whether one existed.
    pub fn unregister(&self, type_id: &str) -> Result<bool> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| ProtocolError::Custom(ERR_REGISTRY_WRITE_LOCK.to_string()))?;
        Ok(bindings.remove(type_id).is_some())
    }

    pub fn lookup(&self, type_id: &str) -> Result<Option<Arc<Binding>>> {
        let bindings = self
            .bindings
            .read()
            .map_err(|_| ProtocolError::Custom(ERR_REGISTRY_READ_LOCK.to_string()))?;
        Ok(bindings.get(type_id).cloned())
    }

    pub fn contains(&self, type_id: &str) -> bool {
        matches!(self.lookup(type_id), Ok(Some(_)))
    }

    pub fn type_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .bindings
            .read()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.bindings.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frame an envelope in this registry's format.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let body = envelope.serialize_format(self.format)?;
        Frame::new(FrameKind::Envelope, self.format, body).to_bytes()
    }

    /// Decode a framed envelope and check it against the registered schemas.
    ///
    /// Unknown type tags yield [`DecodeError::UnknownType`]; payloads the registered decoder
    /// refuses yield [`DecodeError::SchemaMismatch`].
    pub fn decode(&self, data: &[u8]) -> std::result::Result<Envelope, DecodeError> {
        let frame = Frame::from_bytes(data).map_err(into_decode_error)?;
        let envelope = match WireMessage::from_frame(&frame)? {
            WireMessage::Envelope(envelope) => envelope,
            _ => {
                return Err(DecodeError::UnexpectedFrame {
                    expected: "envelope",
                })
            }
        };

        let binding = self
            .lookup(envelope.type_id())
            .map_err(into_decode_error)?
            .ok_or_else(|| DecodeError::UnknownType(envelope.type_id().to_string()))?;
        binding.validate(envelope.payload())?;
        Ok(envelope)
    }
}

fn into_decode_error(err: ProtocolError) -> DecodeError {
    match err {
        ProtocolError::Decode(inner) => inner,
        other => DecodeError::Malformed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        target: String,
    }

    impl Packet for Ping {
        const TYPE_ID: &'static str = "ping";

        fn channel(&self) -> &str {
            &self.target
        }
    }

    async fn pong(_: Ping, _: Origin) -> std::result::Result<&'static str, String> {
        Ok("pong")
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry.register(pong).unwrap();

        match registry.register(pong) {
            Err(ProtocolError::DuplicateRegistration(id)) => assert_eq!(id, "ping"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister("ping").unwrap());
        registry.register(pong).unwrap();
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn decode_rejects_unknown_types_and_bad_payloads() {
        let registry = Registry::new();
        registry.register(pong).unwrap();

        let unknown = Envelope::from_parts("teleport", "a", "b", json!({}));
        let bytes = registry.encode(&unknown).unwrap();
        assert_eq!(
            registry.decode(&bytes),
            Err(DecodeError::UnknownType("teleport".into()))
        );

        let bad = Envelope::from_parts("ping", "a", "b", json!({"target": 3}));
        let bytes = registry.encode(&bad).unwrap();
        assert!(matches!(
            registry.decode(&bytes),
            Err(DecodeError::SchemaMismatch { .. })
        ));

        let good = Envelope::from_parts("ping", "a", "b", json!({"target": "b"}));
        let bytes = registry.encode(&good).unwrap();
        assert_eq!(registry.decode(&bytes).unwrap(), good);
    }

    #[test]
    fn decode_never_panics_on_garbage() {
        let registry = Registry::new();
        assert!(registry.decode(&[]).is_err());
        assert!(registry.decode(b"ILNK").is_err());
        assert!(registry.decode(&[0xff; 64]).is_err());
    }

    #[test]
    fn empty_type_id_is_refused() {
        let registry = Registry::new();
        let result = registry.register_with(
            "",
            |v: &Value| Ok(v.clone()),
            |_v: Value, _o: Origin| async { Ok::<_, String>(()) },
        );
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }
}
