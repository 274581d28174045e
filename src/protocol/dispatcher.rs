use crate::config::DispatchConfig;
use crate::error::constants::ERR_HANDLER_PANICKED;
use crate::error::Result;
use crate::protocol::envelope::Envelope;
use crate::protocol::packet::{Origin, Packet};
use crate::protocol::registry::{HandlerOutcome, Registry};
use crate::protocol::response::Response;
use crate::utils::metrics::{Metrics, Timer};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes envelopes to the single handler registered for their type.
///
/// Missing handlers, decode failures, handler errors and handler panics all come back as
/// [`Response`] values; nothing escapes to the transport flow that called `dispatch`.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(Registry::new()))
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_metrics(registry, Arc::new(Metrics::new()))
    }

    /// A dispatcher over an empty registry that encodes in the configured format.
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(Arc::new(Registry::with_format(config.format)))
    }

    pub fn with_metrics(registry: Arc<Registry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn register<P, F, Fut, R, E>(&self, handler: F) -> Result<()>
    where
        P: Packet,
        F: Fn(P, Origin) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        self.registry.register(handler)
    }

    pub fn register_with<T, D, F, Fut, R, E>(
        &self,
        type_id: impl Into<String>,
        decoder: D,
        handler: F,
    ) -> Result<()>
    where
        T: Send + 'static,
        D: Fn(&Value) -> std::result::Result<T, crate::error::DecodeError> + Send + Sync + 'static,
        F: Fn(T, Origin) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        self.registry.register_with(type_id, decoder, handler)
    }

    /// Run the handler for `envelope` and describe the outcome.
    pub async fn dispatch(&self, envelope: Envelope) -> Response {
        let _timer = Timer::start("dispatch");

        let binding = match self.registry.lookup(envelope.type_id()) {
            Ok(Some(binding)) => binding,
            Ok(None) => {
                self.metrics.no_handler();
                debug!(
                    type_id = envelope.type_id(),
                    sender = envelope.sender(),
                    "No handler registered"
                );
                return Response::no_handler(envelope.type_id());
            }
            Err(e) => return Response::error(e.to_string()),
        };

        let started = std::panic::catch_unwind(AssertUnwindSafe(|| binding.invoke(&envelope)));
        let pending = match started {
            Ok(Ok(pending)) => pending,
            Ok(Err(e)) => {
                self.metrics.decode_error();
                warn!(
                    type_id = envelope.type_id(),
                    sender = envelope.sender(),
                    error = %e,
                    "Payload rejected by decoder"
                );
                return Response::error(e.to_string());
            }
            Err(panic) => return self.handler_failed(&envelope, panic_message(panic)),
        };

        match AssertUnwindSafe(pending).catch_unwind().await {
            Ok(outcome) => self.complete(&envelope, outcome),
            Err(panic) => self.handler_failed(&envelope, panic_message(panic)),
        }
    }

    fn complete(&self, envelope: &Envelope, outcome: HandlerOutcome) -> Response {
        match outcome {
            Ok(value) => Response::success(value),
            Err(message) => self.handler_failed(envelope, message),
        }
    }

    fn handler_failed(&self, envelope: &Envelope, message: String) -> Response {
        self.metrics.handler_error();
        warn!(
            type_id = envelope.type_id(),
            sender = envelope.sender(),
            error = %message,
            "Handler failed"
        );
        Response::error(message)
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("{ERR_HANDLER_PANICKED}: {detail}"),
        None => ERR_HANDLER_PANICKED.to_string(),
    }
}
