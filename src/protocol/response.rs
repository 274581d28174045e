use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome class of a dispatched envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Error,
    NoHandler,
    Timeout,
}

/// Result delivered to the caller of `send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub payload: Value,
}

impl Response {
    pub fn success(payload: Value) -> Self {
        Self {
            status: Status::Success,
            payload,
        }
    }

    /// Synthetic acknowledgement for fire-and-forget sends.
    pub fn accepted() -> Self {
        Self::success(Value::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            payload: Value::String(message.into()),
        }
    }

    pub fn no_handler(type_id: &str) -> Self {
        Self {
            status: Status::NoHandler,
            payload: Value::String(type_id.to_string()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: Status::Timeout,
            payload: Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Error or diagnostic text carried in the payload, if any.
    pub fn message(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Decode a successful payload into a concrete type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        if !self.is_success() {
            return None;
        }
        T::deserialize(&self.payload).ok()
    }
}
