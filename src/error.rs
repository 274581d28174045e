//! # Error Types
//!
//! Error handling for the messaging layer.
//!
//! Two enums cover the whole crate:
//! - [`DecodeError`]: anything wrong with bytes that arrived from the wire. These are
//!   contained at the transport boundary: the offending message is dropped and logged,
//!   the connection or subscription keeps serving.
//! - [`ProtocolError`]: failures surfaced to callers (registration, send, configuration,
//!   I/O).
//!
//! Handler failures and missing handlers are not errors at this level; the dispatcher
//! turns them into [`Response`](crate::protocol::response::Response) values.
//!
//! ## Example Usage
//! ```rust
//! use interlink::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn lookup(peer: &str) -> Result<&'static str> {
//!     match peer {
//!         "lobby-1" => Ok("10.0.0.1:25590"),
//!         other => Err(ProtocolError::NoConnection(other.to_string())),
//!     }
//! }
//!
//! fn main() {
//!     match lookup("lobby-2") {
//!         Ok(addr) => info!(addr, "Resolved peer"),
//!         Err(e) => error!(error=%e, "Lookup failed"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry lock errors
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on registry";

    /// Connection errors
    pub const ERR_CONNECTION_LOST: &str = "Connection to peer lost before a response arrived";
    pub const ERR_RESPONSE_DROPPED: &str = "Response channel closed without a reply";
    pub const ERR_TRANSPORT_CLOSED: &str = "Transport has been shut down";

    /// Dispatch errors
    pub const ERR_HANDLER_PANICKED: &str = "Handler panicked";
}

/// Failure to interpret bytes received from a peer or the bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Unknown serialization format: {0:#04x}")]
    UnknownFormat(u8),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown packet type: {0}")]
    UnknownType(String),

    #[error("Payload does not match packet type '{type_id}': {reason}")]
    SchemaMismatch { type_id: String, reason: String },

    #[error("Envelope signature rejected")]
    BadSignature,

    #[error("Envelope is older than the accepted window")]
    StaleEnvelope,

    #[error("Unexpected frame, expected {expected}")]
    UnexpectedFrame { expected: &'static str },
}

/// ProtocolError is the primary error type for all messaging operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Packet type already registered: {0}")]
    DuplicateRegistration(String),

    #[error("No connection to peer: {0}")]
    NoConnection(String),

    #[error("Envelope sender '{found}' does not match transport identity '{expected}'")]
    SenderMismatch { expected: String, found: String },

    #[error("Send queue full for {0}")]
    Backpressure(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
