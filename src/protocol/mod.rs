//! # Messaging Protocol
//!
//! Packets, the envelopes that carry them, and the machinery that routes a received
//! envelope to its handler.
//!
//! ## Components
//! - **Packet**: application message schemas with a stable type tag and a target channel
//! - **Envelope**: packet payload plus sender, channel, id, timestamp and optional signature
//! - **Registry**: type tag to (decoder, handler) table; frames and checks envelopes
//! - **Dispatcher**: runs the one handler for an envelope and reports a `Response`
//! - **Message**: what a frame can carry (envelope, response, hello)
//! - **Signing**: HMAC-SHA256 envelope signatures with a shared secret

pub mod dispatcher;
pub mod envelope;
pub mod message;
pub mod packet;
pub mod registry;
pub mod response;
pub mod signing;
