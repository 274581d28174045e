//! # interlink
//!
//! Typed, authenticated messaging between independent server processes.
//!
//! Applications define packet types, register one handler per type on a
//! [`Dispatcher`](protocol::dispatcher::Dispatcher), and send packets through a
//! [`Transport`](transport::Transport):
//!
//! - [`PubSubTransport`](transport::pubsub::PubSubTransport) publishes on a shared bus channel
//!   and resolves each send as soon as it is queued.
//! - [`SocketTransport`](transport::socket::SocketTransport) keeps direct TCP links to known
//!   peers and resolves each send with the remote handler's response.
//!
//! ```no_run
//! use interlink::config::MessagingConfig;
//! use interlink::protocol::dispatcher::Dispatcher;
//! use interlink::protocol::packet::{Origin, Packet};
//! use interlink::transport::socket::SocketTransport;
//! use interlink::transport::Transport;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping {
//!     target: String,
//! }
//!
//! impl Packet for Ping {
//!     const TYPE_ID: &'static str = "ping";
//!
//!     fn channel(&self) -> &str {
//!         &self.target
//!     }
//! }
//!
//! # async fn run() -> interlink::error::Result<()> {
//! let config = MessagingConfig::from_file("interlink.toml")?;
//! let dispatcher = Dispatcher::from_config(&config.dispatch);
//! dispatcher.register(|_ping: Ping, origin: Origin| async move {
//!     Ok::<_, String>(format!("pong to {}", origin.sender))
//! })?;
//!
//! let transport = SocketTransport::bind(&config, dispatcher).await?;
//! let response = transport.send(&Ping { target: "lobby-2".into() })?.await;
//! println!("{:?}", response.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use error::{DecodeError, ProtocolError, Result};
pub use protocol::dispatcher::Dispatcher;
pub use protocol::envelope::Envelope;
pub use protocol::packet::{Origin, Packet, BROADCAST};
pub use protocol::registry::Registry;
pub use protocol::response::{Response, Status};
pub use transport::{PendingResponse, Transport};
