use serde::de::DeserializeOwned;
use serde::Serialize;

/// Channel value addressing every peer.
pub const BROADCAST: &str = "*";

/// An application-defined message schema.
///
/// `TYPE_ID` is the tag written into every envelope and must stay stable across releases;
/// renaming it is a wire-breaking change.
///
/// ```
/// use interlink::protocol::packet::Packet;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping {
///     target: String,
/// }
///
/// impl Packet for Ping {
///     const TYPE_ID: &'static str = "ping";
///
///     fn channel(&self) -> &str {
///         &self.target
///     }
/// }
/// ```
pub trait Packet: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_ID: &'static str;

    /// Server name this packet is addressed to, or [`BROADCAST`].
    fn channel(&self) -> &str;
}

/// Metadata about the envelope a packet arrived in, handed to handlers next to the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub sender: String,
    pub channel: String,
    pub id: u64,
    pub timestamp: u64,
}

impl Origin {
    pub fn is_broadcast(&self) -> bool {
        self.channel == BROADCAST
    }
}
