//! # Core Wire Components
//!
//! Low-level framing and serialization shared by every transport.
//!
//! ## Components
//! - **Frame**: binary frame with magic bytes, version, kind and format tags
//! - **Codec**: Tokio codec for framing over byte streams
//! - **Serialization**: self-describing body formats (JSON, MessagePack)
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Kind(1)] [Format(1)] [Length(4)] [Body(N)]
//! ```
//!
//! Only the magic bytes and the length are interpreted while framing. Version, kind and
//! format are checked when a frame is turned into a message, so a frame carrying a bad tag
//! or a bad body can be skipped without losing the stream position.

pub mod codec;
pub mod frame;
pub mod serialization;
