//! Bitmessage wire protocol primitives.
//!
//! This module turns raw bytes into typed protocol messages and back.
//!
//! It implements:
//! - Encoding and validation of the 24-byte message header
//!   (magic, NUL-padded command, length, checksum)
//! - Resynchronisation on the magic value after malformed input
//! - Reading and writing frames on any tokio byte stream
//! - Payload codecs for `version`, `addr`, `inv`/`getdata` and the common
//!   object prefix
//!
//! Higher-level message decoding is handled by [`Message`], which converts a
//! [`RawMessage`](message::RawMessage) into strongly typed variants once, so
//! consumers match on an enum instead of command strings.
//!
//! Protocol reference:
//! https://bitmessage.org/wiki/Protocol_specification
pub mod codec;

pub mod decode;
pub mod message;
pub mod payload;

pub mod constants;

pub use codec::{read_message, send_message};
pub use message::{Command, Message, RawMessage};
pub use payload::build_version;
