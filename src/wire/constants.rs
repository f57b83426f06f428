/// Network magic value used in the Bitmessage message header.
///
/// The first 4 bytes of every message identify the network and act as a
/// message boundary marker in the TCP stream. When the reader loses track of
/// where a frame starts (for example after a malformed message) it scans
/// forward for this sequence.
///
/// On the wire it is `E9 BE B4 D9`.
pub const MAGIC: u32 = 0xE9BEB4D9;

/// [`MAGIC`] as it appears in the byte stream.
pub const MAGIC_BYTES: [u8; 4] = MAGIC.to_be_bytes();

/// Size of the fixed message header: magic, command, length and checksum.
pub const HEADER_LEN: usize = 24;

/// Width of the NUL-padded command field.
pub const COMMAND_LEN: usize = 12;

/// Protocol version advertised in our `version` message.
pub const PROTOCOL_VERSION: i32 = 2;

/// Oldest peer protocol version we complete a handshake with.
pub const MIN_PROTOCOL_VERSION: i32 = 2;

/// Default upper bound for a payload, checked before the payload is read.
pub const MAX_PAYLOAD_LEN: u32 = 1_600_100;

/// Maximum number of entries in an `addr` message.
pub const MAX_ADDR_ENTRIES: usize = 1000;

/// Maximum number of entries in an `inv` or `getdata` message.
pub const MAX_INV_ENTRIES: usize = 50_000;

/// The default, genesis stream every node joins.
pub const STREAM_ONE: u32 = 1;

/// Default TCP port of a Bitmessage node.
pub const DEFAULT_PORT: u16 = 8444;

/// User agent sent in our `version` message.
pub const USER_AGENT: &str = concat!("/bitmessage-rs:", env!("CARGO_PKG_VERSION"), "/");
